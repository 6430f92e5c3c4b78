//! Running commands on the production host and the local system.
//!
//! Every side effect a workflow step has on a machine goes through the
//! [`Executor`] trait, so steps can be exercised against a recording fake.
//! [`ProcessExecutor`] is the real implementation and shells out to `ssh`
//! and `rsync`.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use crate::error::{OpsError, Result};

const SSH_OPTIONS: &[&str] = &["-o", "BatchMode=yes", "-o", "ConnectTimeout=15"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub host: String,
    pub user: String,
}

impl RemoteHost {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// A program invocation on the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LocalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Renders the command line with environment values redacted.
impl fmt::Display for LocalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, _) in &self.env {
            write!(f, "{key}=*** ")?;
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote { host: RemoteHost, path: String },
}

impl Location {
    fn render(&self, contents_only: bool) -> String {
        let mut rendered = match self {
            Location::Local(path) => path.display().to_string(),
            Location::Remote { host, path } => format!("{}:{}", host.destination(), path),
        };
        if contents_only && !rendered.ends_with('/') {
            rendered.push('/');
        }
        rendered
    }

    fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }
}

/// A file or tree transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    pub source: Location,
    pub dest: Location,
    /// rsync glob patterns that are never transferred.
    pub excludes: Vec<String>,
    /// rsync size limit such as `2G`; larger files are skipped.
    pub max_size: Option<String>,
    /// Copy the contents of a source directory rather than the directory itself.
    pub contents_only: bool,
}

impl CopySpec {
    pub fn new(source: Location, dest: Location) -> Self {
        Self {
            source,
            dest,
            excludes: Vec::new(),
            max_size: None,
            contents_only: false,
        }
    }

    pub fn contents(mut self) -> Self {
        self.contents_only = true;
        self
    }

    pub fn excluding<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn max_size(mut self, limit: Option<String>) -> Self {
        self.max_size = limit;
        self
    }

    /// Argument vector handed to `rsync`.
    pub fn rsync_args(&self) -> Vec<String> {
        let mut args = vec!["-a".to_string()];
        for pattern in &self.excludes {
            args.push(format!("--exclude={pattern}"));
        }
        if let Some(limit) = &self.max_size {
            args.push(format!("--max-size={limit}"));
        }
        if self.source.is_remote() || self.dest.is_remote() {
            args.push("-e".to_string());
            args.push(format!("ssh {}", SSH_OPTIONS.join(" ")));
        }
        args.push(self.source.render(self.contents_only));
        args.push(self.dest.render(false));
        args
    }
}

impl fmt::Display for CopySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.source.render(self.contents_only),
            self.dest.render(false)
        )
    }
}

/// Captured result of a command that exited zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    /// stdout followed by stderr.
    pub output: String,
}

pub trait Executor {
    fn run_remote(&self, host: &RemoteHost, command: &str) -> Result<CommandOutput>;

    fn run_local(&self, command: &LocalCommand) -> Result<CommandOutput>;

    fn copy(&self, spec: &CopySpec) -> Result<CommandOutput>;
}

/// Shells out to `ssh`, `rsync` and local programs.
#[derive(Debug, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    fn execute(&self, rendered: String, cmd: &mut Command) -> Result<CommandOutput> {
        tracing::debug!("exec: {rendered}");
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|err| OpsError::Execution {
                command: rendered.clone(),
                status: None,
                output: err.to_string(),
            })?;
        finish(rendered, output)
    }
}

impl Executor for ProcessExecutor {
    fn run_remote(&self, host: &RemoteHost, command: &str) -> Result<CommandOutput> {
        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTIONS).arg(host.destination()).arg(command);
        self.execute(format!("ssh {} {}", host.destination(), command), &mut cmd)
    }

    fn run_local(&self, command: &LocalCommand) -> Result<CommandOutput> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        self.execute(command.to_string(), &mut cmd)
    }

    fn copy(&self, spec: &CopySpec) -> Result<CommandOutput> {
        let args = spec.rsync_args();
        let mut cmd = Command::new("rsync");
        cmd.args(&args);
        self.execute(format!("rsync {}", args.join(" ")), &mut cmd)
    }
}

fn finish(command: String, output: Output) -> Result<CommandOutput> {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.status.success() {
        Ok(CommandOutput {
            status: 0,
            output: text,
        })
    } else {
        Err(OpsError::Execution {
            command,
            status: output.status.code(),
            output: text,
        })
    }
}

/// Single-quote `raw` for a POSIX shell when it contains anything unusual.
pub fn quote(raw: &str) -> String {
    let safe = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}
