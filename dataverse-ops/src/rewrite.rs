//! Structured rewriting of production names into their staging equivalents.
//!
//! Hostnames and filesystem paths are replaced only as whole tokens: a host
//! must not be glued to further label characters (`prod.example.org` leaves
//! `www.prod.example.org` and `prod.example.org.mirror.net` alone) and a path
//! prefix must end at a path boundary (`/usr/local/dvn` leaves
//! `/usr/local/dvn2` alone). Crontabs and `key=value` / `key: value` files
//! are parsed into records and only their values or commands are touched.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Host,
    Path,
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

fn boundary_before(kind: TokenKind, prev: Option<char>) -> bool {
    match (kind, prev) {
        (_, None) => true,
        (TokenKind::Host, Some(c)) => !(is_host_char(c) || c == '.'),
        (TokenKind::Path, Some(c)) => !is_path_char(c),
    }
}

fn boundary_after(kind: TokenKind, rest: &str) -> bool {
    let mut chars = rest.chars();
    match (kind, chars.next()) {
        (_, None) => true,
        // A trailing dot is fine unless another label follows it.
        (TokenKind::Host, Some('.')) => !chars.next().is_some_and(is_host_char),
        (TokenKind::Host, Some(c)) => !is_host_char(c),
        (TokenKind::Path, Some('/')) => true,
        (TokenKind::Path, Some(c)) => !is_path_char(c),
    }
}

fn replace_token(text: &str, from: &str, to: &str, kind: TokenKind) -> (String, usize) {
    if from.is_empty() || from == to {
        return (text.to_string(), 0);
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut count = 0;
    for (idx, _) in text.match_indices(from) {
        if idx < last {
            continue;
        }
        let end = idx + from.len();
        if boundary_before(kind, text[..idx].chars().next_back())
            && boundary_after(kind, &text[end..])
        {
            out.push_str(&text[last..idx]);
            out.push_str(to);
            last = end;
            count += 1;
        }
    }
    out.push_str(&text[last..]);
    (out, count)
}

/// Replace whole-hostname occurrences of `from`.
pub fn replace_host(text: &str, from: &str, to: &str) -> (String, usize) {
    replace_token(text, from, to, TokenKind::Host)
}

/// Replace `from` where it is a complete path or a path prefix.
pub fn replace_path(text: &str, from: &str, to: &str) -> (String, usize) {
    let from = from.trim_end_matches('/');
    let to = to.trim_end_matches('/');
    replace_token(text, from, to, TokenKind::Path)
}

/// Production → staging substitutions for hosts and paths.
#[derive(Debug, Clone, Default)]
pub struct Rewrites {
    hosts: Vec<(String, String)>,
    paths: Vec<(String, String)>,
}

impl Rewrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, from: &str, to: &str) -> Self {
        self.hosts.push((from.to_string(), to.to_string()));
        self
    }

    pub fn path(mut self, from: &str, to: &str) -> Self {
        self.paths.push((from.to_string(), to.to_string()));
        // Longer prefixes first so nested trees map to their own targets.
        self.paths.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn apply(&self, value: &str) -> (String, usize) {
        let mut current = value.to_string();
        let mut total = 0;
        for (from, to) in &self.paths {
            let (next, n) = replace_path(&current, from, to);
            current = next;
            total += n;
        }
        for (from, to) in &self.hosts {
            let (next, n) = replace_host(&current, from, to);
            current = next;
            total += n;
        }
        (current, total)
    }
}

fn config_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\s*(?:export\s+)?[A-Za-z_][A-Za-z0-9_.\-]*\s*(?:=|:\s))(.*)$")
            .expect("valid config line regex")
    })
}

/// Rewrite a properties / YAML / shell file.
///
/// `key=value` and `key: value` lines have only their value rewritten;
/// comments are kept verbatim; any other line is treated as a command.
pub fn rewrite_config(text: &str, rules: &Rewrites) -> (String, usize) {
    let mut total = 0;
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        let trimmed = body.trim_start();
        if trimmed.starts_with('#') || trimmed.is_empty() {
            out.push_str(line);
            continue;
        }
        if let Some(caps) = config_line_re().captures(body) {
            let (value, n) = rules.apply(&caps[2]);
            total += n;
            out.push_str(&caps[1]);
            out.push_str(&value);
        } else {
            let (rewritten, n) = rules.apply(body);
            total += n;
            out.push_str(&rewritten);
        }
        out.push_str(newline);
    }
    (out, total)
}

/// One line of a crontab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronLine {
    Blank,
    Comment(String),
    Env { name: String, value: String },
    Job { schedule: String, command: String },
    Other(String),
}

impl fmt::Display for CronLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronLine::Blank => Ok(()),
            CronLine::Comment(text) | CronLine::Other(text) => f.write_str(text),
            CronLine::Env { name, value } => write!(f, "{name}={value}"),
            CronLine::Job { schedule, command } => write!(f, "{schedule} {command}"),
        }
    }
}

fn cron_env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*)$").expect("valid cron env regex")
    })
}

fn cron_job_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(@[a-z]+|(?:\S+\s+){4}\S+)\s+(\S.*)$").expect("valid cron job regex")
    })
}

pub fn parse_crontab(text: &str) -> Vec<CronLine> {
    text.lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                CronLine::Blank
            } else if trimmed.starts_with('#') {
                CronLine::Comment(line.to_string())
            } else if let Some(caps) = cron_env_re().captures(line) {
                CronLine::Env {
                    name: caps[1].to_string(),
                    value: caps[2].to_string(),
                }
            } else if let Some(caps) = cron_job_re().captures(line) {
                CronLine::Job {
                    schedule: caps[1].to_string(),
                    command: caps[2].to_string(),
                }
            } else {
                CronLine::Other(line.to_string())
            }
        })
        .collect()
}

/// Rewrite job commands and environment values; returns (lines, jobs changed).
pub fn rewrite_crontab(lines: Vec<CronLine>, rules: &Rewrites) -> (Vec<CronLine>, usize) {
    let mut changed = 0;
    let lines = lines
        .into_iter()
        .map(|line| match line {
            CronLine::Job { schedule, command } => {
                let (command, n) = rules.apply(&command);
                if n > 0 {
                    changed += 1;
                }
                CronLine::Job { schedule, command }
            }
            CronLine::Env { name, value } => {
                let (value, _) = rules.apply(&value);
                CronLine::Env { name, value }
            }
            other => other,
        })
        .collect();
    (lines, changed)
}

pub fn render_crontab(lines: &[CronLine]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}
