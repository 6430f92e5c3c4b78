use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::guard::SafetyViolation;

/// Keys of one configuration group that were absent or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingGroup {
    pub group: String,
    pub keys: Vec<String>,
}

/// Top-level error type for sync and upgrade runs.
///
/// Every variant is fatal to the current run. [`OpsError::Declined`] is the
/// only one that maps to a successful exit status: the operator chose to stop
/// before anything was touched.
#[derive(Debug)]
pub enum OpsError {
    /// Required configuration keys are missing, grouped by key group.
    Configuration { missing: Vec<MissingGroup> },
    /// A pre-flight safety assertion failed.
    Safety(SafetyViolation),
    /// An external command exited non-zero or could not be launched.
    Execution {
        command: String,
        status: Option<i32>,
        output: String,
    },
    /// A downloaded artifact did not match its published SHA-256.
    ChecksumMismatch {
        artifact: PathBuf,
        expected: String,
        actual: String,
    },
    /// A service did not become ready within the polling bound.
    Timeout { what: String, waited: Duration },
    /// Deployed version differs from the one the workflow expects.
    VersionMismatch { expected: String, actual: String },
    /// Administrative HTTP call failed.
    Http { url: String, message: String },
    /// Upgrade state machine was asked to move to a state it cannot reach.
    InvalidTransition { from: String, to: String },
    /// Operator answered "no" to a gating confirmation.
    Declined(String),
    /// Invalid option or tool setting supplied by the caller.
    InvalidOptions(String),
    /// Wrapper around lower-level I/O failures.
    Io(io::Error),
}

impl fmt::Display for OpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpsError::Configuration { missing } => {
                writeln!(f, "Missing required configuration:")?;
                for group in missing {
                    writeln!(f, "  [{}] {}", group.group, group.keys.join(", "))?;
                }
                write!(f, "Set these keys in the env file and re-run.")
            }
            OpsError::Safety(err) => write!(f, "{err}"),
            OpsError::Execution {
                command,
                status,
                output,
            } => {
                match status {
                    Some(code) => write!(f, "command failed with exit status {code}: {command}")?,
                    None => write!(f, "command could not be run: {command}")?,
                }
                let trimmed = output.trim();
                if !trimmed.is_empty() {
                    write!(f, "\n{trimmed}")?;
                }
                Ok(())
            }
            OpsError::ChecksumMismatch {
                artifact,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch for {}: expected {expected}, got {actual} (artifact deleted)",
                artifact.display()
            ),
            OpsError::Timeout { what, waited } => write!(
                f,
                "{what} did not become ready within {}s",
                waited.as_secs()
            ),
            OpsError::VersionMismatch { expected, actual } => {
                write!(f, "expected version {expected} but found {actual}")
            }
            OpsError::Http { url, message } => write!(f, "request to {url} failed: {message}"),
            OpsError::InvalidTransition { from, to } => {
                write!(f, "upgrade cannot move from {from} to {to}")
            }
            OpsError::Declined(msg) => write!(f, "aborted by operator: {msg}"),
            OpsError::InvalidOptions(msg) => f.write_str(msg),
            OpsError::Io(err) => write!(f, "{err}"),
        }
    }
}

// Wrapped errors are already part of the message.
impl StdError for OpsError {}

impl From<io::Error> for OpsError {
    fn from(err: io::Error) -> Self {
        OpsError::Io(err)
    }
}

impl From<SafetyViolation> for OpsError {
    fn from(err: SafetyViolation) -> Self {
        OpsError::Safety(err)
    }
}

impl OpsError {
    /// Convenience constructor for invalid option failures.
    pub fn invalid_options(msg: impl Into<String>) -> Self {
        OpsError::InvalidOptions(msg.into())
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            OpsError::Declined(_) => 0,
            _ => 1,
        }
    }

    /// Every missing key across all groups, in report order.
    pub fn missing_keys(&self) -> Vec<&str> {
        match self {
            OpsError::Configuration { missing } => missing
                .iter()
                .flat_map(|g| g.keys.iter().map(String::as_str))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Convenience result alias using [`OpsError`].
pub type Result<T> = std::result::Result<T, OpsError>;
