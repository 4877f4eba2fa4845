use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::lock::LockError;

/// Machine-readable error codes for operators and supervising processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoSincedbPath,
    ConfigParseError,
    InvalidPattern,
    InvalidConfigValue,
    SincedbParseError,
    SincedbWriteFailed,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NoSincedbPath => "E1001",
            Self::ConfigParseError => "E1002",
            Self::InvalidPattern => "E1003",
            Self::InvalidConfigValue => "E1004",
            Self::SincedbParseError => "E3001",
            Self::SincedbWriteFailed => "E5001",
            Self::LockContention => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NoSincedbPath => "No position store path could be resolved",
            Self::ConfigParseError => "Config file parse error",
            Self::InvalidPattern => "Invalid glob pattern",
            Self::InvalidConfigValue => "Invalid configuration value",
            Self::SincedbParseError => "Position store parse error",
            Self::SincedbWriteFailed => "Position store write failed",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NoSincedbPath => {
                Some("Set `sincedb_path` in the config, or export SINCEDB_PATH or HOME.")
            }
            Self::ConfigParseError => Some("Fix the TOML syntax in the config file and retry."),
            Self::InvalidPattern => Some("Check the glob syntax of watched paths and excludes."),
            Self::InvalidConfigValue => None,
            Self::SincedbParseError => {
                Some("The line is skipped; delete the store file to start over.")
            }
            Self::SincedbWriteFailed => {
                Some("Check disk space, open file limits, and write permissions.")
            }
            Self::LockContention => {
                Some("Another tailer owns this store file; give each process its own sincedb_path.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors raised by the position store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error while reading or writing the store file.
    #[error("sincedb I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A persisted line could not be understood.
    #[error("sincedb parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// The JSON adapter could not encode or decode the document.
    #[error("sincedb JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another process holds the store lock.
    #[error("sincedb lock error: {0}")]
    Lock(#[from] LockError),
}

impl StoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::SincedbWriteFailed,
            Self::Parse { .. } | Self::Json(_) => ErrorCode::SincedbParseError,
            Self::Lock(err) => err.code(),
        }
    }
}

/// Errors surfaced to callers constructing or driving a tail.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    /// No `sincedb_path`, `SINCEDB_PATH`, or home directory was available.
    #[error(
        "no sincedb path: set sincedb_path, SINCEDB_PATH, or HOME so read positions can be tracked"
    )]
    NoSincedbPath,

    /// A configuration value is out of range.
    #[error("invalid config value for `{key}`: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    /// A watched glob could not be parsed.
    #[error("invalid glob pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },

    /// Position store failure during construction or shutdown.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TailError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NoSincedbPath => ErrorCode::NoSincedbPath,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfigValue,
            Self::Pattern { .. } => ErrorCode::InvalidPattern,
            Self::Store(err) => err.code(),
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}
