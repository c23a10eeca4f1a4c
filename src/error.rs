//! Error types shared by the pattern and source layers.
//!
//! Messages are written to be shown to an operator. They never contain
//! credentials, private key material or full remote directory paths.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure to turn a user-supplied pattern into a matcher.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("Security issue: {reason}")]
    Unsafe { reason: String },

    #[error("Pattern compilation timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    #[error("Invalid regex: {0}")]
    Invalid(#[from] regex::Error),
}

/// A `SecurityPolicy` value outside its accepted range.
#[derive(Debug, Error)]
#[error("security setting `{field}` must be between {min} and {max}, got {value}")]
pub struct PolicyError {
    pub field: &'static str,
    pub min: String,
    pub max: String,
    pub value: String,
}

/// The part of a remote source URL that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlComponent {
    Format,
    User,
    Host,
    Port,
    Path,
}

impl fmt::Display for UrlComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UrlComponent::Format => "format",
            UrlComponent::User => "user",
            UrlComponent::Host => "host",
            UrlComponent::Port => "port",
            UrlComponent::Path => "path",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(
        "Host key verification failed for {host}: {key_type} key with fingerprint {fingerprint} \
         is not trusted by known_hosts"
    )]
    HostKeyRejected {
        host: String,
        key_type: String,
        fingerprint: String,
    },

    #[error("SSH authentication failed for {host}")]
    Authentication { host: String },

    #[error("SSH connection to {host} timed out")]
    Timeout { host: String },

    #[error("Unable to reach {host}: {reason}")]
    Network { host: String, reason: String },

    #[error("SSH connection error with {host}: {reason}")]
    Session { host: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid SSH URL: {component} {reason}")]
    InvalidUrl {
        component: UrlComponent,
        reason: &'static str,
    },

    #[error("Path rejected: {0}")]
    InvalidPath(String),

    #[error("File not found: {name}")]
    NotFound { name: String },

    #[error("Permission denied: {name}")]
    PermissionDenied { name: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Unexpected output from remote `{command}`: {detail}")]
    Protocol {
        command: &'static str,
        detail: String,
    },

    #[error("Source is not open")]
    NotOpen,

    #[error("I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl SourceError {
    /// Map an I/O error from opening `name` onto the source taxonomy.
    pub fn from_io(name: impl Into<String>, err: io::Error) -> Self {
        let name = name.into();
        match err.kind() {
            io::ErrorKind::NotFound => SourceError::NotFound { name },
            io::ErrorKind::PermissionDenied => SourceError::PermissionDenied { name },
            _ => SourceError::Io { name, source: err },
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, SourceError::Connection(_))
    }
}
