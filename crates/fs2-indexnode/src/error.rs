//! Error types for the indexnode.

use thiserror::Error;

/// Errors raised by the in-memory filesystem index.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// A child with this name already exists under the parent.
    #[error("entry '{name}' already exists under '{parent}'")]
    DuplicateName {
        /// Name of the parent directory.
        parent: String,
        /// Name that collided.
        name: String,
    },

    /// The parent given for an insert is a file, not a directory.
    #[error("'{0}' is not a directory")]
    NotADirectory(String),
}

/// Errors raised while talking to a registered client.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Connection-level failure (refused, reset, DNS, ...).
    #[error("I/O error contacting {addr}: {msg}")]
    Io {
        /// Client address.
        addr: String,
        /// Underlying error message.
        msg: String,
    },

    /// The request did not complete within the configured timeout.
    #[error("request to {addr} timed out")]
    Timeout {
        /// Client address.
        addr: String,
    },

    /// The client answered 404, typically because the share was retracted.
    #[error("{url} not found")]
    NotFound {
        /// Requested URL.
        url: String,
    },

    /// The client answered with an unexpected HTTP status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The client's response could not be parsed.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl PeerError {
    /// Returns true for failures worth retrying at the same revision.
    ///
    /// Parse failures are deterministic and are never retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PeerError::Malformed(_))
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(e: serde_json::Error) -> Self {
        PeerError::Malformed(e.to_string())
    }
}

/// Reasons a hello request is rejected.
#[derive(Debug, Error)]
pub enum HelloError {
    /// A required header was absent.
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    /// A header was present but could not be parsed.
    #[error("invalid header {name}: {value}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// The declared address did not answer the reachability probe.
    #[error("client at {addr} is unreachable: {source}")]
    Unreachable {
        /// Declared address that was probed.
        addr: String,
        /// Probe failure.
        #[source]
        source: PeerError,
    },

    /// The indexnode is shutting down and accepts no new registrations.
    #[error("indexnode is shutting down")]
    ShuttingDown,

    /// The client's root directory could not be created.
    #[error(transparent)]
    Index(#[from] IndexError),
}
