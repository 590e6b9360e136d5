use std::io;
use thiserror::Error;

/// type alias for all operations on the depot that could fail with a [`DepotError`]
pub type Result<T> = std::result::Result<T, DepotError>;

/// The Error variants used throughout the depot.
///
/// Errors fall into two channels. [`DepotError::is_fatal`] errors (I/O failures and
/// malformed framing) end the connection they occurred on; everything else is
/// reported to the peer as an `ERROR` statement and the conversation continues.
#[derive(Debug, Error)]
pub enum DepotError {
    /// variant for errors caused by socket or file IO
    #[error("{0}")]
    Io(#[from] io::Error),

    /// the byte stream could not be split into statements
    #[error("{0}")]
    Framing(String),

    /// a request was understood at the framing level but could not be serviced
    #[error("{0}")]
    Protocol(String),

    /// a remote server answered a command with an `ERROR` statement
    #[error("{command} command failed: {message}")]
    Remote {
        /// the command that was sent
        command: String,
        /// the text of the `ERROR` reply
        message: String,
    },

    /// serde_json error
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// the durable delayed-work queue reported an error
    #[error("{0}")]
    Queue(#[from] sled::Error),

    /// a permission exchange document could not be parsed
    #[error("malformed permission document: {0}")]
    Exchange(String),

    /// invalid or missing configuration
    #[error("{0}")]
    Config(String),
}

impl DepotError {
    /// true if the connection this error occurred on can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, DepotError::Io(_) | DepotError::Framing(_))
    }

    /// shorthand for building a [`DepotError::Protocol`]
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        DepotError::Protocol(msg.into())
    }

    /// shorthand for building a [`DepotError::Framing`]
    pub fn framing<S: Into<String>>(msg: S) -> Self {
        DepotError::Framing(msg.into())
    }

    /// the error raised when `identity` may not perform `action`
    pub fn not_allowed(action: &str, identity: Option<&str>) -> Self {
        DepotError::Protocol(format!(
            "{} not allowed by {}",
            action,
            identity.unwrap_or("anonymous")
        ))
    }
}
