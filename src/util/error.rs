//! Typed errors for the failure cases callers need to tell apart. Everything else is reported
//!  as `anyhow::Error`.

use thiserror::Error;

/// Errors while splitting a byte stream into documents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The length prefix announces a document larger than the configured maximum. The stream
    ///  is considered compromised.
    #[error("document length {length} exceeds the maximum of {max} bytes")]
    LengthExceeded {
        length: i32,
        max: usize,
    },

    /// The length prefix is smaller than the smallest possible document, so there is no way to
    ///  find the start of the next document.
    #[error("invalid document length {0}")]
    InvalidLength(i32),

    /// The frame was well-formed but its content is not a valid document. The stream is still
    ///  in sync since the frame's length was honored.
    #[error("document decoding failed: {0}")]
    Decode(String),
}

impl FrameError {
    /// fatal errors require the connection to be closed
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::Decode(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoded document has {length} bytes, the maximum is {max}")]
    TooLarge {
        length: usize,
        max: usize,
    },

    #[error("invalid key {0:?}: keys must not contain NUL bytes")]
    InvalidKey(String),

    #[error("invalid regular expression {0:?}: pattern and options must not contain NUL bytes")]
    InvalidRegex(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("send queue is full")]
    QueueFull,

    #[error("connection is closed")]
    Closed,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
