//! Gravity error types.
//! The runtime raises `ErrorKind::Runtime` only; the other kinds exist so that
//! an external compiler front-end can flow its diagnostics through the same
//! delegate channel.

use thiserror::Error;

/// Error categories reported through the delegate error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Semantic,
    Runtime,
    Io,
    Warning,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Syntax   => "SYNTAX",
            ErrorKind::Semantic => "SEMANTIC",
            ErrorKind::Runtime  => "RUNTIME",
            ErrorKind::Io       => "IO",
            ErrorKind::Warning  => "WARNING",
        }
    }
}

/// Errors surfaced by the VM and the executable loader.
#[derive(Debug, Clone, Error)]
pub enum GravityError {
    /// A runtime error that aborted the executing fiber (and was not caught
    /// by a trying fiber up the caller chain).
    #[error("RUNTIME ERROR: {message}")]
    Runtime { message: String },

    /// The VM was aborted by a previous error; all entry points are no-ops.
    #[error("VM has been aborted by a previous error")]
    Aborted,

    /// Malformed JSON executable or bytecode stream.
    #[error("SERIALIZATION ERROR: {message}")]
    Serialize { message: String },
}

impl GravityError {
    pub fn runtime(message: impl Into<String>) -> Self {
        GravityError::Runtime { message: message.into() }
    }

    pub fn serialize(message: impl Into<String>) -> Self {
        GravityError::Serialize { message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GravityError::Runtime { .. } | GravityError::Aborted => ErrorKind::Runtime,
            GravityError::Serialize { .. } => ErrorKind::Io,
        }
    }
}
