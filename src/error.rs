//! The engine's error taxonomy.
//!
//! Every fallible operation in this crate returns a [`Result`] with this
//! error type rather than collapsing distinct failure kinds into a single
//! generic error — callers above the core need to tell an `AllPinned`
//! cache exhaustion apart from a `CompileError` in a malformed query.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("all tablet slots are pinned, cannot evict a victim for slot allocation")]
    AllPinned,

    #[error("compile error: {0}")]
    CompileError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl EngineError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        EngineError::Corruption(msg.into())
    }

    pub fn out_of_space(msg: impl Into<String>) -> Self {
        EngineError::OutOfSpace(msg.into())
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        EngineError::CompileError(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}
