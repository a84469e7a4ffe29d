use crate::io::IoError;
use thiserror::Error;

/// Failure while executing bytecode. The campaign catches these per
/// mutation; they never abort a campaign.
#[derive(Error, Debug)]
pub enum ExecError {
    /// Invalid operand combination for an arithmetic op or `SIZEOF`.
    #[error("type error: {0}")]
    Type(String),
    /// Stack underflow, unknown host function, bad operand index,
    /// division by zero, host arity violations.
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("i/o error: {0}")]
    Io(#[from] IoError),
}

impl ExecError {
    pub fn type_error(message: impl Into<String>) -> Self {
        ExecError::Type(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ExecError::Runtime(message.into())
    }
}
