use std::fmt;
use thiserror::Error;

/// Row/column of a token in the script source. Rows start at 1; a tab
/// advances the column by 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

impl Position {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row, self.col)
    }
}

/// Everything that can abort compilation of a script. None of these are
/// recoverable for the unit being compiled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Malformed token or unterminated string.
    #[error("lex error at {pos}: {message}")]
    Lex { pos: Position, message: String },
    /// The token stream does not match the grammar.
    #[error("parse error at {pos}: {message}")]
    Parse { pos: Position, message: String },
    /// Grammatically valid but meaningless: duplicate template, unknown
    /// identifier, arity mismatch, out-of-range constant.
    #[error("semantic error at {pos}: {message}")]
    Semantic { pos: Position, message: String },
}

impl CompileError {
    pub fn lex(pos: Position, message: impl Into<String>) -> Self {
        CompileError::Lex {
            pos,
            message: message.into(),
        }
    }

    pub fn parse(pos: Position, message: impl Into<String>) -> Self {
        CompileError::Parse {
            pos,
            message: message.into(),
        }
    }

    pub fn semantic(pos: Position, message: impl Into<String>) -> Self {
        CompileError::Semantic {
            pos,
            message: message.into(),
        }
    }

    pub fn position(&self) -> Position {
        match self {
            CompileError::Lex { pos, .. }
            | CompileError::Parse { pos, .. }
            | CompileError::Semantic { pos, .. } => *pos,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CompileError::Lex { message, .. }
            | CompileError::Parse { message, .. }
            | CompileError::Semantic { message, .. } => message,
        }
    }
}
