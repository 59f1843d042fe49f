//! Errors raised while compiling or running a script.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("SyntaxError: {message} (line {line}, column {column})")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("ReferenceError: {0} is not defined")]
    Reference(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("AssertionError: {0}")]
    Assertion(String),

    /// A value thrown by the script itself.
    #[error("{0}")]
    Thrown(String),

    #[error("script budget exceeded: {0}")]
    BudgetExceeded(String),
}

impl ScriptError {
    pub fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        ScriptError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        ScriptError::Type(message.into())
    }

    /// Budget errors end the whole script; `test()` may not swallow them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScriptError::BudgetExceeded(_))
    }

    /// Message as reported in a failing test record.
    pub fn message(&self) -> String {
        match self {
            ScriptError::Assertion(message) | ScriptError::Thrown(message) => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScriptError>;
