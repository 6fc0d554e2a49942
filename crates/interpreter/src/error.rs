//! Runtime errors.
//!
//! A runtime error is fatal to the program being interpreted: it unwinds
//! evaluation as an `Err`, the driver reports it with a stack trace and
//! exits with status 70. The offending token carries the source line.

use lox_frontend::token::Token;
use std::fmt;

#[derive(Debug)]
pub struct RuntimeError {
    pub token: Token,
    pub message: String,
}

impl RuntimeError {
    pub fn new(token: &Token, message: impl Into<String>) -> Self {
        RuntimeError {
            token: token.clone(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {}
