//! Compile-time diagnostics.
//!
//! All front-end phases report through an [`ErrorReporter`]: each error is
//! printed to stderr once in the form `[line N] Error<where>: <msg>` and a
//! sticky `had_error` flag is raised. Phases keep going after an error so a
//! single run surfaces as many diagnostics as possible; the driver checks
//! the flag between phases and aborts before the next one.

use crate::token::{Token, TokenKind};

#[derive(Debug, Default)]
pub struct ErrorReporter {
    had_error: bool,
}

impl ErrorReporter {
    pub fn new() -> Self {
        ErrorReporter { had_error: false }
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Clear the flag, e.g. between independently-compiled inputs.
    pub fn reset(&mut self) {
        self.had_error = false;
    }

    pub fn report(&mut self, line: u32, location: &str, message: &str) {
        eprintln!("[line {}] Error{}: {}", line, location, message);
        self.had_error = true;
    }

    pub fn error(&mut self, line: u32, message: &str) {
        self.report(line, "", message);
    }

    pub fn error_at(&mut self, token: &Token, message: &str) {
        if token.kind == TokenKind::End {
            self.report(token.line, " at end", message);
        } else {
            self.report(token.line, &format!(" at '{}'", token.lexeme), message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Literal;

    #[test]
    fn test_flag_starts_clear() {
        let reporter = ErrorReporter::new();
        assert!(!reporter.had_error());
    }

    #[test]
    fn test_error_sets_flag() {
        let mut reporter = ErrorReporter::new();
        reporter.error(3, "Unexpected character.");
        assert!(reporter.had_error());
    }

    #[test]
    fn test_reset_clears_flag() {
        let mut reporter = ErrorReporter::new();
        reporter.error_at(
            &Token::new(TokenKind::Identifier, "x", Literal::None, 1),
            "Already a variable with this name in this scope.",
        );
        assert!(reporter.had_error());
        reporter.reset();
        assert!(!reporter.had_error());
    }
}
