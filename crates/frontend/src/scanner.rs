//! Single-pass scanner over UTF-8 source bytes.
//!
//! Produces a token stream terminated by a single `End` token. Strings may
//! span lines; `//` comments run to end of line; identifiers are ASCII
//! `[A-Za-z_][A-Za-z_0-9]*`. Lexical errors are reported and scanning
//! continues so later phases can surface more diagnostics.

use crate::error::ErrorReporter;
use crate::token::{self, Literal, Token, TokenKind};

pub struct Scanner<'src> {
    source: &'src [u8],
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner {
            source: source.as_bytes(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_tokens(mut self, reporter: &mut ErrorReporter) -> Vec<Token> {
        while !self.is_at_end() {
            self.start = self.current;
            self.scan_token(reporter);
        }
        self.tokens
            .push(Token::new(TokenKind::End, "", Literal::None, self.line));
        self.tokens
    }

    fn scan_token(&mut self, reporter: &mut ErrorReporter) {
        let c = self.advance();
        match c {
            b'(' => self.add_token(TokenKind::LeftParen),
            b')' => self.add_token(TokenKind::RightParen),
            b'{' => self.add_token(TokenKind::LeftBrace),
            b'}' => self.add_token(TokenKind::RightBrace),
            b',' => self.add_token(TokenKind::Comma),
            b'.' => self.add_token(TokenKind::Dot),
            b'-' => self.add_token(TokenKind::Minus),
            b'+' => self.add_token(TokenKind::Plus),
            b';' => self.add_token(TokenKind::Semicolon),
            b'*' => self.add_token(TokenKind::Star),
            b'/' => {
                if self.match_byte(b'/') {
                    // A comment goes until the end of the line.
                    while self.peek() != b'\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else {
                    self.add_token(TokenKind::Slash);
                }
            }
            b'!' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.add_token(kind);
            }
            b'=' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.add_token(kind);
            }
            b'<' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.add_token(kind);
            }
            b'>' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.add_token(kind);
            }
            b' ' | b'\r' | b'\t' => {}
            b'\n' => self.line += 1,
            b'"' => self.string(reporter),
            _ => {
                if c.is_ascii_digit() {
                    self.number();
                } else if is_alpha(c) {
                    self.identifier();
                } else {
                    reporter.error(self.line, "Unexpected character.");
                }
            }
        }
    }

    fn string(&mut self, reporter: &mut ErrorReporter) {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            reporter.error(self.line, "Unterminated string.");
            return;
        }

        // The closing quote.
        self.advance();

        let value = self.lexeme_range(self.start + 1, self.current - 1);
        self.add_literal_token(TokenKind::String, Literal::String(value));
    }

    fn number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        // Look for a fractional part.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        let lexeme = self.lexeme_range(self.start, self.current);
        let value: f64 = lexeme.parse().unwrap_or(0.0);
        self.add_literal_token(TokenKind::Number, Literal::Number(value));
    }

    fn identifier(&mut self) {
        while is_alpha_numeric(self.peek()) {
            self.advance();
        }

        let lexeme = self.lexeme_range(self.start, self.current);
        match token::keyword(&lexeme) {
            Some(TokenKind::True) => self.add_literal_token(TokenKind::True, Literal::Bool(true)),
            Some(TokenKind::False) => {
                self.add_literal_token(TokenKind::False, Literal::Bool(false))
            }
            Some(TokenKind::Nil) => self.add_literal_token(TokenKind::Nil, Literal::Nil),
            Some(kind) => self.add_token(kind),
            None => self.add_token(TokenKind::Identifier),
        }
    }

    fn lexeme_range(&self, start: usize, end: usize) -> String {
        String::from_utf8_lossy(&self.source[start..end]).into_owned()
    }

    fn add_token(&mut self, kind: TokenKind) {
        self.add_literal_token(kind, Literal::None);
    }

    fn add_literal_token(&mut self, kind: TokenKind, literal: Literal) {
        let lexeme = self.lexeme_range(self.start, self.current);
        self.tokens.push(Token::new(kind, lexeme, literal, self.line));
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            b'\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            b'\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        c
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_alpha_numeric(c: u8) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> (Vec<Token>, bool) {
        let mut reporter = ErrorReporter::new();
        let tokens = Scanner::new(source).scan_tokens(&mut reporter);
        (tokens, reporter.had_error())
    }

    #[test]
    fn test_empty_source_yields_end() {
        let (tokens, had_error) = scan("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::End);
        assert!(!had_error);
    }

    #[test]
    fn test_punctuation_and_operators() {
        let (tokens, _) = scan("(){},.-+;*/ ! != = == < <= > >=");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_number_literals() {
        let (tokens, _) = scan("123 45.67");
        assert_eq!(tokens[0].literal, Literal::Number(123.0));
        assert_eq!(tokens[1].literal, Literal::Number(45.67));
    }

    #[test]
    fn test_integer_followed_by_dot_is_not_fractional() {
        // `123.` is a number then a dot (method call syntax).
        let (tokens, _) = scan("123.abs");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[1].kind, TokenKind::Dot);
        assert_eq!(tokens[2].kind, TokenKind::Identifier);
    }

    #[test]
    fn test_string_literal_spans_lines() {
        let (tokens, had_error) = scan("\"hello\nworld\" x");
        assert!(!had_error);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].literal, Literal::String("hello\nworld".into()));
        // The token after the string is on line 2.
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn test_unterminated_string_reports_error() {
        let (_, had_error) = scan("\"abc");
        assert!(had_error);
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let (tokens, _) = scan("var foo = true;");
        assert_eq!(tokens[0].kind, TokenKind::Var);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].lexeme, "foo");
        assert_eq!(tokens[3].kind, TokenKind::True);
        assert_eq!(tokens[3].literal, Literal::Bool(true));
    }

    #[test]
    fn test_comment_runs_to_end_of_line() {
        let (tokens, _) = scan("// nothing here\nprint");
        assert_eq!(tokens[0].kind, TokenKind::Print);
        assert_eq!(tokens[0].line, 2);
    }

    #[test]
    fn test_unexpected_character_continues_scanning() {
        let (tokens, had_error) = scan("@ var");
        assert!(had_error);
        assert_eq!(tokens[0].kind, TokenKind::Var);
    }
}
