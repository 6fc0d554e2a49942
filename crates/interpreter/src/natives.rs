//! The built-in native functions available to every program.
//!
//! | name       | arity | effect                                          |
//! |------------|-------|-------------------------------------------------|
//! | `clock`    | 0     | wall seconds since the Unix epoch               |
//! | `exit`     | 1     | terminate the process with an integer status    |
//! | `read`     | 0     | one byte from stdin, `nil` on EOF               |
//! | `utf`      | 4     | compose 1-4 bytes into a string, trailing nils  |
//! | `printerr` | 1     | stringified argument + newline to stderr        |

use crate::callable::NativeFunction;
use crate::environment::Environment;
use crate::error::RuntimeError;
use crate::value::Value;
use lox_frontend::token::{Literal, Token, TokenKind};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Errors raised inside a native have no source token; they are attributed
/// to a synthetic token at line 0, the way the original runtime does it.
fn native_token() -> Token {
    Token::new(TokenKind::Identifier, "", Literal::None, 0)
}

fn number_arg(value: &Value) -> Result<f64, RuntimeError> {
    match value {
        Value::Number(n) => Ok(*n),
        _ => Err(RuntimeError::new(
            &native_token(),
            "Operand must be a number.",
        )),
    }
}

/// Define all native functions into the globals environment.
pub fn define_natives(globals: &Rc<Environment>) {
    globals.define(
        "clock",
        Value::Native(NativeFunction::new(0, |_| {
            let seconds = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Ok(Value::Number(seconds))
        })),
    );

    globals.define(
        "exit",
        Value::Native(NativeFunction::new(1, |args| {
            let code = number_arg(&args[0])?;
            std::process::exit(code as i32);
        })),
    );

    globals.define(
        "read",
        Value::Native(NativeFunction::new(0, |_| {
            // Raw byte read; line buffering and EOF are libc's concern.
            let byte = unsafe { libc::getchar() };
            if byte == libc::EOF {
                Ok(Value::Nil)
            } else {
                Ok(Value::Number(byte as f64))
            }
        })),
    );

    globals.define(
        "utf",
        Value::Native(NativeFunction::new(4, |args| {
            let mut bytes = Vec::with_capacity(4);
            for (i, arg) in args.iter().enumerate() {
                if i > 0 && matches!(arg, Value::Nil) {
                    continue;
                }
                match arg {
                    Value::Number(n) if (0.0..=255.0).contains(n) => bytes.push(*n as u8),
                    _ => {
                        return Err(RuntimeError::new(
                            &native_token(),
                            "utf parameter should be a number between 0 and 255.",
                        ));
                    }
                }
            }
            Ok(Value::string(String::from_utf8_lossy(&bytes).into_owned()))
        })),
    );

    globals.define(
        "printerr",
        Value::Native(NativeFunction::new(1, |args| {
            eprintln!("{}", args[0]);
            Ok(Value::Nil)
        })),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(name: &str) -> Rc<NativeFunction> {
        let globals = Environment::new();
        define_natives(&globals);
        match globals.get(name) {
            Some(Value::Native(native)) => native,
            _ => panic!("{} should be a native", name),
        }
    }

    #[test]
    fn test_all_natives_are_defined() {
        let globals = Environment::new();
        define_natives(&globals);
        for name in ["clock", "exit", "read", "utf", "printerr"] {
            assert!(globals.get(name).is_some(), "{} missing", name);
        }
    }

    #[test]
    fn test_clock_returns_positive_number() {
        let clock = native("clock");
        match clock.call(&[]) {
            Ok(Value::Number(n)) => assert!(n > 0.0),
            other => panic!("unexpected clock result: {:?}", other),
        }
    }

    #[test]
    fn test_utf_single_byte() {
        let utf = native("utf");
        let args = [
            Value::Number(104.0),
            Value::Nil,
            Value::Nil,
            Value::Nil,
        ];
        assert_eq!(utf.call(&args).ok(), Some(Value::string("h")));
    }

    #[test]
    fn test_utf_multi_byte_sequence() {
        let utf = native("utf");
        // U+00E9 (e-acute) is 0xC3 0xA9 in UTF-8.
        let args = [
            Value::Number(195.0),
            Value::Number(169.0),
            Value::Nil,
            Value::Nil,
        ];
        assert_eq!(utf.call(&args).ok(), Some(Value::string("\u{e9}")));
    }

    #[test]
    fn test_utf_rejects_out_of_range() {
        let utf = native("utf");
        let args = [
            Value::Number(300.0),
            Value::Nil,
            Value::Nil,
            Value::Nil,
        ];
        let err = utf.call(&args).unwrap_err();
        assert_eq!(
            err.message,
            "utf parameter should be a number between 0 and 255."
        );
    }

    #[test]
    fn test_utf_rejects_leading_nil() {
        let utf = native("utf");
        let args = [Value::Nil, Value::Nil, Value::Nil, Value::Nil];
        assert!(utf.call(&args).is_err());
    }
}
