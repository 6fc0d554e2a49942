//! Tree-walking interpreter for Lox.
//!
//! This backend evaluates the resolved AST directly over a chain of
//! lexical environments. It is the reference semantics for the LLVM
//! backend: truthiness, equality, arithmetic, property lookup, inheritance
//! and error messages coincide for all legal programs.
//!
//! Execution is single-threaded and synchronous; a fatal runtime error
//! unwinds as a `Result` and is reported with a call trace.

pub mod callable;
pub mod environment;
pub mod error;
pub mod interp;
pub mod natives;
pub mod value;

pub use error::RuntimeError;
pub use interp::{Flow, Interpreter};
pub use value::Value;
