//! Module-level runtime scaffolding: named types, libc declarations,
//! runtime globals and the string constants the runtime helpers share.
//!
//! Everything here is fixed text, emitted once per module in a single
//! data-driven pass so the declarations stay consistent across the
//! runtime helper modules that reference them.

use super::state::{INITIAL_GC_THRESHOLD, MAX_CALL_STACK_SIZE};
use super::value::imm;
use std::fmt::Write as _;

/// Named struct types. Every heap object embeds `%Obj` as its first field
/// so header accesses can GEP any object pointer with the `%Obj` type.
pub const TYPE_DEFINITIONS: &str = "\
%Obj = type { i8, i1, ptr }
%String = type { %Obj, ptr, i32, i32 }
%Function = type { %Obj, i32, ptr, ptr, i1 }
%Closure = type { %Obj, ptr, ptr, i32 }
%Upvalue = type { %Obj, ptr, ptr, i64 }
%Class = type { %Obj, ptr, ptr }
%Instance = type { %Obj, ptr, ptr }
%BoundMethod = type { %Obj, i64, ptr }
%Table = type { i32, i32, ptr }
%Entry = type { ptr, i64 }
%Stack = type { ptr, i32, i32 }
%Call = type { i32, ptr }
";

/// The libc surface the emitted module links against.
pub const LIBC_DECLARATIONS: &[&str] = &[
    "declare ptr @malloc(i64)",
    "declare ptr @realloc(ptr, i64)",
    "declare void @free(ptr)",
    "declare ptr @memcpy(ptr, ptr, i64)",
    "declare i32 @memcmp(ptr, ptr, i64)",
    "declare i32 @printf(ptr, ...)",
    "declare i32 @fprintf(ptr, ptr, ...)",
    "declare i64 @clock()",
    "declare i32 @getchar()",
    "declare void @exit(i32)",
    "@stderr = external global ptr",
];

/// String constants referenced from the fixed runtime helpers. User-code
/// literals go through the deduplicating `string_const` path instead.
pub const RUNTIME_STRINGS: &[(&str, &str)] = &[
    ("@fmt.g", "%g\n"),
    ("@fmt.s", "%s\n"),
    ("@str.true", "true"),
    ("@str.false", "false"),
    ("@str.nil", "nil"),
    ("@fmt.fn", "<fn %s>\n"),
    ("@str.native.fn", "<native fn>\n"),
    ("@fmt.instance", "%s instance\n"),
    ("@fmt.trace.fn", "[line %d] in %s()\n"),
    ("@fmt.trace.script", "[line %d] in script\n"),
    ("@err.oom", "Could not reallocate memory.\n"),
    ("@err.stackoverflow", "Stack overflow.\n"),
    ("@err.operand", "Operand must be a number.\n"),
    ("@err.utf", "utf parameter should be a number between 0 and 255.\n"),
];

/// Emit the mutable module globals that back the runtime: the intrusive
/// heap list, GC accounting, the intern table, the open-upvalue list, the
/// three growable stacks and the fixed call stack.
pub fn emit_runtime_globals(out: &mut String) -> std::fmt::Result {
    writeln!(out, "@objects = internal global ptr null")?;
    writeln!(out, "@allocatedBytes = internal global i64 0")?;
    writeln!(out, "@nextGC = internal global i64 {}", INITIAL_GC_THRESHOLD)?;
    writeln!(out, "@strings = internal global ptr null")?;
    writeln!(out, "@initString = internal global ptr null")?;
    writeln!(out, "@openUpvalues = internal global ptr null")?;
    writeln!(out, "@stack.globals = internal global %Stack zeroinitializer")?;
    writeln!(out, "@stack.locals = internal global %Stack zeroinitializer")?;
    writeln!(out, "@stack.gray = internal global %Stack zeroinitializer")?;
    writeln!(
        out,
        "@callstack = internal global [{} x %Call] zeroinitializer",
        MAX_CALL_STACK_SIZE
    )?;
    writeln!(out, "@callsp = internal global i32 0")?;
    Ok(())
}

/// Emit the runtime string constants as NUL-terminated byte arrays.
pub fn emit_runtime_strings(out: &mut String) -> std::fmt::Result {
    for (name, content) in RUNTIME_STRINGS {
        let escaped = super::state::escape_llvm_string(content).expect("static string");
        writeln!(
            out,
            "{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
            name,
            content.len() + 1,
            escaped
        )?;
    }
    Ok(())
}

/// Constant-expression size of a named struct type, the classic
/// null-pointer GEP trick.
pub fn sizeof(ty: &str) -> String {
    format!("ptrtoint (ptr getelementptr ({}, ptr null, i32 1) to i64)", ty)
}

/// A global nil-value initializer for Lox global variable slots.
pub fn uninitialized_global(name: &str) -> String {
    format!(
        "@g{} = internal global i64 {}",
        name,
        imm(super::value::UNINITIALIZED_VAL)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_object_type_embeds_the_header() {
        for line in TYPE_DEFINITIONS.lines() {
            if line.starts_with("%String")
                || line.starts_with("%Function")
                || line.starts_with("%Closure")
                || line.starts_with("%Upvalue")
                || line.starts_with("%Class")
                || line.starts_with("%Instance")
                || line.starts_with("%BoundMethod")
            {
                assert!(line.contains("{ %Obj,"), "missing header in: {}", line);
            }
        }
    }

    #[test]
    fn test_libc_surface_is_complete() {
        let all = LIBC_DECLARATIONS.join("\n");
        for symbol in [
            "@malloc", "@realloc", "@free", "@memcpy", "@memcmp", "@printf", "@fprintf",
            "@clock", "@getchar", "@exit",
        ] {
            assert!(all.contains(symbol), "missing {}", symbol);
        }
    }

    #[test]
    fn test_runtime_globals() {
        let mut out = String::new();
        emit_runtime_globals(&mut out).unwrap();
        assert!(out.contains("@objects = internal global ptr null"));
        assert!(out.contains("@nextGC = internal global i64 1048576"));
        assert!(out.contains("[512 x %Call]"));
    }

    #[test]
    fn test_sizeof_is_a_constant_expression() {
        assert_eq!(
            sizeof("%Obj"),
            "ptrtoint (ptr getelementptr (%Obj, ptr null, i32 1) to i64)"
        );
    }

    #[test]
    fn test_uninitialized_global_encoding() {
        assert_eq!(
            uninitialized_global("x"),
            "@gx = internal global i64 9221120237041090560"
        );
    }
}
