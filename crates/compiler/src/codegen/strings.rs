//! String runtime: hashing, interning, concatenation, printing.
//!
//! All strings are interned in the module-global `@strings` table, so
//! string equality elsewhere in the runtime is pointer equality. Two entry
//! points mirror the two ownership cases: `$internString` copies borrowed
//! bytes (literals, identifier constants), `$takeString` adopts a malloc'd
//! buffer (concatenation results) and frees it again on an intern hit.

use super::runtime::sizeof;
use super::value::{NIL_VAL, QNAN, SIGN_BIT, TRUE_VAL, imm};
use std::fmt::Write as _;

/// FNV-1a, 32 bits; the same bytes always produce the same hash.
pub(super) fn emit_hash_string(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal i32 @$hashString(ptr %chars, i32 %length) {
entry:
  br label %loop
loop:
  %i = phi i32 [ 0, %entry ], [ %i.next, %body ]
  %hash = phi i32 [ -2128831035, %entry ], [ %hash.next, %body ]
  %done = icmp sge i32 %i, %length
  br i1 %done, label %end, label %body
body:
  %char.ptr = getelementptr inbounds i8, ptr %chars, i32 %i
  %char = load i8, ptr %char.ptr
  %char32 = zext i8 %char to i32
  %mixed = xor i32 %hash, %char32
  %hash.next = mul i32 %mixed, 16777619
  %i.next = add i32 %i, 1
  br label %loop
end:
  ret i32 %hash
}

",
    );
    Ok(())
}

/// Build a `%String` object around an owned character buffer and register
/// it in the intern table. Callers have already checked for an intern hit.
pub(super) fn emit_allocate_string(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateString(ptr %buf, i32 %length, i32 %hash) {{
entry:
  %obj = call ptr @$allocateObject(i8 1, i64 {size})
  %chars.ptr = getelementptr inbounds %String, ptr %obj, i32 0, i32 1
  store ptr %buf, ptr %chars.ptr
  %length.ptr = getelementptr inbounds %String, ptr %obj, i32 0, i32 2
  store i32 %length, ptr %length.ptr
  %hash.ptr = getelementptr inbounds %String, ptr %obj, i32 0, i32 3
  store i32 %hash, ptr %hash.ptr
  %table = load ptr, ptr @strings
  %ignored = call i1 @$tableSet(ptr %table, ptr %obj, i64 {nil})
  ret ptr %obj
}}
",
        size = sizeof("%String"),
        nil = imm(NIL_VAL)
    )
}

/// Intern borrowed bytes: return the canonical string, copying the bytes
/// into a fresh buffer only on a miss.
pub(super) fn emit_intern_string(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal ptr @$internString(ptr %chars, i32 %length) {
entry:
  %hash = call i32 @$hashString(ptr %chars, i32 %length)
  %existing = call ptr @$tableFindString(ptr %chars, i32 %length, i32 %hash)
  %hit = icmp ne ptr %existing, null
  br i1 %hit, label %found, label %copy
found:
  ret ptr %existing
copy:
  %len64 = sext i32 %length to i64
  %size = add i64 %len64, 1
  %buf = call ptr @malloc(i64 %size)
  %failed = icmp eq ptr %buf, null
  br i1 %failed, label %oom, label %fill
oom:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.oom)
  call void @exit(i32 70)
  unreachable
fill:
  call ptr @memcpy(ptr %buf, ptr %chars, i64 %len64)
  %nul.ptr = getelementptr inbounds i8, ptr %buf, i64 %len64
  store i8 0, ptr %nul.ptr
  %obj = call ptr @$allocateString(ptr %buf, i32 %length, i32 %hash)
  ret ptr %obj
}

",
    );
    Ok(())
}

/// Intern an owned buffer: on a hit the new bytes are freed and the
/// existing string returned, so equal strings stay pointer-equal.
pub(super) fn emit_take_string(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal ptr @$takeString(ptr %buf, i32 %length) {
entry:
  %hash = call i32 @$hashString(ptr %buf, i32 %length)
  %existing = call ptr @$tableFindString(ptr %buf, i32 %length, i32 %hash)
  %hit = icmp ne ptr %existing, null
  br i1 %hit, label %found, label %adopt
found:
  call void @free(ptr %buf)
  ret ptr %existing
adopt:
  %obj = call ptr @$allocateString(ptr %buf, i32 %length, i32 %hash)
  ret ptr %obj
}

",
    );
    Ok(())
}

/// String concatenation for `+`: new buffer of `|a| + |b| + 1`, both
/// halves copied, then interned as an owned buffer.
pub(super) fn emit_concat(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal i64 @$concat(i64 %a, i64 %b) {{
entry:
  %a.bits = and i64 %a, {unmask}
  %a.obj = inttoptr i64 %a.bits to ptr
  %b.bits = and i64 %b, {unmask}
  %b.obj = inttoptr i64 %b.bits to ptr
  %a.len.ptr = getelementptr inbounds %String, ptr %a.obj, i32 0, i32 2
  %a.len = load i32, ptr %a.len.ptr
  %b.len.ptr = getelementptr inbounds %String, ptr %b.obj, i32 0, i32 2
  %b.len = load i32, ptr %b.len.ptr
  %total = add i32 %a.len, %b.len
  %total64 = sext i32 %total to i64
  %size = add i64 %total64, 1
  %buf = call ptr @malloc(i64 %size)
  %failed = icmp eq ptr %buf, null
  br i1 %failed, label %oom, label %fill
oom:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.oom)
  call void @exit(i32 70)
  unreachable
fill:
  %a.chars.ptr = getelementptr inbounds %String, ptr %a.obj, i32 0, i32 1
  %a.chars = load ptr, ptr %a.chars.ptr
  %a.len64 = sext i32 %a.len to i64
  call ptr @memcpy(ptr %buf, ptr %a.chars, i64 %a.len64)
  %rest = getelementptr inbounds i8, ptr %buf, i64 %a.len64
  %b.chars.ptr = getelementptr inbounds %String, ptr %b.obj, i32 0, i32 1
  %b.chars = load ptr, ptr %b.chars.ptr
  %b.len64 = sext i32 %b.len to i64
  call ptr @memcpy(ptr %rest, ptr %b.chars, i64 %b.len64)
  %nul.ptr = getelementptr inbounds i8, ptr %buf, i64 %total64
  store i8 0, ptr %nul.ptr
  %obj = call ptr @$takeString(ptr %buf, i32 %total)
  %obj.int = ptrtoint ptr %obj to i64
  %boxed = or i64 %obj.int, {objmask}
  ret i64 %boxed
}}
",
        unmask = imm(!(QNAN | SIGN_BIT)),
        objmask = imm(QNAN | SIGN_BIT)
    )
}

/// Content equality: length, then bytes. Interning makes this pointer
/// comparison in practice; the byte path is kept as the ground truth.
pub(super) fn emit_str_equals(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal i1 @$strEquals(i64 %a, i64 %b) {{
entry:
  %a.bits = and i64 %a, {unmask}
  %a.obj = inttoptr i64 %a.bits to ptr
  %b.bits = and i64 %b, {unmask}
  %b.obj = inttoptr i64 %b.bits to ptr
  %a.len.ptr = getelementptr inbounds %String, ptr %a.obj, i32 0, i32 2
  %a.len = load i32, ptr %a.len.ptr
  %b.len.ptr = getelementptr inbounds %String, ptr %b.obj, i32 0, i32 2
  %b.len = load i32, ptr %b.len.ptr
  %len.eq = icmp eq i32 %a.len, %b.len
  br i1 %len.eq, label %compare, label %unequal
compare:
  %a.chars.ptr = getelementptr inbounds %String, ptr %a.obj, i32 0, i32 1
  %a.chars = load ptr, ptr %a.chars.ptr
  %b.chars.ptr = getelementptr inbounds %String, ptr %b.obj, i32 0, i32 1
  %b.chars = load ptr, ptr %b.chars.ptr
  %len64 = sext i32 %a.len to i64
  %order = call i32 @memcmp(ptr %a.chars, ptr %b.chars, i64 %len64)
  %eq = icmp eq i32 %order, 0
  ret i1 %eq
unequal:
  ret i1 false
}}
",
        unmask = imm(!(QNAN | SIGN_BIT))
    )
}

/// Emit a value printer. `$print` goes to stdout via printf; `$printErr`
/// is the same dispatch over fprintf(stderr), used by the `printerr`
/// native and the runtime error paths.
fn emit_print_fn(out: &mut String, symbol: &str, to_stderr: bool) -> std::fmt::Result {
    let prologue = if to_stderr {
        "  %stream = load ptr, ptr @stderr\n"
    } else {
        ""
    };
    let call = |args: &str| -> String {
        if to_stderr {
            format!("call i32 (ptr, ptr, ...) @fprintf(ptr %stream, {})", args)
        } else {
            format!("call i32 (ptr, ...) @printf({})", args)
        }
    };

    writeln!(out, "define internal void @{}(i64 %value) {{", symbol)?;
    out.push_str("entry:\n");
    out.push_str(prologue);
    writeln!(
        out,
        "  %or1 = or i64 %value, 1
  %is.bool = icmp eq i64 %or1, {true_val}
  br i1 %is.bool, label %bool, label %check.nil
bool:
  %is.true = icmp eq i64 %value, {true_val}
  %word = select i1 %is.true, ptr @str.true, ptr @str.false
  {print_bool}
  ret void
check.nil:
  %is.nil = icmp eq i64 %value, {nil_val}
  br i1 %is.nil, label %nil, label %check.num
nil:
  {print_nil}
  ret void
check.num:
  %masked = and i64 %value, {qnan}
  %is.num = icmp ne i64 %masked, {qnan}
  br i1 %is.num, label %number, label %object
number:
  %double = bitcast i64 %value to double
  {print_num}
  ret void
object:
  %bits = and i64 %value, {unmask}
  %obj = inttoptr i64 %bits to ptr
  %type.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 0
  %type = load i8, ptr %type.ptr
  switch i8 %type, label %default [
    i8 1, label %string
    i8 2, label %function
    i8 3, label %closure
    i8 5, label %class
    i8 6, label %instance
    i8 7, label %bound
  ]
string:
  %chars.ptr = getelementptr inbounds %String, ptr %obj, i32 0, i32 1
  %chars = load ptr, ptr %chars.ptr
  {print_string}
  ret void
function:
  br label %callable
closure:
  %fn.field = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 1
  %fn.inner = load ptr, ptr %fn.field
  br label %callable
callable:
  %fn = phi ptr [ %obj, %function ], [ %fn.inner, %closure ]
  %native.ptr = getelementptr inbounds %Function, ptr %fn, i32 0, i32 4
  %native = load i1, ptr %native.ptr
  br i1 %native, label %native.fn, label %named.fn
native.fn:
  {print_native}
  ret void
named.fn:
  %fn.name.ptr = getelementptr inbounds %Function, ptr %fn, i32 0, i32 3
  %fn.name = load ptr, ptr %fn.name.ptr
  %fn.chars.ptr = getelementptr inbounds %String, ptr %fn.name, i32 0, i32 1
  %fn.chars = load ptr, ptr %fn.chars.ptr
  {print_fn}
  ret void
class:
  %cls.name.ptr = getelementptr inbounds %Class, ptr %obj, i32 0, i32 1
  %cls.name = load ptr, ptr %cls.name.ptr
  %cls.chars.ptr = getelementptr inbounds %String, ptr %cls.name, i32 0, i32 1
  %cls.chars = load ptr, ptr %cls.chars.ptr
  {print_class}
  ret void
instance:
  %inst.class.ptr = getelementptr inbounds %Instance, ptr %obj, i32 0, i32 1
  %inst.class = load ptr, ptr %inst.class.ptr
  %inst.name.ptr = getelementptr inbounds %Class, ptr %inst.class, i32 0, i32 1
  %inst.name = load ptr, ptr %inst.name.ptr
  %inst.chars.ptr = getelementptr inbounds %String, ptr %inst.name, i32 0, i32 1
  %inst.chars = load ptr, ptr %inst.chars.ptr
  {print_instance}
  ret void
bound:
  %method.ptr = getelementptr inbounds %BoundMethod, ptr %obj, i32 0, i32 2
  %method = load ptr, ptr %method.ptr
  %bm.fn.ptr = getelementptr inbounds %Closure, ptr %method, i32 0, i32 1
  %bm.fn = load ptr, ptr %bm.fn.ptr
  %bm.name.ptr = getelementptr inbounds %Function, ptr %bm.fn, i32 0, i32 3
  %bm.name = load ptr, ptr %bm.name.ptr
  %bm.chars.ptr = getelementptr inbounds %String, ptr %bm.name, i32 0, i32 1
  %bm.chars = load ptr, ptr %bm.chars.ptr
  {print_bound}
  ret void
default:
  ret void
}}
",
        true_val = imm(TRUE_VAL),
        nil_val = imm(NIL_VAL),
        qnan = imm(QNAN),
        unmask = imm(!(QNAN | SIGN_BIT)),
        print_bool = call("ptr @fmt.s, ptr %word"),
        print_nil = call("ptr @fmt.s, ptr @str.nil"),
        print_num = call("ptr @fmt.g, double %double"),
        print_string = call("ptr @fmt.s, ptr %chars"),
        print_native = call("ptr @str.native.fn"),
        print_fn = call("ptr @fmt.fn, ptr %fn.chars"),
        print_class = call("ptr @fmt.s, ptr %cls.chars"),
        print_instance = call("ptr @fmt.instance, ptr %inst.chars"),
        print_bound = call("ptr @fmt.fn, ptr %bm.chars"),
    )
}

/// Emit every string helper plus the two printers.
pub(super) fn emit_all(out: &mut String) -> std::fmt::Result {
    emit_hash_string(out)?;
    emit_allocate_string(out)?;
    emit_intern_string(out)?;
    emit_take_string(out)?;
    emit_concat(out)?;
    emit_str_equals(out)?;
    emit_print_fn(out, "$print", false)?;
    emit_print_fn(out, "$printErr", true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(f: impl Fn(&mut String) -> std::fmt::Result) -> String {
        let mut out = String::new();
        f(&mut out).unwrap();
        out
    }

    #[test]
    fn test_hash_is_fnv1a() {
        let ir = emit(emit_hash_string);
        // FNV offset basis 2166136261 as a signed i32, and the FNV prime.
        assert!(ir.contains("-2128831035"));
        assert!(ir.contains("16777619"));
    }

    #[test]
    fn test_take_string_frees_on_intern_hit() {
        let ir = emit(emit_take_string);
        assert!(ir.contains("call void @free(ptr %buf)"));
        assert!(ir.contains("ret ptr %existing"));
    }

    #[test]
    fn test_intern_string_copies_on_miss() {
        let ir = emit(emit_intern_string);
        assert!(ir.contains("call ptr @memcpy(ptr %buf, ptr %chars, i64 %len64)"));
        assert!(ir.contains("store i8 0, ptr %nul.ptr"));
    }

    #[test]
    fn test_concat_allocates_joint_length_plus_nul() {
        let ir = emit(emit_concat);
        assert!(ir.contains("%total = add i32 %a.len, %b.len"));
        assert!(ir.contains("%size = add i64 %total64, 1"));
        assert!(ir.contains("call ptr @$takeString(ptr %buf, i32 %total)"));
    }

    #[test]
    fn test_str_equals_checks_length_before_bytes() {
        let ir = emit(emit_str_equals);
        let len = ir.find("%len.eq").unwrap();
        let cmp = ir.find("@memcmp").unwrap();
        assert!(len < cmp);
    }

    #[test]
    fn test_printers_cover_every_value_shape() {
        let mut out = String::new();
        emit_print_fn(&mut out, "$print", false).unwrap();
        for label in [
            "bool:", "nil:", "number:", "string:", "callable:", "class:", "instance:", "bound:",
        ] {
            assert!(out.contains(label), "missing {}", label);
        }
        assert!(out.contains("@printf"));

        let mut err = String::new();
        emit_print_fn(&mut err, "$printErr", true).unwrap();
        assert!(err.contains("@fprintf"));
        assert!(err.contains("load ptr, ptr @stderr"));
    }
}
