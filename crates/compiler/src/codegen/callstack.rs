//! The runtime call stack: a fixed array of `{line, name}` frames used
//! for stack-overflow detection and error traces.
//!
//! Frames are pushed at call sites (line of the call, name of the callee)
//! and popped on return. The trace printer walks top-down, printing
//! `[line L] in <fn>()` per frame and `[line L] in script` for the
//! outermost one.

use super::state::MAX_CALL_STACK_SIZE;
use std::fmt::Write as _;

pub(super) fn emit_push_call(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal void @$pushCall(i32 %line, ptr %name) {{
entry:
  %sp = load i32, ptr @callsp
  %frame = getelementptr inbounds [{max} x %Call], ptr @callstack, i32 0, i32 %sp
  %line.ptr = getelementptr inbounds %Call, ptr %frame, i32 0, i32 0
  store i32 %line, ptr %line.ptr
  %name.ptr = getelementptr inbounds %Call, ptr %frame, i32 0, i32 1
  store ptr %name, ptr %name.ptr
  %sp.next = add i32 %sp, 1
  store i32 %sp.next, ptr @callsp
  ret void
}}
",
        max = MAX_CALL_STACK_SIZE
    )
}

pub(super) fn emit_pop_call(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$popCall() {
entry:
  %sp = load i32, ptr @callsp
  %sp.next = sub i32 %sp, 1
  store i32 %sp.next, ptr @callsp
  ret void
}

",
    );
    Ok(())
}

pub(super) fn emit_print_stack_trace(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal void @$printStackTrace() {{
entry:
  %stream = load ptr, ptr @stderr
  %sp = load i32, ptr @callsp
  br label %loop
loop:
  %i = phi i32 [ 1, %entry ], [ %i.next, %step ]
  %done = icmp sgt i32 %i, %sp
  br i1 %done, label %end, label %body
body:
  %top = sub i32 %sp, %i
  %frame = getelementptr inbounds [{max} x %Call], ptr @callstack, i32 0, i32 %top
  %line.ptr = getelementptr inbounds %Call, ptr %frame, i32 0, i32 0
  %line = load i32, ptr %line.ptr
  %name.ptr = getelementptr inbounds %Call, ptr %frame, i32 0, i32 1
  %name = load ptr, ptr %name.ptr
  %bottom = icmp eq i32 %i, %sp
  br i1 %bottom, label %script, label %named
script:
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @fmt.trace.script, i32 %line)
  br label %step
named:
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @fmt.trace.fn, i32 %line, ptr %name)
  br label %step
step:
  %i.next = add i32 %i, 1
  br label %loop
end:
  ret void
}}
",
        max = MAX_CALL_STACK_SIZE
    )
}

/// Raise "Stack overflow." when one more frame would not fit.
pub(super) fn emit_check_stack_overflow(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal void @$checkStackOverflow(i32 %line, ptr %name) {{
entry:
  %sp = load i32, ptr @callsp
  %over = icmp sge i32 %sp, {limit}
  br i1 %over, label %overflow, label %ok
overflow:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.stackoverflow)
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @fmt.trace.fn, i32 %line, ptr %name)
  call void @$printStackTrace()
  call void @exit(i32 70)
  unreachable
ok:
  ret void
}}
",
        limit = MAX_CALL_STACK_SIZE - 1
    )
}

pub(super) fn emit_all(out: &mut String) -> std::fmt::Result {
    emit_push_call(out)?;
    emit_pop_call(out)?;
    emit_print_stack_trace(out)?;
    emit_check_stack_overflow(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_limit_is_capacity_minus_one() {
        let mut out = String::new();
        emit_check_stack_overflow(&mut out).unwrap();
        assert!(out.contains("icmp sge i32 %sp, 511"));
        assert!(out.contains("@err.stackoverflow"));
        assert!(out.contains("call void @exit(i32 70)"));
    }

    #[test]
    fn test_trace_bottoms_out_in_script() {
        let mut out = String::new();
        emit_print_stack_trace(&mut out).unwrap();
        assert!(out.contains("@fmt.trace.script"));
        assert!(out.contains("@fmt.trace.fn"));
        assert!(out.contains("%bottom = icmp eq i32 %i, %sp"));
    }

    #[test]
    fn test_push_records_line_and_name() {
        let mut out = String::new();
        emit_push_call(&mut out).unwrap();
        assert!(out.contains("store i32 %line, ptr %line.ptr"));
        assert!(out.contains("store ptr %name, ptr %name.ptr"));
    }
}
