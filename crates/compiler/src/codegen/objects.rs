//! Object constructors for the callable and class machinery, plus the
//! open-upvalue registry.
//!
//! GC discipline: these helpers allocate exactly one object each and do
//! not pin their arguments; the *call sites* pin any intermediate object
//! that is reachable only through a register before invoking them.
//!
//! Upvalues created for captured locals are threaded onto the module
//! global `@openUpvalues` list. `$closeUpvalues(slot)` closes every open
//! upvalue whose location is `slot` (there can be several when the same
//! declaration runs in a loop), copying the stack value into the object
//! and retargeting the location pointer at the copy.

use super::runtime::sizeof;
use super::value::{NIL_VAL, imm};
use std::fmt::Write as _;

pub(super) fn emit_allocate_function(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateFunction(ptr %fn, ptr %name, i32 %arity, i1 %native) {{
entry:
  %obj = call ptr @$allocateObject(i8 2, i64 {size})
  %arity.ptr = getelementptr inbounds %Function, ptr %obj, i32 0, i32 1
  store i32 %arity, ptr %arity.ptr
  %fn.ptr = getelementptr inbounds %Function, ptr %obj, i32 0, i32 2
  store ptr %fn, ptr %fn.ptr
  %name.ptr = getelementptr inbounds %Function, ptr %obj, i32 0, i32 3
  store ptr %name, ptr %name.ptr
  %native.ptr = getelementptr inbounds %Function, ptr %obj, i32 0, i32 4
  store i1 %native, ptr %native.ptr
  ret ptr %obj
}}
",
        size = sizeof("%Function")
    )
}

/// Wrap a `%Function` in a closure. The upvalue array is allocated and
/// filled by the closure-creation sequence in the function compiler.
pub(super) fn emit_allocate_closure(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateClosure(ptr %function) {{
entry:
  %obj = call ptr @$allocateObject(i8 3, i64 {size})
  %fn.ptr = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 1
  store ptr %function, ptr %fn.ptr
  %upvalues.ptr = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 2
  store ptr null, ptr %upvalues.ptr
  %count.ptr = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 3
  store i32 0, ptr %count.ptr
  ret ptr %obj
}}
",
        size = sizeof("%Closure")
    )
}

/// The upvalue for a captured stack slot. A slot is captured once: if an
/// open upvalue already points at it, sibling closures share it, so
/// writes through one are seen through the other after closing too.
/// Fresh upvalues are registered on the open list for scope exit.
pub(super) fn emit_allocate_upvalue(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateUpvalue(ptr %slot) {{
entry:
  %head = load ptr, ptr @openUpvalues
  br label %search
search:
  %uv = phi ptr [ %head, %entry ], [ %next, %advance ]
  %miss = icmp eq ptr %uv, null
  br i1 %miss, label %create, label %inspect
inspect:
  %uv.location.ptr = getelementptr inbounds %Upvalue, ptr %uv, i32 0, i32 1
  %uv.location = load ptr, ptr %uv.location.ptr
  %match = icmp eq ptr %uv.location, %slot
  br i1 %match, label %reuse, label %advance
reuse:
  ret ptr %uv
advance:
  %uv.next.ptr = getelementptr inbounds %Upvalue, ptr %uv, i32 0, i32 2
  %next = load ptr, ptr %uv.next.ptr
  br label %search
create:
  %obj = call ptr @$allocateObject(i8 4, i64 {size})
  %location.ptr = getelementptr inbounds %Upvalue, ptr %obj, i32 0, i32 1
  store ptr %slot, ptr %location.ptr
  %head.now = load ptr, ptr @openUpvalues
  %next.ptr = getelementptr inbounds %Upvalue, ptr %obj, i32 0, i32 2
  store ptr %head.now, ptr %next.ptr
  %closed.ptr = getelementptr inbounds %Upvalue, ptr %obj, i32 0, i32 3
  store i64 {nil}, ptr %closed.ptr
  store ptr %obj, ptr @openUpvalues
  ret ptr %obj
}}
",
        size = sizeof("%Upvalue"),
        nil = imm(NIL_VAL)
    )
}

pub(super) fn emit_close_upvalues(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$closeUpvalues(ptr %slot) {
entry:
  %head = load ptr, ptr @openUpvalues
  br label %walk
walk:
  %prev = phi ptr [ null, %entry ], [ %prev.out, %continue ]
  %upvalue = phi ptr [ %head, %entry ], [ %next, %continue ]
  %done = icmp eq ptr %upvalue, null
  br i1 %done, label %end, label %inspect
inspect:
  %location.ptr = getelementptr inbounds %Upvalue, ptr %upvalue, i32 0, i32 1
  %location = load ptr, ptr %location.ptr
  %next.ptr = getelementptr inbounds %Upvalue, ptr %upvalue, i32 0, i32 2
  %next = load ptr, ptr %next.ptr
  %match = icmp eq ptr %location, %slot
  br i1 %match, label %close, label %keep
close:
  %value = load i64, ptr %location
  %closed.ptr = getelementptr inbounds %Upvalue, ptr %upvalue, i32 0, i32 3
  store i64 %value, ptr %closed.ptr
  store ptr %closed.ptr, ptr %location.ptr
  %at.head = icmp eq ptr %prev, null
  br i1 %at.head, label %unlink.head, label %unlink.mid
unlink.head:
  store ptr %next, ptr @openUpvalues
  br label %closed.done
unlink.mid:
  %prev.next.ptr = getelementptr inbounds %Upvalue, ptr %prev, i32 0, i32 2
  store ptr %next, ptr %prev.next.ptr
  br label %closed.done
closed.done:
  br label %continue
keep:
  br label %continue
continue:
  %prev.out = phi ptr [ %prev, %closed.done ], [ %upvalue, %keep ]
  br label %walk
end:
  ret void
}

",
    );
    Ok(())
}

/// Size and attach a closure's upvalue array. Separate from
/// `$allocateClosure` so zero-capture closures skip the malloc entirely.
pub(super) fn emit_allocate_upvalue_array(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal ptr @$allocateUpvalueArray(ptr %closure, i32 %count) {
entry:
  %count64 = sext i32 %count to i64
  %bytes = mul i64 %count64, 8
  %array = call ptr @malloc(i64 %bytes)
  %failed = icmp eq ptr %array, null
  br i1 %failed, label %oom, label %attach
oom:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.oom)
  call void @exit(i32 70)
  unreachable
attach:
  %upvalues.ptr = getelementptr inbounds %Closure, ptr %closure, i32 0, i32 2
  store ptr %array, ptr %upvalues.ptr
  %count.ptr = getelementptr inbounds %Closure, ptr %closure, i32 0, i32 3
  store i32 %count, ptr %count.ptr
  ret ptr %array
}

",
    );
    Ok(())
}

pub(super) fn emit_allocate_class(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateClass(ptr %name) {{
entry:
  %obj = call ptr @$allocateObject(i8 5, i64 {size})
  %name.ptr = getelementptr inbounds %Class, ptr %obj, i32 0, i32 1
  store ptr %name, ptr %name.ptr
  %methods = call ptr @$allocateTable()
  %methods.ptr = getelementptr inbounds %Class, ptr %obj, i32 0, i32 2
  store ptr %methods, ptr %methods.ptr
  ret ptr %obj
}}
",
        size = sizeof("%Class")
    )
}

pub(super) fn emit_allocate_instance(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateInstance(ptr %class) {{
entry:
  %obj = call ptr @$allocateObject(i8 6, i64 {size})
  %class.ptr = getelementptr inbounds %Instance, ptr %obj, i32 0, i32 1
  store ptr %class, ptr %class.ptr
  %fields = call ptr @$allocateTable()
  %fields.ptr = getelementptr inbounds %Instance, ptr %obj, i32 0, i32 2
  store ptr %fields, ptr %fields.ptr
  ret ptr %obj
}}
",
        size = sizeof("%Instance")
    )
}

/// Pair a receiver with a method closure; produced by property access,
/// consumed by calls.
pub(super) fn emit_bind_method(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$bindMethod(i64 %receiver, ptr %method) {{
entry:
  %obj = call ptr @$allocateObject(i8 7, i64 {size})
  %receiver.ptr = getelementptr inbounds %BoundMethod, ptr %obj, i32 0, i32 1
  store i64 %receiver, ptr %receiver.ptr
  %method.ptr = getelementptr inbounds %BoundMethod, ptr %obj, i32 0, i32 2
  store ptr %method, ptr %method.ptr
  ret ptr %obj
}}
",
        size = sizeof("%BoundMethod")
    )
}

pub(super) fn emit_all(out: &mut String) -> std::fmt::Result {
    emit_allocate_function(out)?;
    emit_allocate_closure(out)?;
    emit_allocate_upvalue(out)?;
    emit_allocate_upvalue_array(out)?;
    emit_close_upvalues(out)?;
    emit_allocate_class(out)?;
    emit_allocate_instance(out)?;
    emit_bind_method(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upvalue_starts_open_and_registered() {
        let mut out = String::new();
        emit_allocate_upvalue(&mut out).unwrap();
        // Location points at the stack slot, closed holds nil, and the
        // object becomes the new list head.
        assert!(out.contains("store ptr %slot, ptr %location.ptr"));
        assert!(out.contains(&format!("store i64 {}, ptr %closed.ptr", imm(NIL_VAL))));
        assert!(out.contains("store ptr %obj, ptr @openUpvalues"));
    }

    #[test]
    fn test_capturing_the_same_slot_reuses_the_open_upvalue() {
        let mut out = String::new();
        emit_allocate_upvalue(&mut out).unwrap();
        let search = out.find("%match = icmp eq ptr %uv.location, %slot").unwrap();
        let create = out.find("call ptr @$allocateObject(i8 4").unwrap();
        assert!(search < create);
        assert!(out.contains("ret ptr %uv"));
    }

    #[test]
    fn test_close_retargets_location_at_closed() {
        let mut out = String::new();
        emit_close_upvalues(&mut out).unwrap();
        assert!(out.contains("store i64 %value, ptr %closed.ptr"));
        assert!(out.contains("store ptr %closed.ptr, ptr %location.ptr"));
        // Closed upvalues are unlinked at the head or mid-list.
        assert!(out.contains("unlink.head:"));
        assert!(out.contains("unlink.mid:"));
    }

    #[test]
    fn test_class_and_instance_own_fresh_tables() {
        let mut out = String::new();
        emit_allocate_class(&mut out).unwrap();
        emit_allocate_instance(&mut out).unwrap();
        assert_eq!(out.matches("call ptr @$allocateTable()").count(), 2);
    }

    #[test]
    fn test_bound_method_stores_receiver_word() {
        let mut out = String::new();
        emit_bind_method(&mut out).unwrap();
        assert!(out.contains("store i64 %receiver, ptr %receiver.ptr"));
    }
}
