//! The precise tri-color mark-and-sweep collector, emitted as IR.
//!
//! Roots are the locals stack (addresses of live locals and pinned
//! temporaries), the globals stack (addresses of defined global slots),
//! the open-upvalue list, and the pinned `$initString` constant. Marking
//! pushes onto the gray stack; tracing pops and blackens until the queue
//! drains. Before sweep, the intern table drops entries whose key string
//! is unmarked, making it a weak set. Sweep unlinks and frees every
//! unmarked object on the intrusive `@objects` list and clears the mark
//! bit on survivors, then the threshold is reset to twice the live heap.

use super::value::{QNAN, SIGN_BIT, imm};
use std::fmt::Write as _;

pub(super) fn emit_mark_object(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$markObject(ptr %obj) {
entry:
  %is.null = icmp eq ptr %obj, null
  br i1 %is.null, label %end, label %check
check:
  %marked.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 1
  %marked = load i1, ptr %marked.ptr
  br i1 %marked, label %end, label %mark
mark:
  store i1 true, ptr %marked.ptr
  call void @$stackPush(ptr @stack.gray, ptr %obj)
  br label %end
end:
  ret void
}

",
    );
    Ok(())
}

/// Mark a value word: only object pointers are interesting.
pub(super) fn emit_mark_value(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal void @$markValue(i64 %value) {{
entry:
  %masked = and i64 %value, {objmask}
  %is.obj = icmp eq i64 %masked, {objmask}
  br i1 %is.obj, label %mark, label %end
mark:
  %bits = and i64 %value, {unmask}
  %obj = inttoptr i64 %bits to ptr
  call void @$markObject(ptr %obj)
  br label %end
end:
  ret void
}}
",
        objmask = imm(QNAN | SIGN_BIT),
        unmask = imm(!(QNAN | SIGN_BIT))
    )
}

/// Mark every key and value of a table (method tables, field tables).
pub(super) fn emit_mark_table(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$markTable(ptr %table) {
entry:
  %capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  %capacity = load i32, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %entries = load ptr, ptr %entries.ptr
  br label %walk
walk:
  %i = phi i32 [ 0, %entry ], [ %i.next, %step ]
  %done = icmp sge i32 %i, %capacity
  br i1 %done, label %end, label %inspect
inspect:
  %slot = getelementptr inbounds %Entry, ptr %entries, i32 %i
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  %key = load ptr, ptr %key.ptr
  %skip = icmp eq ptr %key, null
  br i1 %skip, label %step, label %mark
mark:
  call void @$markObject(ptr %key)
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  %value = load i64, ptr %value.ptr
  call void @$markValue(i64 %value)
  br label %step
step:
  %i.next = add i32 %i, 1
  br label %walk
end:
  ret void
}

",
    );
    Ok(())
}

/// Blacken one gray object: enqueue its outgoing references by type.
pub(super) fn emit_blacken_object(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$blackenObject(ptr %obj) {
entry:
  %type.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 0
  %type = load i8, ptr %type.ptr
  switch i8 %type, label %end [
    i8 2, label %function
    i8 3, label %closure
    i8 4, label %upvalue
    i8 5, label %class
    i8 6, label %instance
    i8 7, label %bound
  ]
function:
  %fn.name.ptr = getelementptr inbounds %Function, ptr %obj, i32 0, i32 3
  %fn.name = load ptr, ptr %fn.name.ptr
  call void @$markObject(ptr %fn.name)
  br label %end
closure:
  %cl.fn.ptr = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 1
  %cl.fn = load ptr, ptr %cl.fn.ptr
  call void @$markObject(ptr %cl.fn)
  %upvalues.ptr = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 2
  %upvalues = load ptr, ptr %upvalues.ptr
  %count.ptr = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 3
  %count = load i32, ptr %count.ptr
  br label %uv.walk
uv.walk:
  %i = phi i32 [ 0, %closure ], [ %i.next, %uv.body ]
  %uv.done = icmp sge i32 %i, %count
  br i1 %uv.done, label %end, label %uv.body
uv.body:
  %uv.slot = getelementptr inbounds ptr, ptr %upvalues, i32 %i
  %uv = load ptr, ptr %uv.slot
  call void @$markObject(ptr %uv)
  %i.next = add i32 %i, 1
  br label %uv.walk
upvalue:
  %closed.ptr = getelementptr inbounds %Upvalue, ptr %obj, i32 0, i32 3
  %closed = load i64, ptr %closed.ptr
  call void @$markValue(i64 %closed)
  br label %end
class:
  %cls.name.ptr = getelementptr inbounds %Class, ptr %obj, i32 0, i32 1
  %cls.name = load ptr, ptr %cls.name.ptr
  call void @$markObject(ptr %cls.name)
  %methods.ptr = getelementptr inbounds %Class, ptr %obj, i32 0, i32 2
  %methods = load ptr, ptr %methods.ptr
  call void @$markTable(ptr %methods)
  br label %end
instance:
  %inst.class.ptr = getelementptr inbounds %Instance, ptr %obj, i32 0, i32 1
  %inst.class = load ptr, ptr %inst.class.ptr
  call void @$markObject(ptr %inst.class)
  %fields.ptr = getelementptr inbounds %Instance, ptr %obj, i32 0, i32 2
  %fields = load ptr, ptr %fields.ptr
  call void @$markTable(ptr %fields)
  br label %end
bound:
  %receiver.ptr = getelementptr inbounds %BoundMethod, ptr %obj, i32 0, i32 1
  %receiver = load i64, ptr %receiver.ptr
  call void @$markValue(i64 %receiver)
  %method.ptr = getelementptr inbounds %BoundMethod, ptr %obj, i32 0, i32 2
  %method = load ptr, ptr %method.ptr
  call void @$markObject(ptr %method)
  br label %end
end:
  ret void
}

",
    );
    Ok(())
}

/// Mark the values behind the slot addresses held by a root stack.
pub(super) fn emit_mark_stack_values(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$markStackValues(ptr %stack) {
entry:
  %count.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 1
  %count = load i32, ptr %count.ptr
  %data.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 0
  %data = load ptr, ptr %data.ptr
  br label %walk
walk:
  %i = phi i32 [ 0, %entry ], [ %i.next, %step ]
  %done = icmp sge i32 %i, %count
  br i1 %done, label %end, label %inspect
inspect:
  %slot.ptr = getelementptr inbounds ptr, ptr %data, i32 %i
  %slot = load ptr, ptr %slot.ptr
  %skip = icmp eq ptr %slot, null
  br i1 %skip, label %step, label %mark
mark:
  %value = load i64, ptr %slot
  call void @$markValue(i64 %value)
  br label %step
step:
  %i.next = add i32 %i, 1
  br label %walk
end:
  ret void
}

",
    );
    Ok(())
}

pub(super) fn emit_mark_roots(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$markRoots() {
entry:
  call void @$markStackValues(ptr @stack.locals)
  call void @$markStackValues(ptr @stack.globals)
  %head = load ptr, ptr @openUpvalues
  br label %walk
walk:
  %uv = phi ptr [ %head, %entry ], [ %next, %body ]
  %done = icmp eq ptr %uv, null
  br i1 %done, label %pinned, label %body
body:
  %next.ptr = getelementptr inbounds %Upvalue, ptr %uv, i32 0, i32 2
  %next = load ptr, ptr %next.ptr
  call void @$markObject(ptr %uv)
  br label %walk
pinned:
  %init = load ptr, ptr @initString
  call void @$markObject(ptr %init)
  ret void
}

",
    );
    Ok(())
}

/// Drain the gray stack, blackening as we go. The stack is empty when
/// collection finishes.
pub(super) fn emit_trace_references(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$traceReferences() {
entry:
  br label %loop
loop:
  %count = load i32, ptr getelementptr inbounds (%Stack, ptr @stack.gray, i32 0, i32 1)
  %empty = icmp sle i32 %count, 0
  br i1 %empty, label %end, label %pop
pop:
  %top = sub i32 %count, 1
  store i32 %top, ptr getelementptr inbounds (%Stack, ptr @stack.gray, i32 0, i32 1)
  %data = load ptr, ptr getelementptr inbounds (%Stack, ptr @stack.gray, i32 0, i32 0)
  %slot = getelementptr inbounds ptr, ptr %data, i32 %top
  %obj = load ptr, ptr %slot
  call void @$blackenObject(ptr %obj)
  br label %loop
end:
  ret void
}

",
    );
    Ok(())
}

/// The intern table holds its keys weakly: unmarked strings are deleted
/// before sweep frees them, so the table never dangles.
pub(super) fn emit_remove_white_strings(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$removeWhiteStrings() {
entry:
  %table = load ptr, ptr @strings
  %no.table = icmp eq ptr %table, null
  br i1 %no.table, label %end, label %setup
setup:
  %capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  %capacity = load i32, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %entries = load ptr, ptr %entries.ptr
  br label %walk
walk:
  %i = phi i32 [ 0, %setup ], [ %i.next, %step ]
  %done = icmp sge i32 %i, %capacity
  br i1 %done, label %end, label %inspect
inspect:
  %slot = getelementptr inbounds %Entry, ptr %entries, i32 %i
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  %key = load ptr, ptr %key.ptr
  %skip = icmp eq ptr %key, null
  br i1 %skip, label %step, label %check
check:
  %marked.ptr = getelementptr inbounds %Obj, ptr %key, i32 0, i32 1
  %marked = load i1, ptr %marked.ptr
  br i1 %marked, label %step, label %white
white:
  %removed = call i1 @$tableDelete(ptr %table, ptr %key)
  br label %step
step:
  %i.next = add i32 %i, 1
  br label %walk
end:
  ret void
}

",
    );
    Ok(())
}

/// Unlink and free unmarked objects; clear the mark bit on survivors.
pub(super) fn emit_sweep(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$sweep() {
entry:
  %head = load ptr, ptr @objects
  br label %walk
walk:
  %prev = phi ptr [ null, %entry ], [ %prev.out, %continue ]
  %obj = phi ptr [ %head, %entry ], [ %next, %continue ]
  %done = icmp eq ptr %obj, null
  br i1 %done, label %end, label %inspect
inspect:
  %next.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 2
  %next = load ptr, ptr %next.ptr
  %marked.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 1
  %marked = load i1, ptr %marked.ptr
  br i1 %marked, label %keep, label %reap
keep:
  store i1 false, ptr %marked.ptr
  br label %continue
reap:
  %at.head = icmp eq ptr %prev, null
  br i1 %at.head, label %unlink.head, label %unlink.mid
unlink.head:
  store ptr %next, ptr @objects
  br label %reap.done
unlink.mid:
  %prev.next.ptr = getelementptr inbounds %Obj, ptr %prev, i32 0, i32 2
  store ptr %next, ptr %prev.next.ptr
  br label %reap.done
reap.done:
  call void @$freeObject(ptr %obj)
  br label %continue
continue:
  %prev.out = phi ptr [ %obj, %keep ], [ %prev, %reap.done ]
  br label %walk
end:
  ret void
}

",
    );
    Ok(())
}

pub(super) fn emit_gc(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$gc() {
entry:
  call void @$markRoots()
  call void @$traceReferences()
  call void @$removeWhiteStrings()
  call void @$sweep()
  %bytes = load i64, ptr @allocatedBytes
  %next = mul i64 %bytes, 2
  store i64 %next, ptr @nextGC
  ret void
}

",
    );
    Ok(())
}

pub(super) fn emit_all(out: &mut String) -> std::fmt::Result {
    emit_mark_object(out)?;
    emit_mark_value(out)?;
    emit_mark_table(out)?;
    emit_blacken_object(out)?;
    emit_mark_stack_values(out)?;
    emit_mark_roots(out)?;
    emit_trace_references(out)?;
    emit_remove_white_strings(out)?;
    emit_sweep(out)?;
    emit_gc(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_sets_bit_then_queues() {
        let mut out = String::new();
        emit_mark_object(&mut out).unwrap();
        let set = out.find("store i1 true, ptr %marked.ptr").unwrap();
        let push = out
            .find("call void @$stackPush(ptr @stack.gray, ptr %obj)")
            .unwrap();
        assert!(set < push);
    }

    #[test]
    fn test_blacken_covers_every_heap_type_with_children() {
        let mut out = String::new();
        emit_blacken_object(&mut out).unwrap();
        for label in ["function:", "closure:", "upvalue:", "class:", "instance:", "bound:"] {
            assert!(out.contains(label), "missing {}", label);
        }
        // Strings have no children: tag 1 is absent from the switch.
        assert!(!out.contains("i8 1, label"));
    }

    #[test]
    fn test_roots_are_locals_globals_upvalues_and_init_string() {
        let mut out = String::new();
        emit_mark_roots(&mut out).unwrap();
        assert!(out.contains("@stack.locals"));
        assert!(out.contains("@stack.globals"));
        assert!(out.contains("@openUpvalues"));
        assert!(out.contains("@initString"));
    }

    #[test]
    fn test_gc_phase_order() {
        let mut out = String::new();
        emit_gc(&mut out).unwrap();
        let mark = out.find("@$markRoots").unwrap();
        let trace = out.find("@$traceReferences").unwrap();
        let weak = out.find("@$removeWhiteStrings").unwrap();
        let sweep = out.find("@$sweep").unwrap();
        assert!(mark < trace && trace < weak && weak < sweep);
    }

    #[test]
    fn test_threshold_doubles_live_heap() {
        let mut out = String::new();
        emit_gc(&mut out).unwrap();
        assert!(out.contains("%next = mul i64 %bytes, 2"));
        assert!(out.contains("store i64 %next, ptr @nextGC"));
    }

    #[test]
    fn test_sweep_clears_marks_on_survivors() {
        let mut out = String::new();
        emit_sweep(&mut out).unwrap();
        assert!(out.contains("store i1 false, ptr %marked.ptr"));
        assert!(out.contains("call void @$freeObject(ptr %obj)"));
    }

    #[test]
    fn test_intern_table_is_weak() {
        let mut out = String::new();
        emit_remove_white_strings(&mut out).unwrap();
        assert!(out.contains("call i1 @$tableDelete(ptr %table, ptr %key)"));
    }
}
