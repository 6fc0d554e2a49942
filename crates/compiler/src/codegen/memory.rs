//! Heap allocation helpers emitted into the module.
//!
//! `$allocateObject` is the single chokepoint for object allocation: it
//! does the GC accounting and trigger, writes the object header, and
//! threads the new object onto the intrusive `@objects` list that sweep
//! walks. Auxiliary buffers (string characters, upvalue arrays, table
//! entries) are plain malloc memory owned by their object and freed with
//! it.

use std::fmt::Write as _;

/// Emit `$allocateObject`. In stress mode every allocation collects
/// first; otherwise collection runs when the heap outgrows `@nextGC`.
pub(super) fn emit_allocate_object(out: &mut String, stress_gc: bool) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateObject(i8 %type, i64 %size) {{"
    )?;
    out.push_str(
        "entry:
  %bytes0 = load i64, ptr @allocatedBytes
  %bytes = add i64 %bytes0, %size
  store i64 %bytes, ptr @allocatedBytes
",
    );
    if stress_gc {
        out.push_str("  br label %collect\n");
    } else {
        out.push_str(
            "  %threshold = load i64, ptr @nextGC
  %pressure = icmp sgt i64 %bytes, %threshold
  br i1 %pressure, label %collect, label %allocate
",
        );
    }
    out.push_str(
        "collect:
  call void @$gc()
  br label %allocate
allocate:
  %obj = call ptr @malloc(i64 %size)
  %failed = icmp eq ptr %obj, null
  br i1 %failed, label %oom, label %initialize
oom:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.oom)
  call void @$printStackTrace()
  call void @exit(i32 70)
  unreachable
initialize:
  %type.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 0
  store i8 %type, ptr %type.ptr
  %marked.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 1
  store i1 false, ptr %marked.ptr
  %head = load ptr, ptr @objects
  %next.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 2
  store ptr %head, ptr %next.ptr
  store ptr %obj, ptr @objects
  ret ptr %obj
}

",
    );
    Ok(())
}

/// Emit `$freeObject`: release an object and the buffers it owns, and
/// give its bytes back to the GC accounting.
pub(super) fn emit_free_object(out: &mut String) -> std::fmt::Result {
    use super::runtime::sizeof;
    writeln!(
        out,
        "define internal void @$freeObject(ptr %obj) {{
entry:
  %type.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 0
  %type = load i8, ptr %type.ptr
  %is.function = icmp eq i8 %type, 2
  %is.closure = icmp eq i8 %type, 3
  %is.upvalue = icmp eq i8 %type, 4
  %is.class = icmp eq i8 %type, 5
  %is.instance = icmp eq i8 %type, 6
  %is.bound = icmp eq i8 %type, 7
  %size.1 = select i1 %is.function, i64 {function}, i64 {string}
  %size.2 = select i1 %is.closure, i64 {closure}, i64 %size.1
  %size.3 = select i1 %is.upvalue, i64 {upvalue}, i64 %size.2
  %size.4 = select i1 %is.class, i64 {class}, i64 %size.3
  %size.5 = select i1 %is.instance, i64 {instance}, i64 %size.4
  %size = select i1 %is.bound, i64 {bound}, i64 %size.5
  %bytes = load i64, ptr @allocatedBytes
  %bytes.left = sub i64 %bytes, %size
  store i64 %bytes.left, ptr @allocatedBytes
  br label %dispatch
dispatch:
  switch i8 %type, label %plain [",
        string = sizeof("%String"),
        function = sizeof("%Function"),
        closure = sizeof("%Closure"),
        upvalue = sizeof("%Upvalue"),
        class = sizeof("%Class"),
        instance = sizeof("%Instance"),
        bound = sizeof("%BoundMethod"),
    )?;
    out.push_str(
        "
    i8 1, label %string
    i8 3, label %closure
    i8 5, label %class
    i8 6, label %instance
  ]
string:
  %chars.ptr = getelementptr inbounds %String, ptr %obj, i32 0, i32 1
  %chars = load ptr, ptr %chars.ptr
  call void @free(ptr %chars)
  br label %plain
closure:
  %upvalues.ptr = getelementptr inbounds %Closure, ptr %obj, i32 0, i32 2
  %upvalues = load ptr, ptr %upvalues.ptr
  call void @free(ptr %upvalues)
  br label %plain
class:
  %methods.ptr = getelementptr inbounds %Class, ptr %obj, i32 0, i32 2
  %methods = load ptr, ptr %methods.ptr
  call void @$freeTable(ptr %methods)
  br label %plain
instance:
  %fields.ptr = getelementptr inbounds %Instance, ptr %obj, i32 0, i32 2
  %fields = load ptr, ptr %fields.ptr
  call void @$freeTable(ptr %fields)
  br label %plain
plain:
  call void @free(ptr %obj)
  ret void
}

",
    );
    Ok(())
}

/// Emit `$freeObjects`: tear down the whole heap by walking the intrusive
/// list, for the end of `main`.
pub(super) fn emit_free_objects(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$freeObjects() {
entry:
  %head = load ptr, ptr @objects
  br label %walk
walk:
  %obj = phi ptr [ %head, %entry ], [ %next, %free ]
  %done = icmp eq ptr %obj, null
  br i1 %done, label %end, label %free
free:
  %next.ptr = getelementptr inbounds %Obj, ptr %obj, i32 0, i32 2
  %next = load ptr, ptr %next.ptr
  call void @$freeObject(ptr %obj)
  br label %walk
end:
  store ptr null, ptr @objects
  ret void
}

",
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_object_threshold_mode() {
        let mut out = String::new();
        emit_allocate_object(&mut out, false).unwrap();
        assert!(out.contains("%pressure = icmp sgt i64 %bytes, %threshold"));
        assert!(out.contains("call void @$gc()"));
        assert!(out.contains("store ptr %obj, ptr @objects"));
    }

    #[test]
    fn test_allocate_object_stress_mode_always_collects() {
        let mut out = String::new();
        emit_allocate_object(&mut out, true).unwrap();
        assert!(!out.contains("@nextGC"));
        assert!(out.contains("br label %collect"));
    }

    #[test]
    fn test_allocation_failure_is_fatal() {
        let mut out = String::new();
        emit_allocate_object(&mut out, false).unwrap();
        assert!(out.contains("@err.oom"));
        assert!(out.contains("call void @exit(i32 70)"));
    }

    #[test]
    fn test_free_object_releases_owned_buffers() {
        let mut out = String::new();
        emit_free_object(&mut out).unwrap();
        // Strings own their characters, closures their upvalue array,
        // classes and instances their tables.
        assert!(out.contains("%chars = load ptr, ptr %chars.ptr"));
        assert!(out.contains("call void @$freeTable(ptr %methods)"));
        assert!(out.contains("call void @$freeTable(ptr %fields)"));
    }
}
