//! Growable runtime stacks.
//!
//! Three module-global `%Stack` values share these helpers: the globals
//! stack (addresses of every defined global slot, never popped), the
//! locals stack (addresses of live locals and pinned temporaries), and the
//! gray stack (the collector's work queue, holding object pointers).
//! Growth is geometric with a floor of eight slots; a failed realloc is
//! fatal.

pub(super) fn emit_ensure_capacity(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$stackEnsureCapacity(ptr %stack, i32 %needed) {
entry:
  %capacity.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 2
  %capacity = load i32, ptr %capacity.ptr
  %fits = icmp sle i32 %needed, %capacity
  br i1 %fits, label %end, label %grow
grow:
  %doubled = mul i32 %needed, 2
  %small = icmp slt i32 %needed, 8
  %new.capacity = select i1 %small, i32 8, i32 %doubled
  store i32 %new.capacity, ptr %capacity.ptr
  %cap64 = sext i32 %new.capacity to i64
  %bytes = mul i64 %cap64, 8
  %data.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 0
  %data = load ptr, ptr %data.ptr
  %grown = call ptr @realloc(ptr %data, i64 %bytes)
  %failed = icmp eq ptr %grown, null
  br i1 %failed, label %oom, label %commit
oom:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.oom)
  call void @exit(i32 70)
  unreachable
commit:
  store ptr %grown, ptr %data.ptr
  br label %end
end:
  ret void
}

",
    );
    Ok(())
}

pub(super) fn emit_push(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$stackPush(ptr %stack, ptr %value) {
entry:
  %count.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 1
  %count = load i32, ptr %count.ptr
  %needed = add i32 %count, 1
  call void @$stackEnsureCapacity(ptr %stack, i32 %needed)
  %data.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 0
  %data = load ptr, ptr %data.ptr
  %slot = getelementptr inbounds ptr, ptr %data, i32 %count
  store ptr %value, ptr %slot
  store i32 %needed, ptr %count.ptr
  ret void
}

",
    );
    Ok(())
}

pub(super) fn emit_pop_n(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$stackPopN(ptr %stack, i32 %n) {
entry:
  %count.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 1
  %count = load i32, ptr %count.ptr
  %remaining = sub i32 %count, %n
  store i32 %remaining, ptr %count.ptr
  ret void
}

",
    );
    Ok(())
}

/// Release a stack's backing buffer, for `main`'s epilogue.
pub(super) fn emit_free(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$stackFree(ptr %stack) {
entry:
  %data.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 0
  %data = load ptr, ptr %data.ptr
  call void @free(ptr %data)
  store ptr null, ptr %data.ptr
  %count.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 1
  store i32 0, ptr %count.ptr
  %capacity.ptr = getelementptr inbounds %Stack, ptr %stack, i32 0, i32 2
  store i32 0, ptr %capacity.ptr
  ret void
}

",
    );
    Ok(())
}

pub(super) fn emit_all(out: &mut String) -> std::fmt::Result {
    emit_ensure_capacity(out)?;
    emit_push(out)?;
    emit_pop_n(out)?;
    emit_free(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_doubles_with_floor_of_eight() {
        let mut out = String::new();
        emit_ensure_capacity(&mut out).unwrap();
        assert!(out.contains("%doubled = mul i32 %needed, 2"));
        assert!(out.contains("%new.capacity = select i1 %small, i32 8, i32 %doubled"));
        assert!(out.contains("@realloc"));
    }

    #[test]
    fn test_push_stores_then_bumps_count() {
        let mut out = String::new();
        emit_push(&mut out).unwrap();
        let store = out.find("store ptr %value, ptr %slot").unwrap();
        let bump = out.find("store i32 %needed, ptr %count.ptr").unwrap();
        assert!(store < bump);
    }

    #[test]
    fn test_pop_n_only_moves_the_count() {
        let mut out = String::new();
        emit_pop_n(&mut out).unwrap();
        assert!(out.contains("%remaining = sub i32 %count, %n"));
        assert!(!out.contains("@free"));
    }
}
