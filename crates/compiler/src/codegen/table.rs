//! The open-addressed hash table, emitted as IR.
//!
//! Linear probing over power-of-two capacities; keys are interned
//! `%String` pointers so key comparison is pointer equality. A tombstone
//! is `{null, true}`, an empty slot `{null, nil}`; `count` includes
//! tombstones, which is why the grow path re-counts live entries while
//! rehashing. Used for method tables, instance fields, and (with the
//! content-keyed probe `$tableFindString`) the string intern table.

use super::runtime::sizeof;
use super::value::{NIL_VAL, TRUE_VAL, UNINITIALIZED_VAL, imm};
use std::fmt::Write as _;

pub(super) fn emit_allocate_table(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$allocateTable() {{
entry:
  %table = call ptr @malloc(i64 {size})
  %failed = icmp eq ptr %table, null
  br i1 %failed, label %oom, label %initialize
oom:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.oom)
  call void @exit(i32 70)
  unreachable
initialize:
  %count.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 0
  store i32 0, ptr %count.ptr
  %capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  store i32 0, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  store ptr null, ptr %entries.ptr
  ret ptr %table
}}
",
        size = sizeof("%Table")
    )
}

/// Probe for a key, remembering the first tombstone so deleted slots can
/// be reused. Capacity must be nonzero.
pub(super) fn emit_table_find_entry(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$tableFindEntry(ptr %entries, i32 %capacity, ptr %key) {{
entry:
  %hash.ptr = getelementptr inbounds %String, ptr %key, i32 0, i32 3
  %hash = load i32, ptr %hash.ptr
  %mask = sub i32 %capacity, 1
  %start = and i32 %hash, %mask
  br label %probe
probe:
  %index = phi i32 [ %start, %entry ], [ %next, %step ]
  %tombstone = phi ptr [ null, %entry ], [ %tombstone.out, %step ]
  %slot = getelementptr inbounds %Entry, ptr %entries, i32 %index
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  %slot.key = load ptr, ptr %key.ptr
  %key.null = icmp eq ptr %slot.key, null
  br i1 %key.null, label %vacant, label %compare
vacant:
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  %slot.value = load i64, ptr %value.ptr
  %is.empty = icmp eq i64 %slot.value, {nil}
  br i1 %is.empty, label %empty, label %tombstone.seen
empty:
  %have.tombstone = icmp ne ptr %tombstone, null
  %result = select i1 %have.tombstone, ptr %tombstone, ptr %slot
  ret ptr %result
tombstone.seen:
  %first = icmp eq ptr %tombstone, null
  %tombstone.new = select i1 %first, ptr %slot, ptr %tombstone
  br label %step
compare:
  %same = icmp eq ptr %slot.key, %key
  br i1 %same, label %found, label %step
found:
  ret ptr %slot
step:
  %tombstone.out = phi ptr [ %tombstone.new, %tombstone.seen ], [ %tombstone, %compare ]
  %bump = add i32 %index, 1
  %next = and i32 %bump, %mask
  br label %probe
}}
",
        nil = imm(NIL_VAL)
    )
}

/// Grow to the given capacity, rehashing live entries only. `count` is
/// reset to the live-entry count, dropping tombstones.
pub(super) fn emit_table_adjust_capacity(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal void @$tableAdjustCapacity(ptr %table, i32 %capacity) {{
entry:
  %cap64 = sext i32 %capacity to i64
  %bytes = mul i64 %cap64, {entry_size}
  %entries = call ptr @malloc(i64 %bytes)
  %failed = icmp eq ptr %entries, null
  br i1 %failed, label %oom, label %clear
oom:
  %stream = load ptr, ptr @stderr
  call i32 (ptr, ptr, ...) @fprintf(ptr %stream, ptr @err.oom)
  call void @exit(i32 70)
  unreachable
clear:
  %i = phi i32 [ 0, %entry ], [ %i.next, %clear.body ]
  %cleared = icmp sge i32 %i, %capacity
  br i1 %cleared, label %rehash.start, label %clear.body
clear.body:
  %slot = getelementptr inbounds %Entry, ptr %entries, i32 %i
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  store ptr null, ptr %key.ptr
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  store i64 {nil}, ptr %value.ptr
  %i.next = add i32 %i, 1
  br label %clear
rehash.start:
  %count.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 0
  store i32 0, ptr %count.ptr
  %old.capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  %old.capacity = load i32, ptr %old.capacity.ptr
  %old.entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %old.entries = load ptr, ptr %old.entries.ptr
  br label %rehash
rehash:
  %j = phi i32 [ 0, %rehash.start ], [ %j.next, %rehash.step ]
  %rehashed = icmp sge i32 %j, %old.capacity
  br i1 %rehashed, label %finish, label %rehash.body
rehash.body:
  %old.slot = getelementptr inbounds %Entry, ptr %old.entries, i32 %j
  %old.key.ptr = getelementptr inbounds %Entry, ptr %old.slot, i32 0, i32 0
  %old.key = load ptr, ptr %old.key.ptr
  %skip = icmp eq ptr %old.key, null
  br i1 %skip, label %rehash.step, label %rehash.move
rehash.move:
  %dest = call ptr @$tableFindEntry(ptr %entries, i32 %capacity, ptr %old.key)
  %dest.key.ptr = getelementptr inbounds %Entry, ptr %dest, i32 0, i32 0
  store ptr %old.key, ptr %dest.key.ptr
  %old.value.ptr = getelementptr inbounds %Entry, ptr %old.slot, i32 0, i32 1
  %old.value = load i64, ptr %old.value.ptr
  %dest.value.ptr = getelementptr inbounds %Entry, ptr %dest, i32 0, i32 1
  store i64 %old.value, ptr %dest.value.ptr
  %count = load i32, ptr %count.ptr
  %count.next = add i32 %count, 1
  store i32 %count.next, ptr %count.ptr
  br label %rehash.step
rehash.step:
  %j.next = add i32 %j, 1
  br label %rehash
finish:
  call void @free(ptr %old.entries)
  store i32 %capacity, ptr %old.capacity.ptr
  store ptr %entries, ptr %old.entries.ptr
  ret void
}}
",
        entry_size = sizeof("%Entry"),
        nil = imm(NIL_VAL)
    )
}

/// Insert or overwrite; returns whether the key was new. Growth happens
/// up front when `count + 1` would cross the 0.75 load factor.
pub(super) fn emit_table_set(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal i1 @$tableSet(ptr %table, ptr %key, i64 %value) {{
entry:
  %count.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 0
  %count = load i32, ptr %count.ptr
  %capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  %capacity = load i32, ptr %capacity.ptr
  %count.next = add i32 %count, 1
  %scaled = mul i32 %capacity, 3
  %threshold = sdiv i32 %scaled, 4
  %pressure = icmp sgt i32 %count.next, %threshold
  br i1 %pressure, label %grow, label %find
grow:
  %doubled = mul i32 %capacity, 2
  %small = icmp slt i32 %capacity, 8
  %new.capacity = select i1 %small, i32 8, i32 %doubled
  call void @$tableAdjustCapacity(ptr %table, i32 %new.capacity)
  br label %find
find:
  %capacity.now = load i32, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %entries = load ptr, ptr %entries.ptr
  %slot = call ptr @$tableFindEntry(ptr %entries, i32 %capacity.now, ptr %key)
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  %slot.key = load ptr, ptr %key.ptr
  %is.new = icmp eq ptr %slot.key, null
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  %slot.value = load i64, ptr %value.ptr
  %no.tombstone = icmp eq i64 %slot.value, {nil}
  %fresh = and i1 %is.new, %no.tombstone
  br i1 %fresh, label %bump, label %write
bump:
  %count.now = load i32, ptr %count.ptr
  %bumped = add i32 %count.now, 1
  store i32 %bumped, ptr %count.ptr
  br label %write
write:
  store ptr %key, ptr %key.ptr
  store i64 %value, ptr %value.ptr
  ret i1 %is.new
}}
",
        nil = imm(NIL_VAL)
    )
}

/// Lookup; a miss returns the uninitialized sentinel, which no user value
/// can be.
pub(super) fn emit_table_get(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal i64 @$tableGet(ptr %table, ptr %key) {{
entry:
  %count.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 0
  %count = load i32, ptr %count.ptr
  %is.empty = icmp eq i32 %count, 0
  br i1 %is.empty, label %missing, label %find
find:
  %capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  %capacity = load i32, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %entries = load ptr, ptr %entries.ptr
  %slot = call ptr @$tableFindEntry(ptr %entries, i32 %capacity, ptr %key)
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  %slot.key = load ptr, ptr %key.ptr
  %key.null = icmp eq ptr %slot.key, null
  br i1 %key.null, label %missing, label %found
found:
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  %value = load i64, ptr %value.ptr
  ret i64 %value
missing:
  ret i64 {uninit}
}}
",
        uninit = imm(UNINITIALIZED_VAL)
    )
}

/// Delete by tombstoning so probe chains stay intact. `count` is left
/// alone; tombstones are reclaimed on the next grow.
pub(super) fn emit_table_delete(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal i1 @$tableDelete(ptr %table, ptr %key) {{
entry:
  %count.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 0
  %count = load i32, ptr %count.ptr
  %is.empty = icmp eq i32 %count, 0
  br i1 %is.empty, label %missing, label %find
find:
  %capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  %capacity = load i32, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %entries = load ptr, ptr %entries.ptr
  %slot = call ptr @$tableFindEntry(ptr %entries, i32 %capacity, ptr %key)
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  %slot.key = load ptr, ptr %key.ptr
  %key.null = icmp eq ptr %slot.key, null
  br i1 %key.null, label %missing, label %bury
bury:
  store ptr null, ptr %key.ptr
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  store i64 {tombstone}, ptr %value.ptr
  ret i1 true
missing:
  ret i1 false
}}
",
        tombstone = imm(TRUE_VAL)
    )
}

/// Copy every live entry of `%from` into `%to`; inheritance uses this to
/// flatten superclass method tables into the subclass.
pub(super) fn emit_table_add_all(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$tableAddAll(ptr %from, ptr %to) {
entry:
  %capacity.ptr = getelementptr inbounds %Table, ptr %from, i32 0, i32 1
  %capacity = load i32, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %from, i32 0, i32 2
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
  br i1 %skip, label %step, label %copy
copy:
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  %value = load i64, ptr %value.ptr
  %ignored = call i1 @$tableSet(ptr %to, ptr %key, i64 %value)
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

/// Content-keyed probe of the intern table: the one place strings are
/// compared by bytes rather than pointer. Returns the canonical `%String`
/// or null.
pub(super) fn emit_table_find_string(out: &mut String) -> std::fmt::Result {
    writeln!(
        out,
        "define internal ptr @$tableFindString(ptr %chars, i32 %length, i32 %hash) {{
entry:
  %table = load ptr, ptr @strings
  %no.table = icmp eq ptr %table, null
  br i1 %no.table, label %missing, label %check
check:
  %count.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 0
  %count = load i32, ptr %count.ptr
  %is.empty = icmp eq i32 %count, 0
  br i1 %is.empty, label %missing, label %setup
setup:
  %capacity.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 1
  %capacity = load i32, ptr %capacity.ptr
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %entries = load ptr, ptr %entries.ptr
  %mask = sub i32 %capacity, 1
  %start = and i32 %hash, %mask
  br label %probe
probe:
  %index = phi i32 [ %start, %setup ], [ %next, %step ]
  %slot = getelementptr inbounds %Entry, ptr %entries, i32 %index
  %key.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 0
  %key = load ptr, ptr %key.ptr
  %key.null = icmp eq ptr %key, null
  br i1 %key.null, label %vacant, label %compare
vacant:
  %value.ptr = getelementptr inbounds %Entry, ptr %slot, i32 0, i32 1
  %value = load i64, ptr %value.ptr
  %is.open = icmp eq i64 %value, {nil}
  br i1 %is.open, label %missing, label %step
compare:
  %len.ptr = getelementptr inbounds %String, ptr %key, i32 0, i32 2
  %len = load i32, ptr %len.ptr
  %len.eq = icmp eq i32 %len, %length
  br i1 %len.eq, label %compare.hash, label %step
compare.hash:
  %key.hash.ptr = getelementptr inbounds %String, ptr %key, i32 0, i32 3
  %key.hash = load i32, ptr %key.hash.ptr
  %hash.eq = icmp eq i32 %key.hash, %hash
  br i1 %hash.eq, label %compare.bytes, label %step
compare.bytes:
  %key.chars.ptr = getelementptr inbounds %String, ptr %key, i32 0, i32 1
  %key.chars = load ptr, ptr %key.chars.ptr
  %len64 = sext i32 %length to i64
  %order = call i32 @memcmp(ptr %key.chars, ptr %chars, i64 %len64)
  %bytes.eq = icmp eq i32 %order, 0
  br i1 %bytes.eq, label %found, label %step
found:
  ret ptr %key
step:
  %bump = add i32 %index, 1
  %next = and i32 %bump, %mask
  br label %probe
missing:
  ret ptr null
}}
",
        nil = imm(NIL_VAL)
    )
}

pub(super) fn emit_free_table(out: &mut String) -> std::fmt::Result {
    out.push_str(
        "define internal void @$freeTable(ptr %table) {
entry:
  %entries.ptr = getelementptr inbounds %Table, ptr %table, i32 0, i32 2
  %entries = load ptr, ptr %entries.ptr
  call void @free(ptr %entries)
  call void @free(ptr %table)
  ret void
}

",
    );
    Ok(())
}

/// Emit every table helper.
pub(super) fn emit_all(out: &mut String) -> std::fmt::Result {
    emit_allocate_table(out)?;
    emit_table_find_entry(out)?;
    emit_table_adjust_capacity(out)?;
    emit_table_set(out)?;
    emit_table_get(out)?;
    emit_table_delete(out)?;
    emit_table_add_all(out)?;
    emit_table_find_string(out)?;
    emit_free_table(out)
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
    fn test_find_entry_remembers_first_tombstone() {
        let ir = emit(emit_table_find_entry);
        assert!(ir.contains("%tombstone.new = select i1 %first, ptr %slot, ptr %tombstone"));
        assert!(ir.contains("%result = select i1 %have.tombstone, ptr %tombstone, ptr %slot"));
    }

    #[test]
    fn test_probe_wraps_with_power_of_two_mask() {
        let ir = emit(emit_table_find_entry);
        assert!(ir.contains("%mask = sub i32 %capacity, 1"));
        assert!(ir.contains("%next = and i32 %bump, %mask"));
    }

    #[test]
    fn test_set_grows_at_three_quarters() {
        let ir = emit(emit_table_set);
        assert!(ir.contains("%scaled = mul i32 %capacity, 3"));
        assert!(ir.contains("%threshold = sdiv i32 %scaled, 4"));
        assert!(ir.contains("%new.capacity = select i1 %small, i32 8, i32 %doubled"));
    }

    #[test]
    fn test_set_does_not_count_tombstone_reuse() {
        let ir = emit(emit_table_set);
        // count only bumps when the slot was never occupied.
        assert!(ir.contains("%fresh = and i1 %is.new, %no.tombstone"));
    }

    #[test]
    fn test_get_miss_returns_uninitialized_sentinel() {
        let ir = emit(emit_table_get);
        assert!(ir.contains(&format!("ret i64 {}", imm(UNINITIALIZED_VAL))));
    }

    #[test]
    fn test_delete_places_tombstone() {
        let ir = emit(emit_table_delete);
        assert!(ir.contains("store ptr null, ptr %key.ptr"));
        assert!(ir.contains(&format!("store i64 {}, ptr %value.ptr", imm(TRUE_VAL))));
    }

    #[test]
    fn test_find_string_compares_length_hash_then_bytes() {
        let ir = emit(emit_table_find_string);
        let len = ir.find("%len.eq").unwrap();
        let hash = ir.find("%hash.eq").unwrap();
        let bytes = ir.find("@memcmp").unwrap();
        assert!(len < hash && hash < bytes);
    }
}
