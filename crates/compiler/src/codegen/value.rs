//! NaN-boxed value representation.
//!
//! Every runtime value is one i64. Doubles are stored as themselves; the
//! quiet-NaN payload space encodes the singletons, and the sign bit plus
//! the quiet-NaN mask tags a 48-bit object pointer:
//!
//! ```text
//! number         any i64 whose QNAN bits are not all set
//! uninitialized  QNAN | 0
//! nil            QNAN | 1
//! false          QNAN | 2
//! true           QNAN | 3
//! object         SIGN_BIT | QNAN | ptr
//! ```
//!
//! All predicates and constructors lower to plain bit operations; the
//! emitters here produce those instruction sequences inline.

use super::state::CodeGen;

pub const SIGN_BIT: u64 = 0x8000000000000000;
pub const QNAN: u64 = 0x7ffc000000000000;

pub const TAG_UNINITIALIZED: u64 = 0;
pub const TAG_NIL: u64 = 1;
pub const TAG_FALSE: u64 = 2;
pub const TAG_TRUE: u64 = 3;

pub const UNINITIALIZED_VAL: u64 = QNAN | TAG_UNINITIALIZED;
pub const NIL_VAL: u64 = QNAN | TAG_NIL;
pub const FALSE_VAL: u64 = QNAN | TAG_FALSE;
pub const TRUE_VAL: u64 = QNAN | TAG_TRUE;

/// Heap object type tags, stored in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjKind {
    String = 1,
    Function = 2,
    Closure = 3,
    Upvalue = 4,
    Class = 5,
    Instance = 6,
    BoundMethod = 7,
}

/// Render a u64 bit pattern as an IR i64 immediate (two's complement).
pub fn imm(bits: u64) -> String {
    (bits as i64).to_string()
}

impl CodeGen {
    /// `(v & QNAN) != QNAN` - any non-quiet-NaN word is a number.
    pub(super) fn emit_is_number(&mut self, value: &str) -> String {
        let masked = self.fresh_temp();
        self.emit(format!("{} = and i64 {}, {}", masked, value, imm(QNAN)));
        let result = self.fresh_temp();
        self.emit(format!("{} = icmp ne i64 {}, {}", result, masked, imm(QNAN)));
        result
    }

    pub(super) fn emit_is_uninitialized(&mut self, value: &str) -> String {
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = icmp eq i64 {}, {}",
            result,
            value,
            imm(UNINITIALIZED_VAL)
        ));
        result
    }

    pub(super) fn emit_is_obj(&mut self, value: &str) -> String {
        let masked = self.fresh_temp();
        self.emit(format!(
            "{} = and i64 {}, {}",
            masked,
            value,
            imm(QNAN | SIGN_BIT)
        ));
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = icmp eq i64 {}, {}",
            result,
            masked,
            imm(QNAN | SIGN_BIT)
        ));
        result
    }

    pub(super) fn emit_as_number(&mut self, value: &str) -> String {
        let result = self.fresh_temp();
        self.emit(format!("{} = bitcast i64 {} to double", result, value));
        result
    }

    pub(super) fn emit_number_val(&mut self, value: &str) -> String {
        let result = self.fresh_temp();
        self.emit(format!("{} = bitcast double {} to i64", result, value));
        result
    }

    pub(super) fn emit_bool_val(&mut self, cond: &str) -> String {
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = select i1 {}, i64 {}, i64 {}",
            result,
            cond,
            imm(TRUE_VAL),
            imm(FALSE_VAL)
        ));
        result
    }

    pub(super) fn emit_as_obj(&mut self, value: &str) -> String {
        let masked = self.fresh_temp();
        self.emit(format!(
            "{} = and i64 {}, {}",
            masked,
            value,
            imm(!(QNAN | SIGN_BIT))
        ));
        let result = self.fresh_temp();
        self.emit(format!("{} = inttoptr i64 {} to ptr", result, masked));
        result
    }

    pub(super) fn emit_obj_val(&mut self, obj: &str) -> String {
        let as_int = self.fresh_temp();
        self.emit(format!("{} = ptrtoint ptr {} to i64", as_int, obj));
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = or i64 {}, {}",
            result,
            as_int,
            imm(QNAN | SIGN_BIT)
        ));
        result
    }

    /// Load the type tag byte of an object pointer.
    pub(super) fn emit_obj_type(&mut self, obj: &str) -> String {
        let field = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Obj, ptr {}, i32 0, i32 0",
            field, obj
        ));
        let result = self.fresh_temp();
        self.emit(format!("{} = load i8, ptr {}", result, field));
        result
    }

    /// `isObj(v) && type(v) == kind`, with the tag load guarded by the
    /// object check so non-pointer words are never dereferenced.
    pub(super) fn emit_is_obj_kind(&mut self, value: &str, kind: ObjKind) -> String {
        let entry_block = self.current_block();
        let check = self.fresh_label("kind.check");
        let done = self.fresh_label("kind.done");

        let is_obj = self.emit_is_obj(value);
        self.emit_cond_branch(&is_obj, &check, &done);

        self.start_block(&check);
        let obj = self.emit_as_obj(value);
        let tag = self.emit_obj_type(&obj);
        let matches = self.fresh_temp();
        self.emit(format!("{} = icmp eq i8 {}, {}", matches, tag, kind as u8));
        self.emit_branch(&done);

        self.start_block(&done);
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = phi i1 [ false, %{} ], [ {}, %{} ]",
            result, entry_block, matches, check
        ));
        result
    }

    /// `nil` and `false` are falsey, everything else is truthy.
    pub(super) fn emit_is_truthy(&mut self, value: &str) -> String {
        let result = self.fresh_temp();
        self.emit(format!("{} = call i1 @$isTruthy(i64 {})", result, value));
        result
    }
}

/// Emit the `$isTruthy` helper definition.
pub(super) fn emit_truthy(out: &mut String) -> std::fmt::Result {
    use std::fmt::Write as _;
    writeln!(
        out,
        "define internal i1 @$isTruthy(i64 %value) {{
entry:
  %is.nil = icmp eq i64 %value, {nil}
  br i1 %is.nil, label %falsey, label %check.bool
check.bool:
  %or1 = or i64 %value, 1
  %is.bool = icmp eq i64 %or1, {true_val}
  br i1 %is.bool, label %bool, label %truthy
bool:
  %is.true = icmp eq i64 %value, {true_val}
  ret i1 %is.true
falsey:
  ret i1 false
truthy:
  ret i1 true
}}
",
        nil = imm(NIL_VAL),
        true_val = imm(TRUE_VAL)
    )
}
