//! CodeGen state and core types.
//!
//! `CodeGen` accumulates the textual IR of the whole module: deduplicated
//! string constants, the set of Lox globals, finished function bodies, and
//! a stack of in-progress [`FunctionFrame`]s. The frame stack mirrors the
//! lexical nesting of Lox functions; upvalue resolution walks it the way
//! the runtime walks enclosing scopes.
//!
//! Instruction text goes through small helpers (`emit`, `fresh_temp`,
//! `fresh_label`, `start_block`) so every block is well-formed: exactly one
//! terminator, labels only after a terminator, allocas only in the entry
//! block.

use super::error::CodeGenError;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

/// Fixed capacity of the runtime call stack; entering a frame beyond this
/// raises "Stack overflow.".
pub const MAX_CALL_STACK_SIZE: usize = 512;

/// Initial heap size that triggers the first collection.
pub const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FunctionContext {
    Script,
    Function,
    Method,
    Initializer,
}

impl FunctionContext {
    pub fn is_method(self) -> bool {
        matches!(self, FunctionContext::Method | FunctionContext::Initializer)
    }
}

/// A local variable slot in the current function.
#[derive(Debug)]
pub(super) struct Local {
    pub name: String,
    /// Register holding the alloca address of the slot.
    pub ptr: String,
    /// Set when a nested function closes over this slot; scope exit must
    /// then close the upvalues pointing at it.
    pub captured: bool,
}

/// What an upvalue of the current function refers to in the enclosing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UpvalueTarget {
    /// Index into the enclosing function's `locals`.
    Local(usize),
    /// Index into the enclosing function's `upvalues`.
    Upvalue(usize),
}

/// Per-function emission state.
#[derive(Debug)]
pub(super) struct FunctionFrame {
    /// IR symbol, e.g. `fn.counter.2`.
    pub symbol: String,
    /// Source-level name, used in stack traces.
    pub lox_name: String,
    pub context: FunctionContext,
    pub arity: usize,
    /// Entry-block allocas, spliced ahead of `code` when rendering.
    pub allocas: String,
    pub code: String,
    /// Scope stack; each scope lists indices into `locals`.
    pub scopes: Vec<Vec<usize>>,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueTarget>,
    /// Register holding the saved locals-stack depth, restored on exit.
    pub locals_depth: String,
    /// Register holding the `$returnVal` slot address.
    pub return_slot: String,
    /// Label of the epilogue block, the target of `return`.
    pub epilogue: String,
    /// Label of the block instructions are currently appended to.
    pub current_block: String,
    /// True right after a terminator; the next emission must be a label.
    pub terminated: bool,
    temp_counter: usize,
    label_counter: usize,
}

impl FunctionFrame {
    pub fn new(symbol: String, lox_name: String, context: FunctionContext, arity: usize) -> Self {
        FunctionFrame {
            symbol,
            lox_name,
            context,
            arity,
            allocas: String::new(),
            code: String::new(),
            scopes: Vec::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            locals_depth: String::new(),
            return_slot: String::new(),
            epilogue: String::new(),
            current_block: "entry".to_string(),
            terminated: false,
            temp_counter: 0,
            label_counter: 0,
        }
    }

    pub fn fresh_temp(&mut self) -> String {
        let temp = format!("%t{}", self.temp_counter);
        self.temp_counter += 1;
        temp
    }

    pub fn fresh_label(&mut self, base: &str) -> String {
        let label = format!("{}.{}", base, self.label_counter);
        self.label_counter += 1;
        label
    }

    /// Look up a name in this function's scopes, innermost first.
    pub fn resolve_local(&self, name: &str) -> Option<usize> {
        for scope in self.scopes.iter().rev() {
            for &index in scope.iter().rev() {
                if self.locals[index].name == name {
                    return Some(index);
                }
            }
        }
        None
    }

    /// Register an upvalue referring to the enclosing function, reusing an
    /// existing descriptor for the same target.
    pub fn add_upvalue(&mut self, target: UpvalueTarget) -> usize {
        if let Some(index) = self.upvalues.iter().position(|&existing| existing == target) {
            return index;
        }
        self.upvalues.push(target);
        self.upvalues.len() - 1
    }

    /// Render the finished function as an IR definition.
    pub fn render(&self) -> Result<String, CodeGenError> {
        let mut out = String::new();
        let params: Vec<String> = (0..self.arity).map(|i| format!(", i64 %p{}", i)).collect();
        if self.context == FunctionContext::Script {
            writeln!(out, "define internal i64 @{}() {{", self.symbol)?;
        } else {
            writeln!(
                out,
                "define internal i64 @{}(i64 %receiver, ptr %upvalues{}) {{",
                self.symbol,
                params.join("")
            )?;
        }
        out.push_str("entry:\n");
        out.push_str(&self.allocas);
        out.push_str(&self.code);
        out.push_str("}\n\n");
        Ok(out)
    }
}

/// Interned IR string constant: global name plus byte length (without the
/// trailing NUL).
#[derive(Debug, Clone)]
pub(super) struct StrConst {
    pub global: String,
    pub len: usize,
}

pub struct CodeGen {
    pub(super) stress_gc: bool,
    pub(super) target_triple: String,
    pub(super) string_globals: String,
    string_constants: HashMap<String, StrConst>,
    string_counter: usize,
    fn_counter: usize,
    /// Finished IR function definitions.
    pub(super) functions: String,
    /// Names of all Lox globals, in deterministic order.
    pub(super) globals: BTreeSet<String>,
    pub(super) frames: Vec<FunctionFrame>,
}

impl CodeGen {
    pub fn new(stress_gc: bool, target_triple: String) -> Self {
        CodeGen {
            stress_gc,
            target_triple,
            string_globals: String::new(),
            string_constants: HashMap::new(),
            string_counter: 0,
            fn_counter: 0,
            functions: String::new(),
            globals: BTreeSet::new(),
            frames: Vec::new(),
        }
    }

    pub(super) fn frame(&mut self) -> &mut FunctionFrame {
        self.frames.last_mut().expect("active function frame")
    }

    pub(super) fn frame_ref(&self) -> &FunctionFrame {
        self.frames.last().expect("active function frame")
    }

    pub(super) fn fresh_temp(&mut self) -> String {
        self.frame().fresh_temp()
    }

    pub(super) fn fresh_label(&mut self, base: &str) -> String {
        self.frame().fresh_label(base)
    }

    pub(super) fn fresh_symbol(&mut self, prefix: &str, name: &str) -> String {
        let symbol = format!("{}.{}.{}", prefix, name, self.fn_counter);
        self.fn_counter += 1;
        symbol
    }

    /// Append one instruction to the current block.
    pub(super) fn emit(&mut self, line: impl AsRef<str>) {
        debug_assert!(
            !self.frame_ref().terminated,
            "instruction after terminator: {}",
            line.as_ref()
        );
        let frame = self.frame();
        frame.code.push_str("  ");
        frame.code.push_str(line.as_ref());
        frame.code.push('\n');
    }

    /// Append an entry-block alloca and return its register.
    pub(super) fn emit_alloca(&mut self, ty: &str) -> String {
        let reg = self.fresh_temp();
        let frame = self.frame();
        let _ = writeln!(frame.allocas, "  {} = alloca {}, align 8", reg, ty);
        reg
    }

    pub(super) fn emit_branch(&mut self, label: &str) {
        self.emit(format!("br label %{}", label));
        self.frame().terminated = true;
    }

    pub(super) fn emit_cond_branch(&mut self, cond: &str, then_label: &str, else_label: &str) {
        self.emit(format!(
            "br i1 {}, label %{}, label %{}",
            cond, then_label, else_label
        ));
        self.frame().terminated = true;
    }

    pub(super) fn emit_unreachable(&mut self) {
        self.emit("unreachable");
        self.frame().terminated = true;
    }

    /// Open a new basic block. The previous block must be terminated.
    pub(super) fn start_block(&mut self, label: &str) {
        let frame = self.frame();
        debug_assert!(frame.terminated, "fall-through into block {}", label);
        frame.code.push_str(label);
        frame.code.push_str(":\n");
        frame.current_block = label.to_string();
        frame.terminated = false;
    }

    pub(super) fn current_block(&self) -> String {
        self.frame_ref().current_block.clone()
    }

    /// Get or create a deduplicated global string constant.
    pub(super) fn string_const(&mut self, s: &str) -> Result<StrConst, CodeGenError> {
        if let Some(existing) = self.string_constants.get(s) {
            return Ok(existing.clone());
        }

        let global = format!("@.str.{}", self.string_counter);
        self.string_counter += 1;

        let escaped = escape_llvm_string(s)?;
        writeln!(
            &mut self.string_globals,
            "{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
            global,
            s.len() + 1,
            escaped
        )?;

        let constant = StrConst {
            global,
            len: s.len(),
        };
        self.string_constants.insert(s.to_string(), constant.clone());
        Ok(constant)
    }
}

/// Escape a string for LLVM IR string literals.
pub(super) fn escape_llvm_string(s: &str) -> Result<String, std::fmt::Error> {
    let mut result = String::new();
    for ch in s.chars() {
        match ch {
            ' '..='!' | '#'..='[' | ']'..='~' => result.push(ch),
            '\\' => result.push_str(r"\\"),
            '"' => result.push_str(r"\22"),
            '\n' => result.push_str(r"\0A"),
            '\r' => result.push_str(r"\0D"),
            '\t' => result.push_str(r"\09"),
            _ => {
                for byte in ch.to_string().as_bytes() {
                    write!(&mut result, r"\{:02X}", byte)?;
                }
            }
        }
    }
    Ok(result)
}
