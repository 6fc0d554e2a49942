//! Per-function compilation machinery: scopes, locals, upvalues, globals.
//!
//! Name resolution walks local scopes, then enclosing function frames
//! (producing upvalue descriptors), then falls back to a lazily-declared
//! module global. Every local lives in an entry-block alloca whose address
//! is also pushed on the runtime locals stack, making it a GC root; scope
//! exit closes upvalues over captured slots and pops the stack.
//!
//! The epilogue is the single exit: `return` stores into the `$returnVal`
//! slot and branches there. Because an early return can skip inner-scope
//! cleanup, the epilogue re-closes every captured local (closing is
//! idempotent, closed upvalues are unlinked) and restores the locals-stack
//! depth saved in the prologue.

use super::error::CodeGenError;
use super::state::{CodeGen, FunctionContext, FunctionFrame, Local, UpvalueTarget};
use super::value::{NIL_VAL, UNINITIALIZED_VAL, imm};
use lox_frontend::token::Token;

/// Constant-expression address of the locals stack count field.
pub(super) const LOCALS_COUNT: &str =
    "getelementptr inbounds (%Stack, ptr @stack.locals, i32 0, i32 1)";

impl CodeGen {
    /// Open a new function frame and emit its prologue.
    pub(super) fn push_function(
        &mut self,
        symbol: String,
        lox_name: String,
        context: FunctionContext,
        parameters: &[Token],
    ) {
        let mut frame = FunctionFrame::new(symbol, lox_name, context, parameters.len());
        let epilogue = frame.fresh_label("epilogue");
        frame.epilogue = epilogue;
        self.frames.push(frame);

        let return_slot = self.emit_alloca("i64");
        self.emit(format!("store i64 {}, ptr {}", imm(NIL_VAL), return_slot));
        self.frame().return_slot = return_slot;

        let depth_slot = self.emit_alloca("i32");
        let depth = self.fresh_temp();
        self.emit(format!("{} = load i32, ptr {}", depth, LOCALS_COUNT));
        self.emit(format!("store i32 {}, ptr {}", depth, depth_slot));
        self.frame().locals_depth = depth_slot;

        self.begin_scope();

        if context.is_method() {
            self.declare_local("this", "%receiver");
        }
        for (i, parameter) in parameters.iter().enumerate() {
            let name = parameter.lexeme.clone();
            let arg = format!("%p{}", i);
            self.declare_local(&name, &arg);
        }
    }

    /// Emit the epilogue, close the frame, and append the rendered
    /// function to the module. Returns the frame for its upvalue list.
    pub(super) fn pop_function(&mut self) -> Result<FunctionFrame, CodeGenError> {
        self.end_scope();

        let epilogue = self.frame_ref().epilogue.clone();
        if !self.frame_ref().terminated {
            self.emit_branch(&epilogue);
        }
        self.start_block(&epilogue);

        // Close everything this function's nested functions captured; the
        // normal path already did, but early returns skipped inner scopes.
        let captured: Vec<String> = self
            .frame_ref()
            .locals
            .iter()
            .filter(|local| local.captured)
            .map(|local| local.ptr.clone())
            .collect();
        for slot in captured {
            self.emit(format!("call void @$closeUpvalues(ptr {})", slot));
        }

        let depth_slot = self.frame_ref().locals_depth.clone();
        let depth = self.fresh_temp();
        self.emit(format!("{} = load i32, ptr {}", depth, depth_slot));
        self.emit(format!("store i32 {}, ptr {}", depth, LOCALS_COUNT));

        if self.frame_ref().context == FunctionContext::Initializer {
            // init returns the receiver no matter how it exits.
            self.emit("ret i64 %receiver");
        } else {
            let slot = self.frame_ref().return_slot.clone();
            let value = self.fresh_temp();
            self.emit(format!("{} = load i64, ptr {}", value, slot));
            self.emit(format!("ret i64 {}", value));
        }
        self.frame().terminated = true;

        let frame = self.frames.pop().expect("active function frame");
        self.functions.push_str(&frame.render()?);
        Ok(frame)
    }

    pub(super) fn begin_scope(&mut self) {
        self.frame().scopes.push(Vec::new());
    }

    /// Close the innermost scope: close upvalues over its captured slots
    /// and pop its locals off the runtime locals stack.
    pub(super) fn end_scope(&mut self) {
        let Some(scope) = self.frame().scopes.pop() else {
            return;
        };
        let count = scope.len();
        let captured: Vec<String> = scope
            .iter()
            .rev()
            .filter(|&&index| self.frame_ref().locals[index].captured)
            .map(|&index| self.frame_ref().locals[index].ptr.clone())
            .collect();
        for slot in captured {
            self.emit(format!("call void @$closeUpvalues(ptr {})", slot));
        }
        if count > 0 {
            self.emit(format!(
                "call void @$stackPopN(ptr @stack.locals, i32 {})",
                count
            ));
        }
    }

    /// Declare a local in the current scope: entry-block slot, initial
    /// store, and a root registration on the locals stack.
    pub(super) fn declare_local(&mut self, name: &str, value: &str) -> String {
        let slot = self.emit_alloca("i64");
        self.emit(format!("store i64 {}, ptr {}", value, slot));
        self.emit(format!(
            "call void @$stackPush(ptr @stack.locals, ptr {})",
            slot
        ));
        let frame = self.frame();
        frame.locals.push(Local {
            name: name.to_string(),
            ptr: slot.clone(),
            captured: false,
        });
        let index = frame.locals.len() - 1;
        if let Some(scope) = frame.scopes.last_mut() {
            scope.push(index);
        }
        slot
    }

    /// Define a variable at the current scope: a module global when at the
    /// script top level, a local otherwise.
    pub(super) fn define_variable(&mut self, name: &str, value: &str) {
        if self.at_script_top_level() {
            self.globals.insert(name.to_string());
            self.emit(format!("store i64 {}, ptr @g{}", value, name));
        } else {
            self.declare_local(name, value);
        }
    }

    pub(super) fn at_script_top_level(&self) -> bool {
        self.frames.len() == 1 && self.frame_ref().scopes.len() == 1
    }

    /// Resolve a name to a slot address usable as a ptr operand: local,
    /// then upvalue of an enclosing function, then a lazily-declared
    /// global. Global reads and writes both go through the uninitialized
    /// check, so touching an undefined global raises `Undefined variable`
    /// at the use's line.
    pub(super) fn lookup_variable(
        &mut self,
        name: &str,
        line: u32,
    ) -> Result<String, CodeGenError> {
        if let Some(index) = self.frame_ref().resolve_local(name) {
            return Ok(self.frame_ref().locals[index].ptr.clone());
        }

        let top = self.frames.len() - 1;
        if let Some(upvalue) = self.resolve_upvalue(top, name) {
            // The upvalue array is the function's second argument; the
            // location field tracks the slot while open and the closed
            // box afterwards.
            let entry = self.fresh_temp();
            self.emit(format!(
                "{} = getelementptr inbounds ptr, ptr %upvalues, i32 {}",
                entry, upvalue
            ));
            let upvalue_obj = self.fresh_temp();
            self.emit(format!("{} = load ptr, ptr {}", upvalue_obj, entry));
            let location_ptr = self.fresh_temp();
            self.emit(format!(
                "{} = getelementptr inbounds %Upvalue, ptr {}, i32 0, i32 1",
                location_ptr, upvalue_obj
            ));
            let location = self.fresh_temp();
            self.emit(format!("{} = load ptr, ptr {}", location, location_ptr));
            return Ok(location);
        }

        self.globals.insert(name.to_string());
        let global = format!("@g{}", name);

        let loaded = self.fresh_temp();
        self.emit(format!("{} = load i64, ptr {}", loaded, global));
        let undefined = self.emit_is_uninitialized(&loaded);
        let undefined_block = self.fresh_label("global.undefined");
        let defined_block = self.fresh_label("global.defined");
        self.emit_cond_branch(&undefined, &undefined_block, &defined_block);

        self.start_block(&undefined_block);
        let message = format!("Undefined variable '{}'.", name);
        self.emit_runtime_error(line, &message, &[])?;
        self.start_block(&defined_block);

        Ok(global)
    }

    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<usize> {
        if frame_index == 0 {
            return None;
        }
        let parent = frame_index - 1;

        if let Some(local_index) = self.frames[parent].resolve_local(name) {
            self.frames[parent].locals[local_index].captured = true;
            return Some(self.frames[frame_index].add_upvalue(UpvalueTarget::Local(local_index)));
        }

        if let Some(parent_upvalue) = self.resolve_upvalue(parent, name) {
            return Some(
                self.frames[frame_index].add_upvalue(UpvalueTarget::Upvalue(parent_upvalue)),
            );
        }

        None
    }

    /// Pin an i64 value on the locals stack so a collection triggered by
    /// the next allocation cannot reclaim it. Balanced by
    /// [`CodeGen::emit_pop_temps`].
    pub(super) fn emit_push_temp(&mut self, value: &str) {
        let slot = self.emit_alloca("i64");
        self.emit(format!("store i64 {}, ptr {}", value, slot));
        self.emit(format!(
            "call void @$stackPush(ptr @stack.locals, ptr {})",
            slot
        ));
    }

    /// Pin an object pointer (boxed on the way in).
    pub(super) fn emit_push_temp_obj(&mut self, obj: &str) {
        let boxed = self.emit_obj_val(obj);
        self.emit_push_temp(&boxed);
    }

    pub(super) fn emit_pop_temps(&mut self, count: usize) {
        if count > 0 {
            self.emit(format!(
                "call void @$stackPopN(ptr @stack.locals, i32 {})",
                count
            ));
        }
    }

    /// Report a fatal runtime error: the formatted message, the current
    /// frame line, the rest of the call trace, then exit(70). Leaves the
    /// block terminated.
    pub(super) fn emit_runtime_error(
        &mut self,
        line: u32,
        message: &str,
        args: &[(&str, String)],
    ) -> Result<(), CodeGenError> {
        let format_const = self.string_const(&format!("{}\n", message))?;
        let stream = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr @stderr", stream));

        let mut call_args = format!("ptr {}, ptr {}", stream, format_const.global);
        for (ty, reg) in args {
            call_args.push_str(&format!(", {} {}", ty, reg));
        }
        self.emit(format!(
            "call i32 (ptr, ptr, ...) @fprintf({})",
            call_args
        ));

        if self.frame_ref().context == FunctionContext::Script {
            self.emit(format!(
                "call i32 (ptr, ptr, ...) @fprintf(ptr {}, ptr @fmt.trace.script, i32 {})",
                stream, line
            ));
        } else {
            let name = self.frame_ref().lox_name.clone();
            let name_const = self.string_const(&name)?;
            self.emit(format!(
                "call i32 (ptr, ptr, ...) @fprintf(ptr {}, ptr @fmt.trace.fn, i32 {}, ptr {})",
                stream, line, name_const.global
            ));
        }

        self.emit("call void @$printStackTrace()");
        self.emit("call void @exit(i32 70)");
        self.emit_unreachable();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lox_frontend::token::{Literal, TokenKind};

    fn token(lexeme: &str) -> Token {
        Token::new(TokenKind::Identifier, lexeme, Literal::None, 1)
    }

    fn codegen() -> CodeGen {
        let mut cg = CodeGen::new(false, "x86_64-unknown-linux-gnu".to_string());
        cg.push_function(
            "script".to_string(),
            "script".to_string(),
            FunctionContext::Script,
            &[],
        );
        cg
    }

    #[test]
    fn test_prologue_saves_locals_depth() {
        let cg = codegen();
        assert!(cg.frame_ref().allocas.contains("alloca i32"));
        assert!(cg.frame_ref().code.contains(LOCALS_COUNT));
    }

    #[test]
    fn test_script_top_level_defines_globals() {
        let mut cg = codegen();
        cg.define_variable("answer", "42");
        assert!(cg.globals.contains("answer"));
        assert!(cg.frame_ref().code.contains("store i64 42, ptr @ganswer"));
    }

    #[test]
    fn test_inner_scope_defines_locals() {
        let mut cg = codegen();
        cg.begin_scope();
        cg.define_variable("x", "1");
        assert!(!cg.globals.contains("x"));
        assert!(cg.frame_ref().resolve_local("x").is_some());
        assert!(
            cg.frame_ref()
                .code
                .contains("call void @$stackPush(ptr @stack.locals")
        );
    }

    #[test]
    fn test_end_scope_pops_locals_and_closes_captured() {
        let mut cg = codegen();
        cg.begin_scope();
        cg.declare_local("n", "0");
        let index = cg.frame_ref().resolve_local("n").unwrap();
        cg.frame().locals[index].captured = true;
        cg.end_scope();
        let code = &cg.frame_ref().code;
        assert!(code.contains("call void @$closeUpvalues(ptr"));
        assert!(code.contains("call void @$stackPopN(ptr @stack.locals, i32 1)"));
    }

    #[test]
    fn test_upvalue_resolution_marks_enclosing_local_captured() {
        let mut cg = codegen();
        cg.begin_scope();
        cg.declare_local("n", "0");
        cg.push_function(
            "fn.inner.0".to_string(),
            "inner".to_string(),
            FunctionContext::Function,
            &[],
        );
        let address = cg.lookup_variable("n", 3).unwrap();
        assert!(address.starts_with('%'));
        assert_eq!(
            cg.frame_ref().upvalues,
            vec![UpvalueTarget::Local(0)]
        );
        // The script-level local is now flagged for closing.
        assert!(cg.frames[0].locals[0].captured);
    }

    #[test]
    fn test_transitive_capture_goes_through_middle_frame() {
        let mut cg = codegen();
        cg.begin_scope();
        cg.declare_local("n", "0");
        cg.push_function(
            "fn.middle.0".to_string(),
            "middle".to_string(),
            FunctionContext::Function,
            &[],
        );
        cg.push_function(
            "fn.inner.1".to_string(),
            "inner".to_string(),
            FunctionContext::Function,
            &[],
        );
        cg.lookup_variable("n", 5).unwrap();
        // Innermost refers to the middle frame's upvalue, which refers to
        // the script local.
        assert_eq!(cg.frame_ref().upvalues, vec![UpvalueTarget::Upvalue(0)]);
        assert_eq!(cg.frames[1].upvalues, vec![UpvalueTarget::Local(0)]);
    }

    #[test]
    fn test_unknown_name_falls_back_to_checked_global() {
        let mut cg = codegen();
        let address = cg.lookup_variable("missing", 7).unwrap();
        assert_eq!(address, "@gmissing");
        assert!(cg.globals.contains("missing"));
        let code = &cg.frame_ref().code;
        assert!(code.contains(&imm(UNINITIALIZED_VAL)));
        assert!(code.contains("call void @exit(i32 70)"));
    }

    #[test]
    fn test_method_context_binds_this() {
        let mut cg = codegen();
        cg.push_function(
            "method.A.m.0".to_string(),
            "m".to_string(),
            FunctionContext::Method,
            &[token("x")],
        );
        assert!(cg.frame_ref().resolve_local("this").is_some());
        assert!(cg.frame_ref().resolve_local("x").is_some());
        assert!(cg.frame_ref().code.contains("store i64 %receiver"));
        assert!(cg.frame_ref().code.contains("store i64 %p0"));
    }

    #[test]
    fn test_initializer_epilogue_returns_receiver() {
        let mut cg = codegen();
        cg.push_function(
            "method.A.init.0".to_string(),
            "init".to_string(),
            FunctionContext::Initializer,
            &[],
        );
        cg.pop_function().unwrap();
        assert!(cg.functions.contains("ret i64 %receiver"));
    }
}
