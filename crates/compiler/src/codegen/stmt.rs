//! Statement lowering, including function and class declarations.
//!
//! Function declarations compile the nested body into its own IR function
//! first (recursively, through the frame stack), then emit the closure
//! creation sequence in the enclosing function: intern the name, build
//! the `%Function` and `%Closure` objects, and populate the upvalue array
//! from the descriptors the nested compile produced.
//!
//! Pinning order matters: temporaries are pushed on the same runtime
//! stack as locals and popped by count, so every pin is popped before the
//! next local is declared.

use super::error::CodeGenError;
use super::state::{CodeGen, FunctionContext, UpvalueTarget};
use super::value::{NIL_VAL, ObjKind, imm};
use lox_frontend::ast::*;
use std::rc::Rc;

impl CodeGen {
    pub(super) fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        match stmt {
            Stmt::Expression(expr) => {
                self.lower_expr(expr)?;
                Ok(())
            }
            Stmt::Print(expr) => {
                let value = self.lower_expr(expr)?;
                self.emit(format!("call void @$print(i64 {})", value));
                Ok(())
            }
            Stmt::Var(var) => {
                let value = self.lower_expr(&var.initializer)?;
                self.define_variable(&var.name.lexeme, &value);
                Ok(())
            }
            Stmt::Block(statements) => {
                self.begin_scope();
                for stmt in statements {
                    self.lower_stmt(stmt)?;
                }
                self.end_scope();
                Ok(())
            }
            Stmt::If(if_stmt) => self.lower_if(if_stmt),
            Stmt::While(while_stmt) => self.lower_while(while_stmt),
            Stmt::Return(ret) => self.lower_return(ret),
            Stmt::Function(decl) => self.lower_function_stmt(decl),
            Stmt::Class(class) => self.lower_class(class),
        }
    }

    fn lower_if(&mut self, if_stmt: &IfStmt) -> Result<(), CodeGenError> {
        let then_label = self.fresh_label("if.then");
        let else_label = self.fresh_label("if.else");
        let end = self.fresh_label("if.end");

        let condition = self.lower_expr(&if_stmt.condition)?;
        let truthy = self.emit_is_truthy(&condition);
        self.emit_cond_branch(&truthy, &then_label, &else_label);

        self.start_block(&then_label);
        self.lower_stmt(&if_stmt.then_branch)?;
        if !self.frame_ref().terminated {
            self.emit_branch(&end);
        }

        self.start_block(&else_label);
        if let Some(else_branch) = &if_stmt.else_branch {
            self.lower_stmt(else_branch)?;
        }
        if !self.frame_ref().terminated {
            self.emit_branch(&end);
        }

        self.start_block(&end);
        Ok(())
    }

    fn lower_while(&mut self, while_stmt: &WhileStmt) -> Result<(), CodeGenError> {
        let cond_label = self.fresh_label("while.cond");
        let body_label = self.fresh_label("while.body");
        let exit_label = self.fresh_label("while.exit");

        self.emit_branch(&cond_label);
        self.start_block(&cond_label);
        let condition = self.lower_expr(&while_stmt.condition)?;
        let truthy = self.emit_is_truthy(&condition);
        self.emit_cond_branch(&truthy, &body_label, &exit_label);

        self.start_block(&body_label);
        self.lower_stmt(&while_stmt.body)?;
        if !self.frame_ref().terminated {
            self.emit_branch(&cond_label);
        }

        self.start_block(&exit_label);
        Ok(())
    }

    /// `return` stores into the `$returnVal` slot and branches to the
    /// epilogue; anything after it lands in a dead block.
    fn lower_return(&mut self, ret: &ReturnStmt) -> Result<(), CodeGenError> {
        let value = match &ret.expr {
            Some(expr) => self.lower_expr(expr)?,
            None => imm(NIL_VAL),
        };
        let slot = self.frame_ref().return_slot.clone();
        self.emit(format!("store i64 {}, ptr {}", value, slot));
        let epilogue = self.frame_ref().epilogue.clone();
        self.emit_branch(&epilogue);
        let dead = self.fresh_label("unreachable");
        self.start_block(&dead);
        Ok(())
    }

    fn lower_function_stmt(&mut self, decl: &Rc<FunctionDecl>) -> Result<(), CodeGenError> {
        let name = decl.name.lexeme.clone();
        if self.at_script_top_level() {
            let closure = self.lower_function_decl(decl, FunctionContext::Function, "fn")?;
            self.define_variable(&name, &closure);
        } else {
            // Declare the slot first so the body can capture it and the
            // function can recurse through its own name.
            let slot = self.declare_local(&name, &imm(NIL_VAL));
            let closure = self.lower_function_decl(decl, FunctionContext::Function, "fn")?;
            self.emit(format!("store i64 {}, ptr {}", closure, slot));
        }
        Ok(())
    }

    /// Compile a function declaration to its own IR function, then emit
    /// the closure creation sequence in the enclosing frame. Returns the
    /// register holding the boxed closure.
    pub(super) fn lower_function_decl(
        &mut self,
        decl: &FunctionDecl,
        context: FunctionContext,
        prefix: &str,
    ) -> Result<String, CodeGenError> {
        let name = decl.name.lexeme.clone();
        let symbol = self.fresh_symbol(prefix, &name);

        self.push_function(symbol.clone(), name.clone(), context, &decl.parameters);
        for stmt in &decl.body {
            self.lower_stmt(stmt)?;
        }
        let compiled = self.pop_function()?;

        // Back in the enclosing frame: build the runtime objects.
        let name_const = self.string_const(&name)?;
        let name_str = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$internString(ptr {}, i32 {})",
            name_str, name_const.global, name_const.len
        ));
        self.emit_push_temp_obj(&name_str);

        let function = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$allocateFunction(ptr @{}, ptr {}, i32 {}, i1 false)",
            function,
            symbol,
            name_str,
            decl.parameters.len()
        ));
        self.emit_push_temp_obj(&function);

        let closure = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$allocateClosure(ptr {})",
            closure, function
        ));
        self.emit_push_temp_obj(&closure);

        if !compiled.upvalues.is_empty() {
            let array = self.fresh_temp();
            self.emit(format!(
                "{} = call ptr @$allocateUpvalueArray(ptr {}, i32 {})",
                array,
                closure,
                compiled.upvalues.len()
            ));
            for (index, &target) in compiled.upvalues.iter().enumerate() {
                let upvalue = self.materialize_upvalue(target);
                let slot = self.fresh_temp();
                self.emit(format!(
                    "{} = getelementptr inbounds ptr, ptr {}, i32 {}",
                    slot, array, index
                ));
                self.emit(format!("store ptr {}, ptr {}", upvalue, slot));
            }
        }

        self.emit_pop_temps(3);
        Ok(self.emit_obj_val(&closure))
    }

    /// Produce the `%Upvalue*` for one captured slot of a just-compiled
    /// nested function, evaluated in the enclosing frame: a fresh upvalue
    /// over this frame's local, or a copy of this frame's own upvalue.
    fn materialize_upvalue(&mut self, target: UpvalueTarget) -> String {
        match target {
            UpvalueTarget::Local(index) => {
                let slot = self.frame_ref().locals[index].ptr.clone();
                let upvalue = self.fresh_temp();
                self.emit(format!(
                    "{} = call ptr @$allocateUpvalue(ptr {})",
                    upvalue, slot
                ));
                upvalue
            }
            UpvalueTarget::Upvalue(index) => {
                let source = self.fresh_temp();
                self.emit(format!(
                    "{} = getelementptr inbounds ptr, ptr %upvalues, i32 {}",
                    source, index
                ));
                let upvalue = self.fresh_temp();
                self.emit(format!("{} = load ptr, ptr {}", upvalue, source));
                upvalue
            }
        }
    }

    fn lower_class(&mut self, class: &ClassStmt) -> Result<(), CodeGenError> {
        let name = class.name.lexeme.clone();

        // Evaluate and validate the superclass before anything exists.
        let superclass_value = match &class.superclass {
            Some(superclass) => {
                let address =
                    self.lookup_variable(&superclass.name.lexeme, superclass.name.line)?;
                let value = self.fresh_temp();
                self.emit(format!("{} = load i64, ptr {}", value, address));

                let ok = self.fresh_label("super.class");
                let bad = self.fresh_label("super.notclass");
                let is_class = self.emit_is_obj_kind(&value, ObjKind::Class);
                self.emit_cond_branch(&is_class, &ok, &bad);
                self.start_block(&bad);
                self.emit_runtime_error(
                    superclass.name.line,
                    "Superclass must be a class.",
                    &[],
                )?;
                self.start_block(&ok);
                Some(value)
            }
            None => None,
        };

        let name_const = self.string_const(&name)?;
        let name_str = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$internString(ptr {}, i32 {})",
            name_str, name_const.global, name_const.len
        ));
        self.emit_push_temp_obj(&name_str);

        let klass = self.fresh_temp();
        self.emit(format!("{} = call ptr @$allocateClass(ptr {})", klass, name_str));
        let klass_value = self.emit_obj_val(&klass);
        self.emit_push_temp(&klass_value);

        // Inherit by flattening the superclass method table; own methods
        // defined afterwards override it.
        if let Some(superclass) = &superclass_value {
            let super_obj = self.emit_as_obj(superclass);
            let super_methods_ptr = self.fresh_temp();
            self.emit(format!(
                "{} = getelementptr inbounds %Class, ptr {}, i32 0, i32 2",
                super_methods_ptr, super_obj
            ));
            let super_methods = self.fresh_temp();
            self.emit(format!("{} = load ptr, ptr {}", super_methods, super_methods_ptr));
            let methods_ptr = self.fresh_temp();
            self.emit(format!(
                "{} = getelementptr inbounds %Class, ptr {}, i32 0, i32 2",
                methods_ptr, klass
            ));
            let methods = self.fresh_temp();
            self.emit(format!("{} = load ptr, ptr {}", methods, methods_ptr));
            self.emit(format!(
                "call void @$tableAddAll(ptr {}, ptr {})",
                super_methods, methods
            ));
        }

        // Unpin before the variable slot goes in; the slot itself becomes
        // the root.
        self.emit_pop_temps(2);
        self.define_variable(&name, &klass_value);

        self.begin_scope();
        if let Some(superclass) = &superclass_value {
            self.declare_local("super", superclass);
        }

        for method in &class.methods {
            let context = match method.kind.get() {
                FunctionKind::Initializer => FunctionContext::Initializer,
                _ => FunctionContext::Method,
            };
            let closure = self.lower_function_decl(method, context, "method")?;
            self.emit_push_temp(&closure);

            let method_const = self.string_const(&method.name.lexeme)?;
            let key = self.fresh_temp();
            self.emit(format!(
                "{} = call ptr @$internString(ptr {}, i32 {})",
                key, method_const.global, method_const.len
            ));
            let methods_ptr = self.fresh_temp();
            self.emit(format!(
                "{} = getelementptr inbounds %Class, ptr {}, i32 0, i32 2",
                methods_ptr, klass
            ));
            let methods = self.fresh_temp();
            self.emit(format!("{} = load ptr, ptr {}", methods, methods_ptr));
            let ignored = self.fresh_temp();
            self.emit(format!(
                "{} = call i1 @$tableSet(ptr {}, ptr {}, i64 {})",
                ignored, methods, key, closure
            ));
            self.emit_pop_temps(1);
        }

        self.end_scope();
        Ok(())
    }
}
