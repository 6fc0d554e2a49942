//! Expression lowering.
//!
//! Every expression produces one i64 value register. Type errors are
//! runtime checks that branch to an error block carrying the offending
//! source line; merges use phis keyed by the recorded predecessor blocks.
//!
//! GC discipline at allocation points: any value that is live across a
//! call that can allocate (`$concat`, `$internString`, `$bindMethod`,
//! `$allocateInstance`, user calls) is pinned on the locals stack first
//! and popped afterwards.

use super::error::CodeGenError;
use super::state::CodeGen;
use super::value::{FALSE_VAL, NIL_VAL, ObjKind, TRUE_VAL, UNINITIALIZED_VAL, imm};
use lox_frontend::ast::*;
use lox_frontend::token::Literal;

impl CodeGen {
    pub(super) fn lower_expr(&mut self, expr: &Expr) -> Result<String, CodeGenError> {
        match expr {
            Expr::Literal(literal) => self.lower_literal(literal),
            Expr::Grouping(inner) => self.lower_expr(inner),
            Expr::Unary(unary) => self.lower_unary(unary),
            Expr::Binary(binary) => self.lower_binary(binary),
            Expr::Logical(logical) => self.lower_logical(logical),
            Expr::Variable(var) => {
                let address = self.lookup_variable(&var.name.lexeme, var.name.line)?;
                let value = self.fresh_temp();
                self.emit(format!("{} = load i64, ptr {}", value, address));
                Ok(value)
            }
            Expr::Assign(assign) => {
                let value = self.lower_expr(&assign.value)?;
                let address = self.lookup_variable(&assign.name.lexeme, assign.name.line)?;
                self.emit(format!("store i64 {}, ptr {}", value, address));
                Ok(value)
            }
            Expr::This(this) => {
                let address = self.lookup_variable("this", this.keyword.line)?;
                let value = self.fresh_temp();
                self.emit(format!("{} = load i64, ptr {}", value, address));
                Ok(value)
            }
            Expr::Super(sup) => self.lower_super(sup),
            Expr::Get(get) => self.lower_get(get),
            Expr::Set(set) => self.lower_set(set),
            Expr::Call(call) => self.lower_call(call),
        }
    }

    fn lower_literal(&mut self, literal: &Literal) -> Result<String, CodeGenError> {
        match literal {
            Literal::None | Literal::Nil => Ok(imm(NIL_VAL)),
            Literal::Bool(true) => Ok(imm(TRUE_VAL)),
            Literal::Bool(false) => Ok(imm(FALSE_VAL)),
            Literal::Number(n) => Ok(imm(n.to_bits())),
            Literal::String(s) => {
                let constant = self.string_const(s)?;
                let obj = self.fresh_temp();
                self.emit(format!(
                    "{} = call ptr @$internString(ptr {}, i32 {})",
                    obj, constant.global, constant.len
                ));
                Ok(self.emit_obj_val(&obj))
            }
        }
    }

    fn lower_unary(&mut self, unary: &UnaryExpr) -> Result<String, CodeGenError> {
        let value = self.lower_expr(&unary.expr)?;
        match unary.op {
            UnaryOp::Bang => {
                let truthy = self.emit_is_truthy(&value);
                let negated = self.fresh_temp();
                self.emit(format!("{} = xor i1 {}, true", negated, truthy));
                Ok(self.emit_bool_val(&negated))
            }
            UnaryOp::Minus => {
                self.emit_check_number(&value, unary.token.line, "Operand must be a number.")?;
                let number = self.emit_as_number(&value);
                let negated = self.fresh_temp();
                self.emit(format!("{} = fneg double {}", negated, number));
                Ok(self.emit_number_val(&negated))
            }
        }
    }

    fn lower_binary(&mut self, binary: &BinaryExpr) -> Result<String, CodeGenError> {
        let left = self.lower_expr(&binary.left)?;
        let right = self.lower_expr(&binary.right)?;
        let line = binary.token.line;

        match binary.op {
            BinaryOp::Plus => self.lower_plus(&left, &right, line),
            BinaryOp::Minus => self.lower_arithmetic(&left, &right, line, "fsub"),
            BinaryOp::Star => self.lower_arithmetic(&left, &right, line, "fmul"),
            BinaryOp::Slash => self.lower_arithmetic(&left, &right, line, "fdiv"),
            BinaryOp::Greater => self.lower_comparison(&left, &right, line, "ogt"),
            BinaryOp::GreaterEqual => self.lower_comparison(&left, &right, line, "oge"),
            BinaryOp::Less => self.lower_comparison(&left, &right, line, "olt"),
            BinaryOp::LessEqual => self.lower_comparison(&left, &right, line, "ole"),
            BinaryOp::EqualEqual => self.lower_equality(&left, &right, false),
            BinaryOp::BangEqual => self.lower_equality(&left, &right, true),
        }
    }

    fn emit_check_number(
        &mut self,
        value: &str,
        line: u32,
        message: &str,
    ) -> Result<(), CodeGenError> {
        let is_number = self.emit_is_number(value);
        let ok = self.fresh_label("num.ok");
        let bad = self.fresh_label("num.bad");
        self.emit_cond_branch(&is_number, &ok, &bad);
        self.start_block(&bad);
        self.emit_runtime_error(line, message, &[])?;
        self.start_block(&ok);
        Ok(())
    }

    fn emit_check_numbers(
        &mut self,
        left: &str,
        right: &str,
        line: u32,
    ) -> Result<(), CodeGenError> {
        let left_ok = self.emit_is_number(left);
        let right_ok = self.emit_is_number(right);
        let both = self.fresh_temp();
        self.emit(format!("{} = and i1 {}, {}", both, left_ok, right_ok));
        let ok = self.fresh_label("num.ok");
        let bad = self.fresh_label("num.bad");
        self.emit_cond_branch(&both, &ok, &bad);
        self.start_block(&bad);
        self.emit_runtime_error(line, "Operands must be numbers.", &[])?;
        self.start_block(&ok);
        Ok(())
    }

    fn lower_arithmetic(
        &mut self,
        left: &str,
        right: &str,
        line: u32,
        op: &str,
    ) -> Result<String, CodeGenError> {
        self.emit_check_numbers(left, right, line)?;
        let a = self.emit_as_number(left);
        let b = self.emit_as_number(right);
        let result = self.fresh_temp();
        self.emit(format!("{} = {} double {}, {}", result, op, a, b));
        Ok(self.emit_number_val(&result))
    }

    fn lower_comparison(
        &mut self,
        left: &str,
        right: &str,
        line: u32,
        predicate: &str,
    ) -> Result<String, CodeGenError> {
        self.emit_check_numbers(left, right, line)?;
        let a = self.emit_as_number(left);
        let b = self.emit_as_number(right);
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = fcmp {} double {}, {}",
            result, predicate, a, b
        ));
        Ok(self.emit_bool_val(&result))
    }

    /// `+` is numeric addition or string concatenation; anything else is
    /// a runtime error at the operator's line.
    fn lower_plus(
        &mut self,
        left: &str,
        right: &str,
        line: u32,
    ) -> Result<String, CodeGenError> {
        let numbers = self.fresh_label("plus.numbers");
        let maybe_strings = self.fresh_label("plus.maybe.strings");
        let strings = self.fresh_label("plus.strings");
        let invalid = self.fresh_label("plus.invalid");
        let end = self.fresh_label("plus.end");

        let left_num = self.emit_is_number(left);
        let right_num = self.emit_is_number(right);
        let both_num = self.fresh_temp();
        self.emit(format!("{} = and i1 {}, {}", both_num, left_num, right_num));
        self.emit_cond_branch(&both_num, &numbers, &maybe_strings);

        self.start_block(&numbers);
        let a = self.emit_as_number(left);
        let b = self.emit_as_number(right);
        let sum = self.fresh_temp();
        self.emit(format!("{} = fadd double {}, {}", sum, a, b));
        let sum_val = self.emit_number_val(&sum);
        let numbers_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&maybe_strings);
        let left_str = self.emit_is_obj_kind(left, ObjKind::String);
        let right_str = self.emit_is_obj_kind(right, ObjKind::String);
        let both_str = self.fresh_temp();
        self.emit(format!("{} = and i1 {}, {}", both_str, left_str, right_str));
        self.emit_cond_branch(&both_str, &strings, &invalid);

        self.start_block(&strings);
        // Concatenation interns, which can collect; the operands are only
        // held in registers here.
        self.emit_push_temp(left);
        self.emit_push_temp(right);
        let joined = self.fresh_temp();
        self.emit(format!(
            "{} = call i64 @$concat(i64 {}, i64 {})",
            joined, left, right
        ));
        self.emit_pop_temps(2);
        let strings_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&invalid);
        self.emit_runtime_error(line, "Operands must be two numbers or two strings.", &[])?;

        self.start_block(&end);
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = phi i64 [ {}, %{} ], [ {}, %{} ]",
            result, sum_val, numbers_end, joined, strings_end
        ));
        Ok(result)
    }

    /// Numbers compare as IEEE doubles, strings by contents, everything
    /// else by bit pattern (which interning makes exact for objects).
    fn lower_equality(
        &mut self,
        left: &str,
        right: &str,
        negate: bool,
    ) -> Result<String, CodeGenError> {
        let numbers = self.fresh_label("eq.numbers");
        let maybe_strings = self.fresh_label("eq.maybe.strings");
        let strings = self.fresh_label("eq.strings");
        let raw = self.fresh_label("eq.raw");
        let end = self.fresh_label("eq.end");

        let left_num = self.emit_is_number(left);
        let right_num = self.emit_is_number(right);
        let both_num = self.fresh_temp();
        self.emit(format!("{} = and i1 {}, {}", both_num, left_num, right_num));
        self.emit_cond_branch(&both_num, &numbers, &maybe_strings);

        self.start_block(&numbers);
        let a = self.emit_as_number(left);
        let b = self.emit_as_number(right);
        let num_eq = self.fresh_temp();
        self.emit(format!("{} = fcmp oeq double {}, {}", num_eq, a, b));
        let numbers_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&maybe_strings);
        let left_str = self.emit_is_obj_kind(left, ObjKind::String);
        let right_str = self.emit_is_obj_kind(right, ObjKind::String);
        let both_str = self.fresh_temp();
        self.emit(format!("{} = and i1 {}, {}", both_str, left_str, right_str));
        self.emit_cond_branch(&both_str, &strings, &raw);

        self.start_block(&strings);
        let str_eq = self.fresh_temp();
        self.emit(format!(
            "{} = call i1 @$strEquals(i64 {}, i64 {})",
            str_eq, left, right
        ));
        let strings_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&raw);
        let raw_eq = self.fresh_temp();
        self.emit(format!("{} = icmp eq i64 {}, {}", raw_eq, left, right));
        let raw_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&end);
        let merged = self.fresh_temp();
        self.emit(format!(
            "{} = phi i1 [ {}, %{} ], [ {}, %{} ], [ {}, %{} ]",
            merged, num_eq, numbers_end, str_eq, strings_end, raw_eq, raw_end
        ));
        let result = if negate {
            let negated = self.fresh_temp();
            self.emit(format!("{} = xor i1 {}, true", negated, merged));
            negated
        } else {
            merged
        };
        Ok(self.emit_bool_val(&result))
    }

    /// Short-circuit `and`/`or`, producing the deciding operand's value.
    fn lower_logical(&mut self, logical: &LogicalExpr) -> Result<String, CodeGenError> {
        let right_label = self.fresh_label("logic.right");
        let end = self.fresh_label("logic.end");

        let left = self.lower_expr(&logical.left)?;
        let truthy = self.emit_is_truthy(&left);
        let left_end = self.current_block();
        match logical.op {
            LogicalOp::Or => self.emit_cond_branch(&truthy, &end, &right_label),
            LogicalOp::And => self.emit_cond_branch(&truthy, &right_label, &end),
        }

        self.start_block(&right_label);
        let right = self.lower_expr(&logical.right)?;
        let right_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&end);
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = phi i64 [ {}, %{} ], [ {}, %{} ]",
            result, left, left_end, right, right_end
        ));
        Ok(result)
    }

    fn lower_get(&mut self, get: &GetExpr) -> Result<String, CodeGenError> {
        let object = self.lower_expr(&get.object)?;
        let line = get.name.line;

        let ok = self.fresh_label("get.instance");
        let bad = self.fresh_label("get.noninstance");
        let is_instance = self.emit_is_obj_kind(&object, ObjKind::Instance);
        self.emit_cond_branch(&is_instance, &ok, &bad);

        self.start_block(&bad);
        self.emit_runtime_error(line, "Only instances have properties.", &[])?;

        self.start_block(&ok);
        let instance = self.emit_as_obj(&object);
        // Interning the property name and binding a method both allocate.
        self.emit_push_temp(&object);
        let key_const = self.string_const(&get.name.lexeme)?;
        let key = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$internString(ptr {}, i32 {})",
            key, key_const.global, key_const.len
        ));

        let fields_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Instance, ptr {}, i32 0, i32 2",
            fields_ptr, instance
        ));
        let fields = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", fields, fields_ptr));
        let field_value = self.fresh_temp();
        self.emit(format!(
            "{} = call i64 @$tableGet(ptr {}, ptr {})",
            field_value, fields, key
        ));

        let from_field = self.fresh_label("get.field");
        let try_method = self.fresh_label("get.method");
        let undefined = self.fresh_label("get.undefined");
        let bind = self.fresh_label("get.bind");
        let end = self.fresh_label("get.end");

        let field_missing = self.fresh_temp();
        self.emit(format!(
            "{} = icmp eq i64 {}, {}",
            field_missing,
            field_value,
            imm(UNINITIALIZED_VAL)
        ));
        self.emit_cond_branch(&field_missing, &try_method, &from_field);

        self.start_block(&from_field);
        self.emit_branch(&end);

        self.start_block(&try_method);
        let class_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Instance, ptr {}, i32 0, i32 1",
            class_ptr, instance
        ));
        let class = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", class, class_ptr));
        let methods_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Class, ptr {}, i32 0, i32 2",
            methods_ptr, class
        ));
        let methods = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", methods, methods_ptr));
        let method_value = self.fresh_temp();
        self.emit(format!(
            "{} = call i64 @$tableGet(ptr {}, ptr {})",
            method_value, methods, key
        ));
        let method_missing = self.fresh_temp();
        self.emit(format!(
            "{} = icmp eq i64 {}, {}",
            method_missing,
            method_value,
            imm(UNINITIALIZED_VAL)
        ));
        self.emit_cond_branch(&method_missing, &undefined, &bind);

        self.start_block(&undefined);
        let message = format!("Undefined property '{}'.", get.name.lexeme);
        self.emit_runtime_error(line, &message, &[])?;

        self.start_block(&bind);
        let method = self.emit_as_obj(&method_value);
        let bound = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$bindMethod(i64 {}, ptr {})",
            bound, object, method
        ));
        let bound_value = self.emit_obj_val(&bound);
        let bind_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&end);
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = phi i64 [ {}, %{} ], [ {}, %{} ]",
            result, field_value, from_field, bound_value, bind_end
        ));
        self.emit_pop_temps(1);
        Ok(result)
    }

    fn lower_set(&mut self, set: &SetExpr) -> Result<String, CodeGenError> {
        let object = self.lower_expr(&set.object)?;
        let line = set.name.line;

        let ok = self.fresh_label("set.instance");
        let bad = self.fresh_label("set.noninstance");
        let is_instance = self.emit_is_obj_kind(&object, ObjKind::Instance);
        self.emit_cond_branch(&is_instance, &ok, &bad);

        self.start_block(&bad);
        self.emit_runtime_error(line, "Only instances have fields.", &[])?;

        self.start_block(&ok);
        let instance = self.emit_as_obj(&object);
        let value = self.lower_expr(&set.value)?;

        // The key intern can collect; pin the receiver and a fresh value.
        self.emit_push_temp(&object);
        self.emit_push_temp(&value);
        let key_const = self.string_const(&set.name.lexeme)?;
        let key = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$internString(ptr {}, i32 {})",
            key, key_const.global, key_const.len
        ));

        let fields_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Instance, ptr {}, i32 0, i32 2",
            fields_ptr, instance
        ));
        let fields = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", fields, fields_ptr));
        let ignored = self.fresh_temp();
        self.emit(format!(
            "{} = call i1 @$tableSet(ptr {}, ptr {}, i64 {})",
            ignored, fields, key, value
        ));
        self.emit_pop_temps(2);
        Ok(value)
    }

    /// `super.m`: the method is looked up starting at the superclass the
    /// resolver bound, and bound to the current receiver.
    fn lower_super(&mut self, sup: &SuperExpr) -> Result<String, CodeGenError> {
        let line = sup.keyword.line;
        let super_address = self.lookup_variable("super", line)?;
        let superclass_value = self.fresh_temp();
        self.emit(format!(
            "{} = load i64, ptr {}",
            superclass_value,
            super_address
        ));
        let this_address = self.lookup_variable("this", line)?;
        let receiver = self.fresh_temp();
        self.emit(format!(
            "{} = load i64, ptr {}",
            receiver,
            this_address
        ));

        let superclass = self.emit_as_obj(&superclass_value);
        self.emit_push_temp(&receiver);
        let key_const = self.string_const(&sup.method.lexeme)?;
        let key = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$internString(ptr {}, i32 {})",
            key, key_const.global, key_const.len
        ));
        let methods_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Class, ptr {}, i32 0, i32 2",
            methods_ptr, superclass
        ));
        let methods = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", methods, methods_ptr));
        let method_value = self.fresh_temp();
        self.emit(format!(
            "{} = call i64 @$tableGet(ptr {}, ptr {})",
            method_value, methods, key
        ));

        let undefined = self.fresh_label("super.undefined");
        let bind = self.fresh_label("super.bind");
        let missing = self.fresh_temp();
        self.emit(format!(
            "{} = icmp eq i64 {}, {}",
            missing,
            method_value,
            imm(UNINITIALIZED_VAL)
        ));
        self.emit_cond_branch(&missing, &undefined, &bind);

        self.start_block(&undefined);
        let message = format!("Undefined property '{}'.", sup.method.lexeme);
        self.emit_runtime_error(sup.method.line, &message, &[])?;

        self.start_block(&bind);
        let method = self.emit_as_obj(&method_value);
        let bound = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$bindMethod(i64 {}, ptr {})",
            bound, receiver, method
        ));
        let result = self.emit_obj_val(&bound);
        self.emit_pop_temps(1);
        Ok(result)
    }

    /// Calls dispatch on the callee's object kind: closures, bound
    /// methods, and classes are callable; anything else is an error.
    fn lower_call(&mut self, call: &CallExpr) -> Result<String, CodeGenError> {
        let line = call.keyword.line;
        let callee = self.lower_expr(&call.callee)?;
        let mut arguments = Vec::with_capacity(call.arguments.len());
        for argument in &call.arguments {
            arguments.push(self.lower_expr(argument)?);
        }
        let argc = arguments.len();

        // Callee and arguments live across the callee's allocations.
        self.emit_push_temp(&callee);
        for argument in &arguments {
            self.emit_push_temp(argument);
        }
        let pinned = 1 + argc;

        let kind = self.fresh_label("call.kind");
        let not_callable = self.fresh_label("call.noncallable");
        let closure_label = self.fresh_label("call.closure");
        let bound_label = self.fresh_label("call.bound");
        let class_label = self.fresh_label("call.class");
        let invoke = self.fresh_label("call.invoke");
        let end = self.fresh_label("call.end");

        let is_obj = self.emit_is_obj(&callee);
        self.emit_cond_branch(&is_obj, &kind, &not_callable);

        self.start_block(&kind);
        let obj = self.emit_as_obj(&callee);
        let tag = self.emit_obj_type(&obj);
        self.emit(format!(
            "switch i8 {}, label %{} [\n    i8 3, label %{}\n    i8 7, label %{}\n    i8 5, label %{}\n  ]",
            tag, not_callable, closure_label, bound_label, class_label
        ));
        self.frame().terminated = true;

        self.start_block(&closure_label);
        self.emit_branch(&invoke);

        self.start_block(&bound_label);
        let receiver_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %BoundMethod, ptr {}, i32 0, i32 1",
            receiver_ptr, obj
        ));
        let bound_receiver = self.fresh_temp();
        self.emit(format!("{} = load i64, ptr {}", bound_receiver, receiver_ptr));
        let method_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %BoundMethod, ptr {}, i32 0, i32 2",
            method_ptr, obj
        ));
        let bound_method = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", bound_method, method_ptr));
        self.emit_branch(&invoke);

        self.start_block(&invoke);
        let closure = self.fresh_temp();
        self.emit(format!(
            "{} = phi ptr [ {}, %{} ], [ {}, %{} ]",
            closure, obj, closure_label, bound_method, bound_label
        ));
        let receiver = self.fresh_temp();
        self.emit(format!(
            "{} = phi i64 [ {}, %{} ], [ {}, %{} ]",
            receiver,
            imm(NIL_VAL),
            closure_label,
            bound_receiver,
            bound_label
        ));
        let invoke_result =
            self.emit_invoke_closure(&closure, &receiver, &arguments, line, argc)?;
        let invoke_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&class_label);
        let class_result = self.emit_construct_instance(&obj, &arguments, line, argc)?;
        let class_end = self.current_block();
        self.emit_branch(&end);

        self.start_block(&not_callable);
        self.emit_runtime_error(line, "Can only call functions and classes.", &[])?;

        self.start_block(&end);
        let result = self.fresh_temp();
        self.emit(format!(
            "{} = phi i64 [ {}, %{} ], [ {}, %{} ]",
            result, invoke_result, invoke_end, class_result, class_end
        ));
        self.emit_pop_temps(pinned);
        Ok(result)
    }

    /// Arity-check and indirectly call a closure's function with the given
    /// receiver, maintaining the runtime call stack around the call.
    fn emit_invoke_closure(
        &mut self,
        closure: &str,
        receiver: &str,
        arguments: &[String],
        line: u32,
        argc: usize,
    ) -> Result<String, CodeGenError> {
        let function_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Closure, ptr {}, i32 0, i32 1",
            function_ptr, closure
        ));
        let function = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", function, function_ptr));

        let arity_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Function, ptr {}, i32 0, i32 1",
            arity_ptr, function
        ));
        let arity = self.fresh_temp();
        self.emit(format!("{} = load i32, ptr {}", arity, arity_ptr));
        let arity_ok = self.fresh_temp();
        self.emit(format!("{} = icmp eq i32 {}, {}", arity_ok, arity, argc));
        let ok = self.fresh_label("arity.ok");
        let bad = self.fresh_label("arity.bad");
        self.emit_cond_branch(&arity_ok, &ok, &bad);

        self.start_block(&bad);
        self.emit_runtime_error(
            line,
            "Expected %d arguments but got %d.",
            &[("i32", arity.clone()), ("i32", argc.to_string())],
        )?;

        self.start_block(&ok);
        let name_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Function, ptr {}, i32 0, i32 3",
            name_ptr, function
        ));
        let name = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", name, name_ptr));
        let chars_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %String, ptr {}, i32 0, i32 1",
            chars_ptr, name
        ));
        let chars = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", chars, chars_ptr));
        self.emit(format!(
            "call void @$checkStackOverflow(i32 {}, ptr {})",
            line, chars
        ));
        self.emit(format!("call void @$pushCall(i32 {}, ptr {})", line, chars));

        let upvalues_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Closure, ptr {}, i32 0, i32 2",
            upvalues_ptr, closure
        ));
        let upvalues = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", upvalues, upvalues_ptr));
        let code_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Function, ptr {}, i32 0, i32 2",
            code_ptr, function
        ));
        let code = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", code, code_ptr));

        let mut call_args = format!("i64 {}, ptr {}", receiver, upvalues);
        for argument in arguments {
            call_args.push_str(&format!(", i64 {}", argument));
        }
        let result = self.fresh_temp();
        self.emit(format!("{} = call i64 {}({})", result, code, call_args));
        self.emit("call void @$popCall()");
        Ok(result)
    }

    /// Calling a class allocates an instance and runs `init` when the
    /// class (or an ancestor) defines one.
    fn emit_construct_instance(
        &mut self,
        class: &str,
        arguments: &[String],
        line: u32,
        argc: usize,
    ) -> Result<String, CodeGenError> {
        let instance = self.fresh_temp();
        self.emit(format!(
            "{} = call ptr @$allocateInstance(ptr {})",
            instance, class
        ));
        let instance_value = self.emit_obj_val(&instance);
        self.emit_push_temp(&instance_value);

        let methods_ptr = self.fresh_temp();
        self.emit(format!(
            "{} = getelementptr inbounds %Class, ptr {}, i32 0, i32 2",
            methods_ptr, class
        ));
        let methods = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr {}", methods, methods_ptr));
        let init_key = self.fresh_temp();
        self.emit(format!("{} = load ptr, ptr @initString", init_key));
        let init_value = self.fresh_temp();
        self.emit(format!(
            "{} = call i64 @$tableGet(ptr {}, ptr {})",
            init_value, methods, init_key
        ));

        let with_init = self.fresh_label("ctor.init");
        let without_init = self.fresh_label("ctor.plain");
        let done = self.fresh_label("ctor.done");
        let has_init = self.fresh_temp();
        self.emit(format!(
            "{} = icmp ne i64 {}, {}",
            has_init,
            init_value,
            imm(UNINITIALIZED_VAL)
        ));
        self.emit_cond_branch(&has_init, &with_init, &without_init);

        self.start_block(&with_init);
        let init_closure = self.emit_as_obj(&init_value);
        self.emit_invoke_closure(&init_closure, &instance_value, arguments, line, argc)?;
        self.emit_branch(&done);

        self.start_block(&without_init);
        if argc == 0 {
            self.emit_branch(&done);
        } else {
            // Arity mismatch is certain here: no initializer means zero
            // parameters.
            self.emit_runtime_error(
                line,
                "Expected %d arguments but got %d.",
                &[("i32", "0".to_string()), ("i32", argc.to_string())],
            )?;
        }

        self.start_block(&done);
        self.emit_pop_temps(1);
        Ok(instance_value)
    }
}
