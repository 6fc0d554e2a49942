//! The tree-walking evaluator.
//!
//! Statement execution returns `Flow` so `return` propagates as ordinary
//! data up the block evaluator instead of unwinding through the host.
//! Runtime errors are `Err`s carrying the offending token; the driver
//! prints them with the interpreter's call trace and exits nonzero.

use crate::callable::{LoxClass, LoxFunction, LoxInstance};
use crate::environment::Environment;
use crate::error::RuntimeError;
use crate::natives::define_natives;
use crate::value::Value;
use lox_frontend::ast::*;
use lox_frontend::token::{Literal, Token};
use std::collections::HashMap;
use std::rc::Rc;

/// Call depth at which the interpreter gives up, matching the compiled
/// backend's call stack capacity.
const MAX_CALL_DEPTH: usize = 512;

/// Result of executing a statement.
pub enum Flow {
    Normal,
    Return(Value),
}

type ExecResult = Result<Flow, RuntimeError>;
type EvalResult = Result<Value, RuntimeError>;

struct Frame {
    line: u32,
    name: String,
}

pub struct Interpreter {
    globals: Rc<Environment>,
    environment: Rc<Environment>,
    frames: Vec<Frame>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        let globals = Environment::new();
        define_natives(&globals);
        Interpreter {
            environment: Rc::clone(&globals),
            globals,
            frames: Vec::new(),
        }
    }

    pub fn interpret(&mut self, program: &Program) -> Result<(), RuntimeError> {
        for stmt in program {
            self.execute(stmt)?;
        }
        Ok(())
    }

    /// Report a runtime error to stderr: the message, then the frame the
    /// error occurred in, then the rest of the call trace down to the
    /// script level.
    pub fn report(&self, error: &RuntimeError) {
        eprintln!("{}", error.message);
        match self.frames.last() {
            Some(frame) => eprintln!("[line {}] in {}()", error.token.line, frame.name),
            None => eprintln!("[line {}] in script", error.token.line),
        }
        for (i, frame) in self.frames.iter().enumerate().rev() {
            if i == 0 {
                eprintln!("[line {}] in script", frame.line);
            } else {
                eprintln!("[line {}] in {}()", frame.line, frame.name);
            }
        }
    }

    fn execute(&mut self, stmt: &Stmt) -> ExecResult {
        match stmt {
            Stmt::Expression(expr) => {
                self.evaluate(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Print(expr) => {
                let value = self.evaluate(expr)?;
                println!("{}", value);
                Ok(Flow::Normal)
            }
            Stmt::Var(var) => {
                let value = self.evaluate(&var.initializer)?;
                self.environment.define(var.name.lexeme.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Block(statements) => {
                let environment = Environment::with_enclosing(Rc::clone(&self.environment));
                self.execute_block(statements, environment)
            }
            Stmt::If(if_stmt) => {
                if self.evaluate(&if_stmt.condition)?.is_truthy() {
                    self.execute(&if_stmt.then_branch)
                } else if let Some(else_branch) = &if_stmt.else_branch {
                    self.execute(else_branch)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While(while_stmt) => {
                while self.evaluate(&while_stmt.condition)?.is_truthy() {
                    if let Flow::Return(value) = self.execute(&while_stmt.body)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(ret) => {
                let value = match &ret.expr {
                    Some(expr) => self.evaluate(expr)?,
                    None => Value::Nil,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Function(decl) => {
                let function = LoxFunction::new(Rc::clone(decl), Rc::clone(&self.environment));
                self.environment
                    .define(decl.name.lexeme.clone(), Value::Function(function));
                Ok(Flow::Normal)
            }
            Stmt::Class(class) => self.execute_class(class),
        }
    }

    fn execute_class(&mut self, class: &ClassStmt) -> ExecResult {
        let superclass = match &class.superclass {
            Some(var) => match self.lookup_variable(&var.name, &var.distance)? {
                Value::Class(superclass) => Some(superclass),
                _ => {
                    return Err(RuntimeError::new(&var.name, "Superclass must be a class."));
                }
            },
            None => None,
        };

        self.environment.define(class.name.lexeme.clone(), Value::Nil);

        // Methods close over a scope holding `super` when inheriting, so
        // `super.m` resolves at the distance the resolver computed.
        let method_environment = match &superclass {
            Some(superclass) => {
                let environment = Environment::with_enclosing(Rc::clone(&self.environment));
                environment.define("super", Value::Class(Rc::clone(superclass)));
                environment
            }
            None => Rc::clone(&self.environment),
        };

        let mut methods = HashMap::new();
        for method in &class.methods {
            methods.insert(
                method.name.lexeme.clone(),
                LoxFunction::new(Rc::clone(method), Rc::clone(&method_environment)),
            );
        }

        let klass = Rc::new(LoxClass {
            name: class.name.lexeme.clone(),
            superclass,
            methods,
        });
        self.environment
            .assign(&class.name.lexeme, Value::Class(klass));
        Ok(Flow::Normal)
    }

    fn execute_block(&mut self, statements: &[Stmt], environment: Rc<Environment>) -> ExecResult {
        let previous = std::mem::replace(&mut self.environment, environment);
        let mut result = Ok(Flow::Normal);
        for stmt in statements {
            match self.execute(stmt) {
                Ok(Flow::Normal) => {}
                other => {
                    result = other;
                    break;
                }
            }
        }
        self.environment = previous;
        result
    }

    pub fn evaluate(&mut self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::None | Literal::Nil => Value::Nil,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Number(n) => Value::Number(*n),
                Literal::String(s) => Value::string(s.clone()),
            }),
            Expr::Grouping(inner) => self.evaluate(inner),
            Expr::Unary(unary) => self.evaluate_unary(unary),
            Expr::Binary(binary) => self.evaluate_binary(binary),
            Expr::Logical(logical) => {
                let left = self.evaluate(&logical.left)?;
                match logical.op {
                    LogicalOp::Or if left.is_truthy() => Ok(left),
                    LogicalOp::And if !left.is_truthy() => Ok(left),
                    _ => self.evaluate(&logical.right),
                }
            }
            Expr::Variable(var) => self.lookup_variable(&var.name, &var.distance),
            Expr::Assign(assign) => {
                let value = self.evaluate(&assign.value)?;
                match assign.distance.get() {
                    Some(distance) => {
                        self.environment
                            .assign_at(distance, &assign.name.lexeme, value.clone());
                    }
                    None => {
                        if !self.globals.assign(&assign.name.lexeme, value.clone()) {
                            return Err(undefined_variable(&assign.name));
                        }
                    }
                }
                Ok(value)
            }
            Expr::This(this) => self.lookup_variable(&this.keyword, &this.distance),
            Expr::Super(sup) => self.evaluate_super(sup),
            Expr::Get(get) => self.evaluate_get(get),
            Expr::Set(set) => self.evaluate_set(set),
            Expr::Call(call) => self.evaluate_call(call),
        }
    }

    fn evaluate_unary(&mut self, unary: &UnaryExpr) -> EvalResult {
        let value = self.evaluate(&unary.expr)?;
        match unary.op {
            UnaryOp::Minus => match value {
                Value::Number(n) => Ok(Value::Number(-n)),
                _ => Err(RuntimeError::new(&unary.token, "Operand must be a number.")),
            },
            UnaryOp::Bang => Ok(Value::Bool(!value.is_truthy())),
        }
    }

    fn evaluate_binary(&mut self, binary: &BinaryExpr) -> EvalResult {
        let left = self.evaluate(&binary.left)?;
        let right = self.evaluate(&binary.right)?;

        match binary.op {
            BinaryOp::Plus => match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                (Value::String(a), Value::String(b)) => {
                    Ok(Value::string(format!("{}{}", a, b)))
                }
                _ => Err(RuntimeError::new(
                    &binary.token,
                    "Operands must be two numbers or two strings.",
                )),
            },
            BinaryOp::Minus => self.numeric_op(&binary.token, &left, &right, |a, b| {
                Value::Number(a - b)
            }),
            BinaryOp::Star => self.numeric_op(&binary.token, &left, &right, |a, b| {
                Value::Number(a * b)
            }),
            BinaryOp::Slash => self.numeric_op(&binary.token, &left, &right, |a, b| {
                Value::Number(a / b)
            }),
            BinaryOp::Greater => {
                self.numeric_op(&binary.token, &left, &right, |a, b| Value::Bool(a > b))
            }
            BinaryOp::GreaterEqual => {
                self.numeric_op(&binary.token, &left, &right, |a, b| Value::Bool(a >= b))
            }
            BinaryOp::Less => {
                self.numeric_op(&binary.token, &left, &right, |a, b| Value::Bool(a < b))
            }
            BinaryOp::LessEqual => {
                self.numeric_op(&binary.token, &left, &right, |a, b| Value::Bool(a <= b))
            }
            BinaryOp::EqualEqual => Ok(Value::Bool(left == right)),
            BinaryOp::BangEqual => Ok(Value::Bool(left != right)),
        }
    }

    fn numeric_op(
        &self,
        token: &Token,
        left: &Value,
        right: &Value,
        op: impl Fn(f64, f64) -> Value,
    ) -> EvalResult {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(op(*a, *b)),
            _ => Err(RuntimeError::new(token, "Operands must be numbers.")),
        }
    }

    fn evaluate_get(&mut self, get: &GetExpr) -> EvalResult {
        let object = self.evaluate(&get.object)?;
        let Value::Instance(instance) = object else {
            return Err(RuntimeError::new(
                &get.name,
                "Only instances have properties.",
            ));
        };

        let field = instance.fields.borrow().get(&get.name.lexeme).cloned();
        if let Some(value) = field {
            return Ok(value);
        }

        if let Some(method) = instance.class.find_method(&get.name.lexeme) {
            return Ok(Value::Function(
                method.bind(Value::Instance(Rc::clone(&instance))),
            ));
        }

        Err(RuntimeError::new(
            &get.name,
            format!("Undefined property '{}'.", get.name.lexeme),
        ))
    }

    fn evaluate_set(&mut self, set: &SetExpr) -> EvalResult {
        let object = self.evaluate(&set.object)?;
        let Value::Instance(instance) = object else {
            return Err(RuntimeError::new(&set.name, "Only instances have fields."));
        };

        let value = self.evaluate(&set.value)?;
        instance
            .fields
            .borrow_mut()
            .insert(set.name.lexeme.clone(), value.clone());
        Ok(value)
    }

    fn evaluate_super(&mut self, sup: &SuperExpr) -> EvalResult {
        let distance = sup.distance.get().unwrap_or(0);
        let superclass = match self.environment.get_at(distance, "super") {
            Some(Value::Class(superclass)) => superclass,
            _ => return Err(undefined_variable(&sup.keyword)),
        };
        let instance = self
            .environment
            .get_at(distance.saturating_sub(1), "this")
            .unwrap_or(Value::Nil);

        match superclass.find_method(&sup.method.lexeme) {
            Some(method) => Ok(Value::Function(method.bind(instance))),
            None => Err(RuntimeError::new(
                &sup.method,
                format!("Undefined property '{}'.", sup.method.lexeme),
            )),
        }
    }

    fn evaluate_call(&mut self, call: &CallExpr) -> EvalResult {
        if self.frames.len() > MAX_CALL_DEPTH {
            return Err(RuntimeError::new(&call.keyword, "Stack overflow."));
        }

        let callee = self.evaluate(&call.callee)?;

        let mut arguments = Vec::with_capacity(call.arguments.len());
        for argument in &call.arguments {
            arguments.push(self.evaluate(argument)?);
        }

        match callee {
            Value::Function(function) => {
                self.check_arity(function.arity(), arguments.len(), &call.keyword)?;
                self.call_function(&function, arguments, &call.keyword)
            }
            Value::Native(native) => {
                self.check_arity(native.arity, arguments.len(), &call.keyword)?;
                native.call(&arguments)
            }
            Value::Class(class) => {
                self.check_arity(class.arity(), arguments.len(), &call.keyword)?;
                let instance = LoxInstance::new(Rc::clone(&class));
                if let Some(init) = class.find_method("init") {
                    let bound = init.bind(Value::Instance(Rc::clone(&instance)));
                    self.call_function(&bound, arguments, &call.keyword)?;
                }
                Ok(Value::Instance(instance))
            }
            _ => Err(RuntimeError::new(
                &call.keyword,
                "Can only call functions and classes.",
            )),
        }
    }

    fn check_arity(
        &self,
        expected: usize,
        got: usize,
        keyword: &Token,
    ) -> Result<(), RuntimeError> {
        if expected != got {
            return Err(RuntimeError::new(
                keyword,
                format!("Expected {} arguments but got {}.", expected, got),
            ));
        }
        Ok(())
    }

    fn call_function(
        &mut self,
        function: &LoxFunction,
        arguments: Vec<Value>,
        keyword: &Token,
    ) -> EvalResult {
        let environment = Environment::with_enclosing(Rc::clone(&function.closure));
        for (parameter, argument) in function.declaration.parameters.iter().zip(arguments) {
            environment.define(parameter.lexeme.clone(), argument);
        }

        self.frames.push(Frame {
            line: keyword.line,
            name: function.name().to_string(),
        });

        let flow = self.execute_block(&function.declaration.body, environment)?;

        // The frame stays on an error unwind so the trace can print it.
        self.frames.pop();

        if function.is_initializer() {
            // `init` always returns the receiver, even on a bare `return;`.
            return Ok(function.closure.get_at(0, "this").unwrap_or(Value::Nil));
        }

        match flow {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Nil),
        }
    }

    fn lookup_variable(&self, name: &Token, distance: &Distance) -> EvalResult {
        let value = match distance.get() {
            Some(distance) => self.environment.get_at(distance, &name.lexeme),
            None => self.globals.get(&name.lexeme),
        };
        value.ok_or_else(|| undefined_variable(name))
    }
}

fn undefined_variable(name: &Token) -> RuntimeError {
    RuntimeError::new(
        name,
        format!("Undefined variable '{}'.", name.lexeme),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lox_frontend::{ErrorReporter, parse_and_resolve};

    fn run(source: &str) -> Result<(), RuntimeError> {
        let mut reporter = ErrorReporter::new();
        let program = parse_and_resolve(source, &mut reporter);
        assert!(!reporter.had_error(), "compile errors in test source");
        Interpreter::new().interpret(&program)
    }

    fn eval(source: &str) -> Value {
        let mut reporter = ErrorReporter::new();
        let program = parse_and_resolve(source, &mut reporter);
        assert!(!reporter.had_error(), "compile errors in test source");
        let mut interpreter = Interpreter::new();
        // All statements but the last set up state; the last must be an
        // expression statement whose value we want.
        let (last, rest) = program.split_last().expect("nonempty program");
        for stmt in rest {
            interpreter.execute(stmt).expect("setup should not fail");
        }
        let Stmt::Expression(expr) = last else {
            panic!("last statement must be an expression");
        };
        interpreter.evaluate(expr).expect("evaluation failed")
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3;"), Value::Number(7.0));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(eval("\"foo\" + \"bar\";"), Value::string("foobar"));
    }

    #[test]
    fn test_mixed_plus_is_error() {
        let err = run("print 1 + \"a\";").unwrap_err();
        assert_eq!(err.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn test_comparison_requires_numbers() {
        let err = run("print \"a\" < \"b\";").unwrap_err();
        assert_eq!(err.message, "Operands must be numbers.");
    }

    #[test]
    fn test_equality_across_types() {
        assert_eq!(eval("1 == \"1\";"), Value::Bool(false));
        assert_eq!(eval("nil == nil;"), Value::Bool(true));
        assert_eq!(eval("nil == false;"), Value::Bool(false));
    }

    #[test]
    fn test_logical_operators_return_operands() {
        assert_eq!(eval("1 or 2;"), Value::Number(1.0));
        assert_eq!(eval("nil or 2;"), Value::Number(2.0));
        assert_eq!(eval("nil and 2;"), Value::Nil);
        assert_eq!(eval("1 and 2;"), Value::Number(2.0));
    }

    #[test]
    fn test_variable_shadowing_in_block() {
        assert_eq!(
            eval("var a = 1; { var a = 2; } a;"),
            Value::Number(1.0)
        );
    }

    #[test]
    fn test_undefined_variable_is_runtime_error() {
        let err = run("print missing;").unwrap_err();
        assert_eq!(err.message, "Undefined variable 'missing'.");
    }

    #[test]
    fn test_function_call_and_return() {
        assert_eq!(
            eval("fun add(a, b) { return a + b; } add(1, 2);"),
            Value::Number(3.0)
        );
    }

    #[test]
    fn test_function_without_return_yields_nil() {
        assert_eq!(eval("fun f() {} f();"), Value::Nil);
    }

    #[test]
    fn test_arity_mismatch() {
        let err = run("fun f(a) {} f(1, 2);").unwrap_err();
        assert_eq!(err.message, "Expected 1 arguments but got 2.");
    }

    #[test]
    fn test_calling_non_callable() {
        let err = run("var x; x();").unwrap_err();
        assert_eq!(err.message, "Can only call functions and classes.");
        assert_eq!(err.token.line, 1);
    }

    #[test]
    fn test_closure_captures_by_reference() {
        assert_eq!(
            eval(
                "fun makeCounter() { var n = 0; fun c() { n = n + 1; return n; } return c; } \
                 var c = makeCounter(); c(); c(); c();"
            ),
            Value::Number(3.0)
        );
    }

    #[test]
    fn test_sibling_closures_share_a_variable() {
        assert_eq!(
            eval(
                "fun make() { var n = 0; fun inc() { n = n + 1; } fun get() { return n; } \
                 inc(); inc(); return get; } make()();"
            ),
            Value::Number(2.0)
        );
    }

    #[test]
    fn test_instance_fields() {
        assert_eq!(
            eval("class P {} var p = P(); p.x = 42; p.x;"),
            Value::Number(42.0)
        );
    }

    #[test]
    fn test_initializer_sets_fields_and_returns_this() {
        assert_eq!(
            eval("class P { init(x) { this.x = x; } } P(42).x;"),
            Value::Number(42.0)
        );
    }

    #[test]
    fn test_initializer_bare_return_returns_this() {
        assert_eq!(
            eval(
                "class P { init() { this.x = 1; return; this.x = 2; } } P().x;"
            ),
            Value::Number(1.0)
        );
    }

    #[test]
    fn test_method_binds_this() {
        assert_eq!(
            eval("class A { m() { return this.v; } } var a = A(); a.v = 5; var m = a.m; m();"),
            Value::Number(5.0)
        );
    }

    #[test]
    fn test_inheritance_and_super() {
        assert_eq!(
            eval(
                "class A { hi() { return \"A\"; } } \
                 class B < A { hi() { return super.hi() + \"B\"; } } \
                 B().hi();"
            ),
            Value::string("AB")
        );
    }

    #[test]
    fn test_inherited_method_found_through_chain() {
        assert_eq!(
            eval("class A { m() { return 1; } } class B < A {} B().m();"),
            Value::Number(1.0)
        );
    }

    #[test]
    fn test_superclass_must_be_class() {
        let err = run("var A = 1; class B < A {}").unwrap_err();
        assert_eq!(err.message, "Superclass must be a class.");
    }

    #[test]
    fn test_undefined_property() {
        let err = run("class A {} A().missing;").unwrap_err();
        assert_eq!(err.message, "Undefined property 'missing'.");
    }

    #[test]
    fn test_property_on_non_instance() {
        let err = run("var x = 1; print x.y;").unwrap_err();
        assert_eq!(err.message, "Only instances have properties.");
        let err = run("var x = 1; x.y = 2;").unwrap_err();
        assert_eq!(err.message, "Only instances have fields.");
    }

    #[test]
    fn test_stack_overflow() {
        let err = run("fun r() { r(); } r();").unwrap_err();
        assert_eq!(err.message, "Stack overflow.");
    }

    #[test]
    fn test_while_loop_with_return() {
        assert_eq!(
            eval("fun f() { var i = 0; while (true) { i = i + 1; if (i == 3) return i; } } f();"),
            Value::Number(3.0)
        );
    }

    #[test]
    fn test_for_loop_desugaring_runs() {
        assert_eq!(
            eval("var sum = 0; for (var i = 1; i <= 4; i = i + 1) sum = sum + i; sum;"),
            Value::Number(10.0)
        );
    }

    #[test]
    fn test_uninitialized_var_is_nil() {
        assert_eq!(eval("var a; a;"), Value::Nil);
    }

    #[test]
    fn test_assignment_is_an_expression() {
        assert_eq!(eval("var a = 1; var b = a = 3; b;"), Value::Number(3.0));
    }
}
