//! Static resolution pass.
//!
//! Walks the parsed tree once, annotating every `Variable`, `Assign`,
//! `This` and `Super` expression with the number of lexical scopes between
//! the use and the definition. A use that resolves to no local scope is
//! left unannotated and must be found in globals at runtime.
//!
//! The same walk diagnoses scope errors: returns outside functions, value
//! returns inside initializers, `this`/`super` misuse, redeclaration in a
//! local scope, self-inheritance, and reading a local inside its own
//! initializer (caught by the two-step declare-then-define).

use crate::ast::*;
use crate::error::ErrorReporter;
use crate::token::Token;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassContext {
    None,
    Class,
    Subclass,
}

pub struct Resolver<'r> {
    /// Innermost scope last; a name maps to "is fully defined yet".
    scopes: Vec<HashMap<String, bool>>,
    current_function: Option<FunctionKind>,
    current_class: ClassContext,
    reporter: &'r mut ErrorReporter,
}

impl<'r> Resolver<'r> {
    pub fn new(reporter: &'r mut ErrorReporter) -> Self {
        Resolver {
            scopes: Vec::new(),
            current_function: None,
            current_class: ClassContext::None,
            reporter,
        }
    }

    pub fn resolve(&mut self, program: &Program) {
        for stmt in program {
            self.resolve_stmt(stmt);
        }
    }

    fn begin_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn end_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &Token) {
        if self.scopes.is_empty() {
            return;
        }
        let redeclared = self
            .scopes
            .last()
            .is_some_and(|scope| scope.contains_key(&name.lexeme));
        if redeclared {
            self.reporter
                .error_at(name, "Already a variable with this name in this scope.");
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.lexeme.clone(), false);
        }
    }

    fn define(&mut self, name: &Token) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.lexeme.clone(), true);
        }
    }

    fn resolve_local(&self, distance: &Distance, name: &Token) {
        for (depth, scope) in self.scopes.iter().rev().enumerate() {
            if scope.contains_key(&name.lexeme) {
                distance.set(Some(depth));
                return;
            }
        }
        // Not found locally: must be a global, left as None.
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expression(expr) | Stmt::Print(expr) => self.resolve_expr(expr),
            Stmt::Var(var) => {
                self.declare(&var.name);
                self.resolve_expr(&var.initializer);
                self.define(&var.name);
            }
            Stmt::Block(statements) => {
                self.begin_scope();
                for stmt in statements {
                    self.resolve_stmt(stmt);
                }
                self.end_scope();
            }
            Stmt::If(if_stmt) => {
                self.resolve_expr(&if_stmt.condition);
                self.resolve_stmt(&if_stmt.then_branch);
                if let Some(else_branch) = &if_stmt.else_branch {
                    self.resolve_stmt(else_branch);
                }
            }
            Stmt::While(while_stmt) => {
                self.resolve_expr(&while_stmt.condition);
                self.resolve_stmt(&while_stmt.body);
            }
            Stmt::Return(ret) => {
                if self.current_function.is_none() {
                    self.reporter
                        .error_at(&ret.keyword, "Can't return from top-level code.");
                } else if ret.expr.is_some()
                    && self.current_function == Some(FunctionKind::Initializer)
                {
                    self.reporter
                        .error_at(&ret.keyword, "Can't return a value from an initializer.");
                }
                if let Some(expr) = &ret.expr {
                    self.resolve_expr(expr);
                }
            }
            Stmt::Function(decl) => {
                self.declare(&decl.name);
                self.define(&decl.name);
                self.resolve_function(decl, FunctionKind::Function);
            }
            Stmt::Class(class) => self.resolve_class(class),
        }
    }

    fn resolve_function(&mut self, decl: &FunctionDecl, kind: FunctionKind) {
        decl.kind.set(kind);
        let enclosing = self.current_function.replace(kind);

        self.begin_scope();
        for param in &decl.parameters {
            self.declare(param);
            self.define(param);
        }
        for stmt in &decl.body {
            self.resolve_stmt(stmt);
        }
        self.end_scope();

        self.current_function = enclosing;
    }

    fn resolve_class(&mut self, class: &ClassStmt) {
        let enclosing = self.current_class;
        self.current_class = ClassContext::Class;

        self.declare(&class.name);
        self.define(&class.name);

        if let Some(superclass) = &class.superclass {
            if superclass.name.lexeme == class.name.lexeme {
                self.reporter
                    .error_at(&superclass.name, "A class can't inherit from itself.");
            }
            self.current_class = ClassContext::Subclass;
            self.resolve_variable(superclass);

            self.begin_scope();
            if let Some(scope) = self.scopes.last_mut() {
                scope.insert("super".to_string(), true);
            }
        }

        self.begin_scope();
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert("this".to_string(), true);
        }

        for method in &class.methods {
            let kind = if method.name.lexeme == "init" {
                FunctionKind::Initializer
            } else {
                FunctionKind::Method
            };
            self.resolve_function(method, kind);
        }

        self.end_scope();

        if class.superclass.is_some() {
            self.end_scope();
        }

        self.current_class = enclosing;
    }

    fn resolve_variable(&mut self, var: &VariableExpr) {
        if let Some(scope) = self.scopes.last() {
            if scope.get(&var.name.lexeme) == Some(&false) {
                self.reporter
                    .error_at(&var.name, "Can't read local variable in its own initializer.");
                return;
            }
        }
        self.resolve_local(&var.distance, &var.name);
    }

    fn resolve_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Binary(binary) => {
                self.resolve_expr(&binary.left);
                self.resolve_expr(&binary.right);
            }
            Expr::Unary(unary) => self.resolve_expr(&unary.expr),
            Expr::Grouping(inner) => self.resolve_expr(inner),
            Expr::Literal(_) => {}
            Expr::Logical(logical) => {
                self.resolve_expr(&logical.left);
                self.resolve_expr(&logical.right);
            }
            Expr::Variable(var) => self.resolve_variable(var),
            Expr::Assign(assign) => {
                self.resolve_expr(&assign.value);
                self.resolve_local(&assign.distance, &assign.name);
            }
            Expr::This(this) => {
                if self.current_class == ClassContext::None {
                    self.reporter
                        .error_at(&this.keyword, "Can't use 'this' outside of a class.");
                    return;
                }
                self.resolve_local(&this.distance, &this.keyword);
            }
            Expr::Super(sup) => {
                match self.current_class {
                    ClassContext::None => {
                        self.reporter
                            .error_at(&sup.keyword, "Can't use 'super' outside of a class.");
                    }
                    ClassContext::Class => {
                        self.reporter.error_at(
                            &sup.keyword,
                            "Can't use 'super' in a class with no superclass.",
                        );
                    }
                    ClassContext::Subclass => {}
                }
                self.resolve_local(&sup.distance, &sup.keyword);
            }
            Expr::Get(get) => self.resolve_expr(&get.object),
            Expr::Set(set) => {
                self.resolve_expr(&set.object);
                self.resolve_expr(&set.value);
            }
            Expr::Call(call) => {
                self.resolve_expr(&call.callee);
                for arg in &call.arguments {
                    self.resolve_expr(arg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::scanner::Scanner;

    fn resolve(source: &str) -> (Program, bool) {
        let mut reporter = ErrorReporter::new();
        let tokens = Scanner::new(source).scan_tokens(&mut reporter);
        let program = Parser::new(tokens, &mut reporter).parse();
        assert!(!reporter.had_error(), "parse should succeed");
        Resolver::new(&mut reporter).resolve(&program);
        (program, reporter.had_error())
    }

    fn first_function(program: &Program) -> &FunctionDecl {
        let Stmt::Function(decl) = &program[0] else {
            panic!("expected function declaration");
        };
        decl
    }

    #[test]
    fn test_local_distance_zero() {
        let (program, had_error) = resolve("fun f() { var a = 1; print a; }");
        assert!(!had_error);
        let decl = first_function(&program);
        let Stmt::Print(Expr::Variable(var)) = &decl.body[1] else {
            panic!("expected print of variable");
        };
        assert_eq!(var.distance.get(), Some(0));
    }

    #[test]
    fn test_distance_counts_block_scopes() {
        let (program, _) = resolve("fun f() { var a = 1; { { print a; } } }");
        let decl = first_function(&program);
        let Stmt::Block(inner) = &decl.body[1] else {
            panic!("expected block");
        };
        let Stmt::Block(innermost) = &inner[0] else {
            panic!("expected inner block");
        };
        let Stmt::Print(Expr::Variable(var)) = &innermost[0] else {
            panic!("expected print");
        };
        assert_eq!(var.distance.get(), Some(2));
    }

    #[test]
    fn test_global_stays_unresolved() {
        let (program, had_error) = resolve("var a = 1; fun f() { print a; }");
        assert!(!had_error);
        let Stmt::Function(decl) = &program[1] else {
            panic!("expected function");
        };
        let Stmt::Print(Expr::Variable(var)) = &decl.body[0] else {
            panic!("expected print");
        };
        assert_eq!(var.distance.get(), None);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut reporter = ErrorReporter::new();
        let tokens =
            Scanner::new("fun f() { var a = 1; { print a; } }").scan_tokens(&mut reporter);
        let program = Parser::new(tokens, &mut reporter).parse();
        Resolver::new(&mut reporter).resolve(&program);

        let collect = |program: &Program| -> Vec<Option<usize>> {
            let decl = first_function(program);
            let Stmt::Block(inner) = &decl.body[1] else {
                panic!("expected block");
            };
            let Stmt::Print(Expr::Variable(var)) = &inner[0] else {
                panic!("expected print");
            };
            vec![var.distance.get()]
        };

        let first = collect(&program);
        Resolver::new(&mut reporter).resolve(&program);
        assert_eq!(first, collect(&program));
    }

    #[test]
    fn test_top_level_return_is_error() {
        let (_, had_error) = resolve("return 1;");
        assert!(had_error);
    }

    #[test]
    fn test_value_return_in_initializer_is_error() {
        let (_, had_error) = resolve("class A { init() { return 1; } }");
        assert!(had_error);
    }

    #[test]
    fn test_bare_return_in_initializer_is_fine() {
        let (_, had_error) = resolve("class A { init() { return; } }");
        assert!(!had_error);
    }

    #[test]
    fn test_this_outside_class_is_error() {
        let (_, had_error) = resolve("print this;");
        assert!(had_error);
    }

    #[test]
    fn test_super_without_superclass_is_error() {
        let (_, had_error) = resolve("class A { m() { super.m(); } }");
        assert!(had_error);
    }

    #[test]
    fn test_super_outside_class_is_error() {
        let (_, had_error) = resolve("fun f() { super.m(); }");
        assert!(had_error);
    }

    #[test]
    fn test_redeclaration_in_same_scope_is_error() {
        let (_, had_error) = resolve("fun f() { var a = 1; var a = 2; }");
        assert!(had_error);
    }

    #[test]
    fn test_redeclaration_of_global_is_fine() {
        let (_, had_error) = resolve("var a = 1; var a = 2;");
        assert!(!had_error);
    }

    #[test]
    fn test_read_in_own_initializer_is_error() {
        let (_, had_error) = resolve("fun f() { var a = a; }");
        assert!(had_error);
    }

    #[test]
    fn test_self_inheritance_is_error() {
        let (_, had_error) = resolve("class A < A {}");
        assert!(had_error);
    }

    #[test]
    fn test_init_method_reclassified_as_initializer() {
        let (program, _) = resolve("class A { init() {} m() {} }");
        let Stmt::Class(class) = &program[0] else {
            panic!("expected class");
        };
        assert_eq!(class.methods[0].kind.get(), FunctionKind::Initializer);
        assert_eq!(class.methods[1].kind.get(), FunctionKind::Method);
    }

    #[test]
    fn test_this_resolves_to_class_scope() {
        let (program, _) = resolve("class A { m() { print this; } }");
        let Stmt::Class(class) = &program[0] else {
            panic!("expected class");
        };
        let Stmt::Print(Expr::This(this)) = &class.methods[0].body[0] else {
            panic!("expected print this");
        };
        // One function scope between the use and the class's `this` scope.
        assert_eq!(this.distance.get(), Some(1));
    }

    #[test]
    fn test_closure_capture_distance() {
        let (program, _) = resolve("fun outer() { var n = 0; fun inner() { print n; } }");
        let outer = first_function(&program);
        let Stmt::Function(inner) = &outer.body[1] else {
            panic!("expected nested function");
        };
        let Stmt::Print(Expr::Variable(var)) = &inner.body[0] else {
            panic!("expected print");
        };
        assert_eq!(var.distance.get(), Some(1));
    }
}
