//! Callable runtime objects: user functions, classes, instances, natives.

use crate::environment::Environment;
use crate::error::RuntimeError;
use crate::value::Value;
use lox_frontend::ast::{FunctionDecl, FunctionKind};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A user-defined function or method: the shared declaration plus the
/// environment it closed over.
pub struct LoxFunction {
    pub declaration: Rc<FunctionDecl>,
    pub closure: Rc<Environment>,
}

impl LoxFunction {
    pub fn new(declaration: Rc<FunctionDecl>, closure: Rc<Environment>) -> Rc<Self> {
        Rc::new(LoxFunction {
            declaration,
            closure,
        })
    }

    pub fn name(&self) -> &str {
        &self.declaration.name.lexeme
    }

    pub fn arity(&self) -> usize {
        self.declaration.parameters.len()
    }

    pub fn is_initializer(&self) -> bool {
        self.declaration.kind.get() == FunctionKind::Initializer
    }

    /// Produce the bound form of a method: same declaration, with a fresh
    /// environment defining `this` in front of the closure.
    pub fn bind(&self, instance: Value) -> Rc<LoxFunction> {
        let environment = Environment::with_enclosing(Rc::clone(&self.closure));
        environment.define("this", instance);
        LoxFunction::new(Rc::clone(&self.declaration), environment)
    }
}

pub struct LoxClass {
    pub name: String,
    pub superclass: Option<Rc<LoxClass>>,
    pub methods: HashMap<String, Rc<LoxFunction>>,
}

impl LoxClass {
    /// Look up a method on this class or any superclass.
    pub fn find_method(&self, name: &str) -> Option<Rc<LoxFunction>> {
        if let Some(method) = self.methods.get(name) {
            return Some(Rc::clone(method));
        }
        self.superclass
            .as_ref()
            .and_then(|superclass| superclass.find_method(name))
    }

    /// Constructor arity is `init`'s arity, or zero without one.
    pub fn arity(&self) -> usize {
        self.find_method("init").map_or(0, |init| init.arity())
    }
}

pub struct LoxInstance {
    pub class: Rc<LoxClass>,
    pub fields: RefCell<HashMap<String, Value>>,
}

impl LoxInstance {
    pub fn new(class: Rc<LoxClass>) -> Rc<Self> {
        Rc::new(LoxInstance {
            class,
            fields: RefCell::new(HashMap::new()),
        })
    }
}

type NativeFn = Box<dyn Fn(&[Value]) -> Result<Value, RuntimeError>>;

/// A built-in function implemented in the host.
pub struct NativeFunction {
    pub arity: usize,
    function: NativeFn,
}

impl NativeFunction {
    pub fn new(
        arity: usize,
        function: impl Fn(&[Value]) -> Result<Value, RuntimeError> + 'static,
    ) -> Rc<Self> {
        Rc::new(NativeFunction {
            arity,
            function: Box::new(function),
        })
    }

    pub fn call(&self, arguments: &[Value]) -> Result<Value, RuntimeError> {
        (self.function)(arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, superclass: Option<Rc<LoxClass>>) -> Rc<LoxClass> {
        Rc::new(LoxClass {
            name: name.to_string(),
            superclass,
            methods: HashMap::new(),
        })
    }

    #[test]
    fn test_find_method_walks_superclass_chain() {
        use lox_frontend::ast::FunctionKind;
        use lox_frontend::token::{Literal, Token, TokenKind};
        use std::cell::Cell;

        let decl = Rc::new(FunctionDecl {
            name: Token::new(TokenKind::Identifier, "hi", Literal::None, 1),
            parameters: vec![],
            body: vec![],
            kind: Cell::new(FunctionKind::Method),
        });
        let method = LoxFunction::new(decl, Environment::new());

        let mut methods = HashMap::new();
        methods.insert("hi".to_string(), method);
        let base = Rc::new(LoxClass {
            name: "A".to_string(),
            superclass: None,
            methods,
        });
        let derived = class("B", Some(Rc::clone(&base)));

        assert!(derived.find_method("hi").is_some());
        assert!(derived.find_method("missing").is_none());
    }

    #[test]
    fn test_class_arity_defaults_to_zero() {
        assert_eq!(class("A", None).arity(), 0);
    }

    #[test]
    fn test_native_function_call() {
        let native = NativeFunction::new(1, |args| Ok(args[0].clone()));
        let result = native.call(&[Value::Number(4.0)]);
        assert_eq!(result.ok(), Some(Value::Number(4.0)));
    }
}
