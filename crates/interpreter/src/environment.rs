//! Lexical environments.
//!
//! An environment is a map of names to values plus a link to its enclosing
//! environment. Closures keep their defining environment alive past the
//! syntactic scope, so parents are shared (`Rc`) and the value map uses
//! interior mutability.
//!
//! Resolved lookups (`get_at`/`assign_at`) walk the parent chain exactly
//! `distance` links; unresolved names are handled by the interpreter
//! against the globals environment.

use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct Environment {
    values: RefCell<HashMap<String, Value>>,
    enclosing: Option<Rc<Environment>>,
}

impl Environment {
    pub fn new() -> Rc<Self> {
        Rc::new(Environment::default())
    }

    pub fn with_enclosing(enclosing: Rc<Environment>) -> Rc<Self> {
        Rc::new(Environment {
            values: RefCell::new(HashMap::new()),
            enclosing: Some(enclosing),
        })
    }

    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.values.borrow_mut().insert(name.into(), value);
    }

    /// Direct lookup in this environment only.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.borrow().get(name).cloned()
    }

    /// Direct assignment in this environment only; false if undefined here.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        match self.values.borrow_mut().get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn ancestor(self: &Rc<Self>, distance: usize) -> Rc<Environment> {
        let mut environment = Rc::clone(self);
        for _ in 0..distance {
            let parent = environment
                .enclosing
                .clone()
                .unwrap_or_else(|| Rc::clone(&environment));
            environment = parent;
        }
        environment
    }

    pub fn get_at(self: &Rc<Self>, distance: usize, name: &str) -> Option<Value> {
        self.ancestor(distance).get(name)
    }

    pub fn assign_at(self: &Rc<Self>, distance: usize, name: &str, value: Value) -> bool {
        self.ancestor(distance).assign(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_get() {
        let env = Environment::new();
        env.define("a", Value::Number(1.0));
        assert_eq!(env.get("a"), Some(Value::Number(1.0)));
        assert_eq!(env.get("b"), None);
    }

    #[test]
    fn test_get_at_walks_exactly_distance_links() {
        let grandparent = Environment::new();
        grandparent.define("x", Value::Number(1.0));
        let parent = Environment::with_enclosing(Rc::clone(&grandparent));
        parent.define("x", Value::Number(2.0));
        let child = Environment::with_enclosing(Rc::clone(&parent));
        child.define("x", Value::Number(3.0));

        assert_eq!(child.get_at(0, "x"), Some(Value::Number(3.0)));
        assert_eq!(child.get_at(1, "x"), Some(Value::Number(2.0)));
        assert_eq!(child.get_at(2, "x"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_assign_at_updates_the_right_scope() {
        let parent = Environment::new();
        parent.define("x", Value::Number(1.0));
        let child = Environment::with_enclosing(Rc::clone(&parent));

        assert!(child.assign_at(1, "x", Value::Number(9.0)));
        assert_eq!(parent.get("x"), Some(Value::Number(9.0)));
    }

    #[test]
    fn test_assign_undefined_fails() {
        let env = Environment::new();
        assert!(!env.assign("missing", Value::Nil));
    }

    #[test]
    fn test_shadowing_does_not_touch_parent() {
        let parent = Environment::new();
        parent.define("x", Value::Number(1.0));
        let child = Environment::with_enclosing(Rc::clone(&parent));
        child.define("x", Value::Number(2.0));

        assert!(child.assign("x", Value::Number(5.0)));
        assert_eq!(parent.get("x"), Some(Value::Number(1.0)));
    }
}
