// File: src/runtime/environment.rs
//
// Global binding environments. Each Env keeps var/let/const records with a
// parent link; lookups walk outward. An ExecutionContext pairs the lexical
// environment (let/const) with the variable environment (var) active during
// a call.

use crate::runtime::value::{Value, VmError, VmResult};
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingRecord {
    Var,
    Let,
    Const,
}

/// One environment frame: name -> (record kind, value)
#[derive(Default)]
pub struct Env {
    bindings: AHashMap<String, (BindingRecord, Value)>,
    parent: Option<Rc<RefCell<Env>>>,
}

impl Env {
    pub fn new() -> Rc<RefCell<Env>> {
        Rc::new(RefCell::new(Env::default()))
    }

    pub fn with_parent(parent: Rc<RefCell<Env>>) -> Rc<RefCell<Env>> {
        Rc::new(RefCell::new(Env { bindings: AHashMap::new(), parent: Some(parent) }))
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), (BindingRecord::Var, value));
    }

    pub fn set_let(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), (BindingRecord::Let, value));
    }

    pub fn set_const(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), (BindingRecord::Const, value));
    }

    /// Read a binding, walking parent environments
    pub fn get(env: &Rc<RefCell<Env>>, name: &str) -> Option<Value> {
        let mut cursor = Some(Rc::clone(env));
        while let Some(current) = cursor {
            let current = current.borrow();
            if let Some((_, value)) = current.bindings.get(name) {
                return Some(value.clone());
            }
            cursor = current.parent.clone();
        }
        None
    }

    /// Assign an existing binding, walking parent environments. Err when the
    /// binding is const; Ok(false) when it does not exist at all.
    pub fn assign(env: &Rc<RefCell<Env>>, name: &str, value: Value) -> VmResult<bool> {
        let mut cursor = Some(Rc::clone(env));
        while let Some(current) = cursor {
            let mut borrow = current.borrow_mut();
            if let Some((record, slot)) = borrow.bindings.get_mut(name) {
                if *record == BindingRecord::Const {
                    return Err(VmError::thrown(format!(
                        "Cannot assign to constant '{}'",
                        name
                    )));
                }
                *slot = value;
                return Ok(true);
            }
            let parent = borrow.parent.clone();
            drop(borrow);
            cursor = parent;
        }
        Ok(false)
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Env({} bindings)", self.bindings.len())
    }
}

/// The environment pair active during a call. Closures retain their
/// definition-site context.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub lexical_env: Rc<RefCell<Env>>,
    pub variable_env: Rc<RefCell<Env>>,
}

impl ExecutionContext {
    pub fn root() -> Self {
        Self { lexical_env: Env::new(), variable_env: Env::new() }
    }

    /// A fresh context whose environments chain to this one's
    pub fn child(&self) -> Self {
        Self {
            lexical_env: Env::with_parent(Rc::clone(&self.lexical_env)),
            variable_env: Env::with_parent(Rc::clone(&self.variable_env)),
        }
    }

    /// Lookup: lexical environment first, then the variable environment
    pub fn get(&self, name: &str) -> Option<Value> {
        Env::get(&self.lexical_env, name).or_else(|| Env::get(&self.variable_env, name))
    }

    /// Assignment targeting whichever environment holds the binding
    pub fn assign(&self, name: &str, value: Value) -> VmResult<bool> {
        if Env::assign(&self.lexical_env, name, value.clone())? {
            return Ok(true);
        }
        Env::assign(&self.variable_env, name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parents() {
        let root = Env::new();
        root.borrow_mut().set_var("x", Value::Number(1.0));
        let child = Env::with_parent(Rc::clone(&root));
        assert!(Env::get(&child, "x").unwrap().strict_equals(&Value::Number(1.0)));
        assert!(Env::get(&child, "y").is_none());
    }

    #[test]
    fn inner_bindings_shadow_outer() {
        let root = Env::new();
        root.borrow_mut().set_let("x", Value::Number(1.0));
        let child = Env::with_parent(Rc::clone(&root));
        child.borrow_mut().set_let("x", Value::Number(2.0));
        assert!(Env::get(&child, "x").unwrap().strict_equals(&Value::Number(2.0)));
    }

    #[test]
    fn assignment_updates_the_owning_env() {
        let root = Env::new();
        root.borrow_mut().set_let("x", Value::Number(1.0));
        let child = Env::with_parent(Rc::clone(&root));
        assert!(Env::assign(&child, "x", Value::Number(5.0)).unwrap());
        assert!(Env::get(&root, "x").unwrap().strict_equals(&Value::Number(5.0)));
    }

    #[test]
    fn const_bindings_reject_assignment() {
        let root = Env::new();
        root.borrow_mut().set_const("k", Value::Number(1.0));
        assert!(Env::assign(&root, "k", Value::Number(2.0)).is_err());
    }

    #[test]
    fn context_prefers_lexical_env() {
        let ctx = ExecutionContext::root();
        ctx.variable_env.borrow_mut().set_var("x", Value::Number(1.0));
        ctx.lexical_env.borrow_mut().set_let("x", Value::Number(2.0));
        assert!(ctx.get("x").unwrap().strict_equals(&Value::Number(2.0)));
    }
}
