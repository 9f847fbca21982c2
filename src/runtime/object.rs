// File: src/runtime/object.rs
//
// Object, Array and Class property storage. An Object keeps three keyed maps
// (var/let/const), each entry carrying its modifier set; an Array has-a
// Object plus ordered numeric slots; a Class keeps static and
// instance-prototype tables and a superclass link.

use crate::runtime::value::{number_to_string, Value, VmError, VmResult};
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

pub const CONSTRUCTOR: &str = "constructor";

/// Modifier set of one property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub public: bool,
    pub protected: bool,
    pub private: bool,
    pub is_static: bool,
}

impl Modifiers {
    pub fn public() -> Self {
        Self { public: true, ..Default::default() }
    }

    pub fn private() -> Self {
        Self { private: true, ..Default::default() }
    }

    pub fn protected() -> Self {
        Self { protected: true, ..Default::default() }
    }

    pub fn with_static(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// One property slot: value plus its modifier set
#[derive(Debug, Clone)]
pub struct PropertySlot {
    pub modifiers: Modifiers,
    pub value: Value,
}

/// Which of the three maps a property lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Var,
    Let,
    Const,
}

/// A keyed property owner. A name appears in at most one of the three maps.
#[derive(Default)]
pub struct Object {
    var_props: AHashMap<String, PropertySlot>,
    let_props: AHashMap<String, PropertySlot>,
    const_props: AHashMap<String, PropertySlot>,
    /// First-insertion order of property names, for stable enumeration
    insertion_order: Vec<String>,
    /// Object literals allow assignment to create new slots
    is_object_literal: bool,
    /// Weak back-reference to the class this object was constructed from
    pub class: Option<std::rc::Weak<RefCell<Class>>>,
    /// Prototype link: the instance of the superclass chain
    pub parent_object: Option<Rc<RefCell<Object>>>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn literal() -> Self {
        Self { is_object_literal: true, ..Default::default() }
    }

    pub fn is_literal(&self) -> bool {
        self.is_object_literal
    }

    pub fn class_of(&self) -> Option<Rc<RefCell<Class>>> {
        self.class.as_ref().and_then(|weak| weak.upgrade())
    }

    pub fn property_count(&self) -> usize {
        self.var_props.len() + self.let_props.len() + self.const_props.len()
    }

    fn note_insertion(&mut self, key: &str) {
        if !self.insertion_order.iter().any(|existing| existing == key) {
            self.insertion_order.push(key.to_string());
        }
    }

    /// Keys in first-insertion order
    pub fn keys(&self) -> Vec<String> {
        self.insertion_order
            .iter()
            .filter(|key| self.lookup(key).is_some())
            .cloned()
            .collect()
    }

    pub fn lookup(&self, key: &str) -> Option<&PropertySlot> {
        self.var_props
            .get(key)
            .or_else(|| self.let_props.get(key))
            .or_else(|| self.const_props.get(key))
    }

    pub fn modifiers_of(&self, key: &str) -> Option<Modifiers> {
        self.lookup(key).map(|slot| slot.modifiers)
    }

    /// Own-property read; Undefined when absent
    pub fn get_own(&self, key: &str) -> Option<Value> {
        self.lookup(key).map(|slot| slot.value.clone())
    }

    /// Define a property in the map selected by `kind`, replacing any
    /// previous slot of the same name.
    pub fn define(&mut self, key: &str, value: Value, kind: SlotKind, modifiers: Modifiers) {
        self.var_props.remove(key);
        self.let_props.remove(key);
        self.const_props.remove(key);
        let slot = PropertySlot { modifiers, value };
        match kind {
            SlotKind::Var => self.var_props.insert(key.to_string(), slot),
            SlotKind::Let => self.let_props.insert(key.to_string(), slot),
            SlotKind::Const => self.const_props.insert(key.to_string(), slot),
        };
        self.note_insertion(key);
    }

    /// Assign an existing property, or create one on object literals.
    /// Assigning an initialised const slot fails.
    pub fn assign(&mut self, key: &str, value: Value) -> VmResult<()> {
        if self.const_props.contains_key(key) {
            return Err(VmError::thrown(format!(
                "Cannot assign to constant property '{}'",
                key
            )));
        }
        if let Some(slot) = self.var_props.get_mut(key) {
            slot.value = value;
            return Ok(());
        }
        if let Some(slot) = self.let_props.get_mut(key) {
            slot.value = value;
            return Ok(());
        }
        if self.is_object_literal {
            self.define(key, value, SlotKind::Var, Modifiers::public());
            return Ok(());
        }
        Err(VmError::thrown(format!("Cannot create property '{}' on object", key)))
    }

    /// Deleting a property assigns Undefined to its slot
    pub fn delete(&mut self, key: &str) -> bool {
        if let Some(slot) = self.var_props.get_mut(key) {
            slot.value = Value::Undefined;
            return true;
        }
        if let Some(slot) = self.let_props.get_mut(key) {
            slot.value = Value::Undefined;
            return true;
        }
        false
    }

    /// All readable properties, in insertion order
    pub fn all_properties(&self) -> Vec<(String, Value)> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get_own(&key).map(|value| (key, value)))
            .collect()
    }

    /// Whether `key` exists on this object or anywhere up its prototype chain
    pub fn has_property(&self, key: &str) -> bool {
        if self.lookup(key).is_some() {
            return true;
        }
        match &self.parent_object {
            Some(parent) => parent.borrow().has_property(key),
            None => false,
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Object({} props)", self.property_count())
    }
}

/// An Array extends Object with numeric-string keys and a cached length.
#[derive(Default, Debug)]
pub struct Array {
    pub object: Object,
    length: usize,
}

impl Array {
    pub fn new() -> Self {
        Self { object: Object::literal(), length: 0 }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        let mut arr = Self::new();
        for value in values {
            arr.push(value);
        }
        arr
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn push(&mut self, value: Value) {
        let key = self.length.to_string();
        self.object.define(&key, value, SlotKind::Var, Modifiers::public());
        self.length += 1;
    }

    pub fn pop(&mut self) -> Value {
        if self.length == 0 {
            return Value::Undefined;
        }
        self.length -= 1;
        let key = self.length.to_string();
        let value = self.object.get_own(&key).unwrap_or(Value::Undefined);
        self.object.delete(&key);
        value
    }

    pub fn get_index(&self, index: usize) -> Value {
        self.object.get_own(&index.to_string()).unwrap_or(Value::Undefined)
    }

    /// Keyed read; "length" resolves to the cached length
    pub fn get(&self, key: &str) -> Value {
        if key == "length" {
            return Value::Number(self.length as f64);
        }
        self.object.get_own(key).unwrap_or(Value::Undefined)
    }

    /// Keyed write. Numeric keys extend the length to `max(index)+1`.
    pub fn set(&mut self, key: &str, value: Value) {
        self.object.define(key, value, SlotKind::Var, Modifiers::public());
        if let Ok(index) = key.parse::<usize>() {
            if index + 1 > self.length {
                self.length = index + 1;
            }
        }
    }

    pub fn values(&self) -> Vec<Value> {
        (0..self.length).map(|i| self.get_index(i)).collect()
    }

    /// Enumerable keys: numeric indices first, then other insertion-ordered
    /// properties.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = (0..self.length).map(|i| number_to_string(i as f64)).collect();
        for key in self.object.keys() {
            if key.parse::<usize>().is_err() {
                keys.push(key);
            }
        }
        keys
    }
}

/// Property tables of one class
#[derive(Default)]
pub struct Class {
    pub name: String,
    pub super_class: Option<Rc<RefCell<Class>>>,
    /// Static properties (methods live in the var table)
    pub static_var_props: AHashMap<String, PropertySlot>,
    pub static_const_props: AHashMap<String, PropertySlot>,
    /// Instance-prototype properties; methods are closures, plain fields are
    /// initialiser-thunk indices into the module constant pool
    pub proto_var_props: AHashMap<String, PropertySlot>,
    pub proto_const_props: AHashMap<String, PropertySlot>,
    proto_order: Vec<String>,
    pub is_native: bool,
}

impl Class {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn set_static_var(&mut self, key: &str, value: Value, modifiers: Modifiers) {
        self.static_var_props
            .insert(key.to_string(), PropertySlot { modifiers: modifiers.with_static(), value });
    }

    pub fn set_static_const(&mut self, key: &str, value: Value, modifiers: Modifiers) {
        self.static_const_props
            .insert(key.to_string(), PropertySlot { modifiers: modifiers.with_static(), value });
    }

    pub fn set_proto_var(&mut self, key: &str, value: Value, modifiers: Modifiers) {
        if !self.proto_order.iter().any(|existing| existing == key) {
            self.proto_order.push(key.to_string());
        }
        self.proto_var_props.insert(key.to_string(), PropertySlot { modifiers, value });
    }

    pub fn set_proto_const(&mut self, key: &str, value: Value, modifiers: Modifiers) {
        if !self.proto_order.iter().any(|existing| existing == key) {
            self.proto_order.push(key.to_string());
        }
        self.proto_const_props.insert(key.to_string(), PropertySlot { modifiers, value });
    }

    /// Prototype entries in declaration order, with the map they came from
    pub fn proto_entries(&self) -> Vec<(String, PropertySlot, SlotKind)> {
        let mut entries = Vec::new();
        for key in &self.proto_order {
            if let Some(slot) = self.proto_var_props.get(key) {
                entries.push((key.clone(), slot.clone(), SlotKind::Var));
            } else if let Some(slot) = self.proto_const_props.get(key) {
                entries.push((key.clone(), slot.clone(), SlotKind::Const));
            }
        }
        entries
    }

    pub fn has_own_constructor(&self) -> bool {
        self.proto_var_props.contains_key(CONSTRUCTOR)
    }

    /// Static lookup walking this class then its superclass chain
    pub fn get_static(&self, key: &str) -> Option<(Value, Modifiers)> {
        if let Some(slot) = self.static_var_props.get(key).or_else(|| self.static_const_props.get(key))
        {
            return Some((slot.value.clone(), slot.modifiers));
        }
        match &self.super_class {
            Some(parent) => parent.borrow().get_static(key),
            None => None,
        }
    }

    /// Whether `key` is a static or prototype member of this class or any
    /// superclass
    pub fn has_member(&self, key: &str) -> bool {
        if self.static_var_props.contains_key(key)
            || self.static_const_props.contains_key(key)
            || self.proto_var_props.contains_key(key)
            || self.proto_const_props.contains_key(key)
        {
            return true;
        }
        match &self.super_class {
            Some(parent) => parent.borrow().has_member(key),
            None => false,
        }
    }

    /// Static keys of this class only
    pub fn static_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.static_var_props.keys().cloned().collect();
        keys.extend(self.static_const_props.keys().cloned());
        keys.sort();
        keys
    }

    /// True when `other` is this class or one of its ancestors
    pub fn derives_from(this: &Rc<RefCell<Class>>, other: &Rc<RefCell<Class>>) -> bool {
        let mut cursor = Some(Rc::clone(this));
        while let Some(current) = cursor {
            if Rc::ptr_eq(&current, other) {
                return true;
            }
            cursor = current.borrow().super_class.clone();
        }
        false
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Class({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_name_lives_in_one_map() {
        let mut obj = Object::new();
        obj.define("x", Value::Number(1.0), SlotKind::Var, Modifiers::public());
        obj.define("x", Value::Number(2.0), SlotKind::Const, Modifiers::public());
        assert!(obj.get_own("x").unwrap().strict_equals(&Value::Number(2.0)));
        assert_eq!(obj.property_count(), 1);
    }

    #[test]
    fn const_property_rejects_reassignment() {
        let mut obj = Object::new();
        obj.define("k", Value::Number(1.0), SlotKind::Const, Modifiers::public());
        assert!(obj.assign("k", Value::Number(2.0)).is_err());
    }

    #[test]
    fn literal_objects_create_on_assign() {
        let mut literal = Object::literal();
        assert!(literal.assign("fresh", Value::Number(1.0)).is_ok());
        let mut plain = Object::new();
        assert!(plain.assign("fresh", Value::Number(1.0)).is_err());
    }

    #[test]
    fn delete_assigns_undefined() {
        let mut obj = Object::literal();
        obj.assign("x", Value::Number(5.0)).unwrap();
        assert!(obj.delete("x"));
        assert!(obj.get_own("x").unwrap().strict_equals(&Value::Undefined));
    }

    #[test]
    fn object_keys_preserve_insertion_order() {
        let mut obj = Object::literal();
        obj.assign("a", Value::Number(1.0)).unwrap();
        obj.assign("b", Value::Number(2.0)).unwrap();
        obj.assign("c", Value::Number(3.0)).unwrap();
        obj.assign("b", Value::Number(9.0)).unwrap();
        assert_eq!(obj.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn array_length_tracks_highest_index() {
        let mut arr = Array::new();
        arr.push(Value::Number(1.0));
        arr.set("5", Value::Number(6.0));
        assert_eq!(arr.len(), 6);
        assert!(arr.get("length").strict_equals(&Value::Number(6.0)));
        assert!(arr.get_index(3).strict_equals(&Value::Undefined));
    }

    #[test]
    fn array_pop_decrements_length() {
        let mut arr = Array::from_values(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert!(arr.pop().strict_equals(&Value::Number(2.0)));
        assert_eq!(arr.len(), 1);
        assert!(arr.pop().strict_equals(&Value::Number(1.0)));
        assert!(arr.pop().strict_equals(&Value::Undefined));
    }

    #[test]
    fn class_derivation_walks_superclass_chain() {
        let base = Rc::new(RefCell::new(Class::new("Base")));
        let mut mid = Class::new("Mid");
        mid.super_class = Some(Rc::clone(&base));
        let mid = Rc::new(RefCell::new(mid));
        let mut leaf = Class::new("Leaf");
        leaf.super_class = Some(Rc::clone(&mid));
        let leaf = Rc::new(RefCell::new(leaf));

        assert!(Class::derives_from(&leaf, &base));
        assert!(Class::derives_from(&leaf, &leaf));
        assert!(!Class::derives_from(&base, &leaf));
    }
}
