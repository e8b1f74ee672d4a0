//! Dynamically shaped values
//!
//! This module defines the runtime representation of values living in a
//! scope's object graph. Objects are shared (`Arc`) and interior-mutable; their
//! contents are one of three shapes, each with its own put/set/delete
//! semantics:
//!
//! - [`Shape::Array`] - dense list addressed by index strings
//! - [`Shape::Record`] - open string-keyed property map
//! - [`Shape::Scope`] - the property map backing a [`Scope`](crate::scope::Scope)
//!
//! Mutating a shape directly never raises change events; go through
//! [`ObservationEngine`](crate::observe::ObservationEngine) for that.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};
use rustc_hash::FxHashSet;
use serde_json::{Map, Number};

use crate::error::{Error, Result};
use crate::identity::{IdentityMap, ObjectId};

/// Reserved record field carrying an object's id on the wire
pub const ID_FIELD: &str = "$id";

/// Reserved record field marking a back-reference to an already emitted object
pub const REF_FIELD: &str = "$ref";

/// How many slots past the current end an array write may reach
pub const MAX_ARRAY_GAP: usize = 1024;

/// Shared handle to an object
pub type ObjectRef = Arc<ObservedObject>;

/// A value in a scope's object graph
#[derive(Clone, Default)]
pub enum Value {
    /// undefined (absent)
    #[default]
    Undefined,
    /// null
    Null,
    /// Boolean value
    Boolean(bool),
    /// Number (IEEE 754 double)
    Number(f64),
    /// String
    String(String),
    /// Array, record or scope object
    Object(ObjectRef),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Check if value is nullish (null or undefined)
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Create a fresh, unobserved record
    pub fn new_record(properties: impl IntoIterator<Item = (String, Value)>) -> Value {
        let obj = ObservedObject::record();
        {
            let mut shape = obj.shape();
            if let Shape::Record(map) = &mut *shape {
                map.extend(properties);
            }
        }
        Value::Object(obj)
    }

    /// Create a fresh, unobserved array
    pub fn new_array(elements: Vec<Value>) -> Value {
        Value::Object(ObservedObject::array(elements))
    }

    /// Identity-aware equality: primitives by value (NaN equals NaN), objects by reference
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Encode for the wire. Observed objects carry their id (trailing element
    /// for arrays, [`ID_FIELD`] for records); an object met twice in one
    /// encoding is written as a [`REF_FIELD`] stub.
    pub fn to_json(&self) -> serde_json::Value {
        let mut seen = FxHashSet::default();
        encode(self, &mut seen)
    }

    /// Encode without ids or reference stubs. Cycles encode as `null`.
    pub fn to_plain_json(&self) -> serde_json::Value {
        let mut stack = FxHashSet::default();
        encode_plain(self, &mut stack)
    }

    /// Decode a client-supplied value into fresh, unobserved objects.
    ///
    /// Id fields are stripped. A `{"$ref": id}` stub resolves through
    /// `identities` when one is given, otherwise it decodes as `null`.
    pub fn from_json(json: &serde_json::Value, identities: Option<&IdentityMap>) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::new_array(
                items.iter().map(|item| Value::from_json(item, identities)).collect(),
            ),
            serde_json::Value::Object(map) => {
                if let Some(target) = reference_target(map) {
                    return identities
                        .and_then(|ids| ids.resolve(target))
                        .map(Value::Object)
                        .unwrap_or(Value::Null);
                }
                Value::new_record(
                    map.iter()
                        .filter(|(k, _)| k.as_str() != ID_FIELD)
                        .map(|(k, v)| (k.clone(), Value::from_json(v, identities))),
                )
            }
        }
    }
}

/// Id named by a `{"$ref": n}` stub, if `map` is one
pub(crate) fn reference_target(map: &Map<String, serde_json::Value>) -> Option<ObjectId> {
    if map.len() != 1 {
        return None;
    }
    map.get(REF_FIELD).and_then(|v| v.as_u64()).map(ObjectId)
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        serde_json::Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

fn encode(value: &Value, seen: &mut FxHashSet<ObjectId>) -> serde_json::Value {
    let obj = match value {
        Value::Object(obj) => obj,
        other => return encode_primitive(other),
    };
    if !obj.is_observed() {
        return encode_plain(value, &mut FxHashSet::default());
    }
    let id = obj.id();
    if !seen.insert(id) {
        let mut stub = Map::new();
        stub.insert(REF_FIELD.to_string(), serde_json::Value::from(id.0));
        return serde_json::Value::Object(stub);
    }
    match obj.snapshot() {
        Shape::Array(items) => {
            let mut out: Vec<_> = items.iter().map(|v| encode(v, seen)).collect();
            out.push(serde_json::Value::from(id.0));
            serde_json::Value::Array(out)
        }
        Shape::Record(props) | Shape::Scope(props) => {
            let mut out: Map<_, _> = props
                .iter()
                .filter(|(_, v)| !v.is_undefined())
                .map(|(k, v)| (k.clone(), encode(v, seen)))
                .collect();
            out.insert(ID_FIELD.to_string(), serde_json::Value::from(id.0));
            serde_json::Value::Object(out)
        }
    }
}

fn encode_plain(value: &Value, stack: &mut FxHashSet<usize>) -> serde_json::Value {
    let obj = match value {
        Value::Object(obj) => obj,
        other => return encode_primitive(other),
    };
    let addr = Arc::as_ptr(obj) as usize;
    if !stack.insert(addr) {
        return serde_json::Value::Null;
    }
    let out = match obj.snapshot() {
        Shape::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| encode_plain(v, stack)).collect())
        }
        Shape::Record(props) | Shape::Scope(props) => serde_json::Value::Object(
            props
                .iter()
                .filter(|(_, v)| !v.is_undefined())
                .map(|(k, v)| (k.clone(), encode_plain(v, stack)))
                .collect(),
        ),
    };
    stack.remove(&addr);
    out
}

fn encode_primitive(value: &Value) -> serde_json::Value {
    match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => number_to_json(*n),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Object(_) => serde_json::Value::Null,
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Object(obj) => write!(f, "{:?}", obj),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

/// Which of the three shapes an object has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Array,
    Record,
    Scope,
}

/// Contents of an object
#[derive(Clone, Debug)]
pub enum Shape {
    Array(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Scope(BTreeMap<String, Value>),
}

/// Outcome of applying a write or removal to a shape
#[derive(Debug, Clone)]
pub enum Mutation {
    /// The key held no value before
    Put,
    /// The key held a different value
    Set { old: Value },
    /// The key's value was removed
    Delete { old: Value },
    /// Nothing changed
    Unchanged,
}

fn parse_index(key: &str) -> Result<usize> {
    key.parse::<usize>()
        .map_err(|_| Error::type_error(format!("'{}' is not an array index", key)))
}

/// Length an array of `len` elements needs so that `idx` is in bounds.
/// Writes more than [`MAX_ARRAY_GAP`] slots past the end are refused.
pub(crate) fn padded_len(len: usize, idx: usize) -> Result<usize> {
    idx.checked_add(1)
        .filter(|&end| end <= len.saturating_add(MAX_ARRAY_GAP))
        .map(|end| end.max(len))
        .ok_or_else(|| {
            Error::range_error(format!("index {} is too far past the end of an array of {}", idx, len))
        })
}

impl Shape {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Shape::Array(_) => ShapeKind::Array,
            Shape::Record(_) => ShapeKind::Record,
            Shape::Scope(_) => ShapeKind::Scope,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Shape::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx))
                .filter(|v| !v.is_undefined())
                .cloned(),
            Shape::Record(props) | Shape::Scope(props) => props.get(key).cloned(),
        }
    }

    /// User-visible keys in enumeration order
    pub fn keys(&self) -> Vec<String> {
        match self {
            Shape::Array(items) => items
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_undefined())
                .map(|(i, _)| i.to_string())
                .collect(),
            Shape::Record(props) | Shape::Scope(props) => props.keys().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Shape::Array(items) => items.len(),
            Shape::Record(props) | Shape::Scope(props) => props.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every object directly referenced by this shape
    pub fn children(&self) -> Vec<ObjectRef> {
        let values: Box<dyn Iterator<Item = &Value>> = match self {
            Shape::Array(items) => Box::new(items.iter()),
            Shape::Record(props) | Shape::Scope(props) => Box::new(props.values()),
        };
        values.filter_map(|v| v.as_object().cloned()).collect()
    }

    /// Write `value` under `key`, classifying the change
    pub fn write(&mut self, key: &str, value: Value) -> Result<Mutation> {
        match self {
            Shape::Array(items) => {
                let idx = parse_index(key)?;
                let len = padded_len(items.len(), idx)?;
                items.resize(len, Value::Undefined);
                let slot = &mut items[idx];
                if slot.is_undefined() {
                    *slot = value;
                    Ok(Mutation::Put)
                } else if slot.same_value(&value) {
                    Ok(Mutation::Unchanged)
                } else {
                    let old = std::mem::replace(slot, value);
                    Ok(Mutation::Set { old })
                }
            }
            Shape::Record(props) | Shape::Scope(props) => match props.get_mut(key) {
                None => {
                    props.insert(key.to_string(), value);
                    Ok(Mutation::Put)
                }
                Some(slot) if slot.same_value(&value) => Ok(Mutation::Unchanged),
                Some(slot) => {
                    let old = std::mem::replace(slot, value);
                    Ok(Mutation::Set { old })
                }
            },
        }
    }

    /// Remove `key`.
    ///
    /// Arrays: index 0 shifts, the last index pops, any other index leaves a
    /// hole that is then compacted away along with every other nullish slot.
    pub fn remove(&mut self, key: &str) -> Result<Mutation> {
        match self {
            Shape::Array(items) => {
                let idx = parse_index(key)?;
                if idx >= items.len() || items[idx].is_undefined() {
                    return Ok(Mutation::Unchanged);
                }
                let old = if idx == 0 {
                    items.remove(0)
                } else if idx == items.len() - 1 {
                    items.pop().unwrap_or_default()
                } else {
                    let old = std::mem::take(&mut items[idx]);
                    items.retain(|v| !v.is_nullish());
                    old
                };
                Ok(Mutation::Delete { old })
            }
            Shape::Record(props) | Shape::Scope(props) => Ok(props
                .remove(key)
                .map(|old| Mutation::Delete { old })
                .unwrap_or(Mutation::Unchanged)),
        }
    }
}

/// An object that can be observed for property changes
pub struct ObservedObject {
    id: OnceLock<ObjectId>,
    observed: AtomicBool,
    shape: Mutex<Shape>,
    gate: ReentrantMutex<()>,
}

impl ObservedObject {
    pub fn new(shape: Shape) -> ObjectRef {
        Arc::new(Self {
            id: OnceLock::new(),
            observed: AtomicBool::new(false),
            shape: Mutex::new(shape),
            gate: ReentrantMutex::new(()),
        })
    }

    pub fn record() -> ObjectRef {
        Self::new(Shape::Record(BTreeMap::new()))
    }

    pub fn array(elements: Vec<Value>) -> ObjectRef {
        Self::new(Shape::Array(elements))
    }

    pub(crate) fn scope_backing() -> ObjectRef {
        Self::new(Shape::Scope(BTreeMap::new()))
    }

    /// The object's identity, assigned on first request and stable afterwards
    pub fn id(&self) -> ObjectId {
        *self.id.get_or_init(ObjectId::next)
    }

    pub fn is_observed(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    /// Set the observed flag, returning its previous value
    pub(crate) fn swap_observed(&self, observed: bool) -> bool {
        self.observed.swap(observed, Ordering::AcqRel)
    }

    pub fn kind(&self) -> ShapeKind {
        self.shape.lock().kind()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.shape.lock().get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.shape.lock().keys()
    }

    /// Whether `key` holds an object backing a scope
    pub fn holds_scope(&self, key: &str) -> bool {
        self.get(key)
            .and_then(|value| value.as_object().map(|obj| obj.kind() == ShapeKind::Scope))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.shape.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shallow copy of the current contents
    pub fn snapshot(&self) -> Shape {
        self.shape.lock().clone()
    }

    /// Direct access to the contents. Changes made through the guard are not
    /// observed; hold it only briefly.
    pub fn shape(&self) -> MutexGuard<'_, Shape> {
        self.shape.lock()
    }

    /// Serialize invocations on this object. Re-entrant on the same thread.
    pub fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        self.gate.lock()
    }
}

impl fmt::Debug for ObservedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.get().map(|id| id.to_string()).unwrap_or_else(|| "#?".into());
        write!(f, "{:?}{}", self.kind(), id)
    }
}
