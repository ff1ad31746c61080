//! Scalar span attributes and the shared global attribute set.
//!
//! The global set is copy-on-write: readers take a cheap `Arc` snapshot,
//! writers clone the map, apply their mutation and publish the new map in a
//! single critical section. A snapshot taken before a mutation never observes it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate encoded size, used for buffer accounting.
    pub fn encoded_len(&self) -> usize {
        match self {
            AttributeValue::Bool(_) => 1,
            AttributeValue::Int(_) | AttributeValue::Double(_) => 8,
            AttributeValue::String(s) => s.len(),
        }
    }

    /// JSON has no NaN or infinity, so non-finite doubles become their
    /// string form ("NaN", "inf", "-inf").
    pub fn normalized(self) -> Self {
        match self {
            AttributeValue::Double(d) if !d.is_finite() => AttributeValue::String(d.to_string()),
            other => other,
        }
    }
}

/// Apply `AttributeValue::normalized` to every value in place.
pub fn normalize_attributes(attrs: &mut Attributes) {
    for value in attrs.values_mut() {
        if matches!(value, AttributeValue::Double(d) if !d.is_finite()) {
            let taken = std::mem::replace(value, AttributeValue::Bool(false));
            *value = taken.normalized();
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Double(d) => write!(f, "{}", d),
            AttributeValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v).normalized()
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

/// Ordered attribute map carried by every span.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Process-wide attributes merged into every recorded span.
///
/// One instance per running agent, shared by handle.
#[derive(Debug, Default)]
pub struct GlobalAttributes {
    current: RwLock<Arc<Attributes>>,
}

impl GlobalAttributes {
    pub fn new(initial: Attributes) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Immutable view of the set as of now.
    pub fn snapshot(&self) -> Arc<Attributes> {
        Arc::clone(&self.current.read())
    }

    /// Apply `mutator` atomically. Concurrent updates are serialized, none is lost.
    pub fn update<F>(&self, mutator: F)
    where
        F: FnOnce(&mut Attributes),
    {
        let mut guard = self.current.write();
        let mut next = Attributes::clone(&guard);
        mutator(&mut next);
        *guard = Arc::new(next);
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let value = value.into();
        self.update(move |attrs| {
            attrs.insert(key, value);
        });
    }

    pub fn remove(&self, key: &str) {
        self.update(|attrs| {
            attrs.remove(key);
        });
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }
}
