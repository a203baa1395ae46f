//! Dynamic variable values and coercion to VM words.
//!
//! Clients exchange variables as self-describing dynamic values; the VM
//! on the node only knows flat arrays of 16-bit words. The broker
//! materializes the dynamic form here and coerces it at the node handle,
//! never at the endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// A dynamic value carried inside variable and event messages.
///
/// Serialized untagged, so each case maps onto the corresponding native
/// case of the self-describing wire encoding (bool, integer, float,
/// text, array, map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Human-readable name of the case, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Coerces the value to the node's VM representation: a flat list of
    /// 16-bit words.
    ///
    /// Booleans map to 0/1, integers and integral floats to single words,
    /// lists of scalars to word arrays. Strings and maps have no VM
    /// mapping and are rejected.
    pub fn to_vm_words(&self) -> Result<Vec<i16>, ValueError> {
        match self {
            Self::Bool(b) => Ok(vec![i16::from(*b)]),
            Self::Int(i) => Ok(vec![word_from_i64(*i)?]),
            Self::Float(f) => Ok(vec![word_from_f64(*f)?]),
            Self::List(items) => {
                let mut words = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Self::Bool(b) => words.push(i16::from(*b)),
                        Self::Int(i) => words.push(word_from_i64(*i)?),
                        Self::Float(f) => words.push(word_from_f64(*f)?),
                        other => return Err(ValueError::Unsupported(other.type_name())),
                    }
                }
                Ok(words)
            }
            Self::Str(_) | Self::Map(_) => Err(ValueError::Unsupported(self.type_name())),
        }
    }
}

fn word_from_i64(value: i64) -> Result<i16, ValueError> {
    i16::try_from(value).map_err(|_| ValueError::OutOfRange(value))
}

fn word_from_f64(value: f64) -> Result<i16, ValueError> {
    if value.fract() != 0.0 {
        return Err(ValueError::NotIntegral(value));
    }
    if value < f64::from(i16::MIN) || value > f64::from(i16::MAX) {
        return Err(ValueError::OutOfRange(value as i64));
    }
    Ok(value as i16)
}

/// A node variable: a value plus its constness flag.
///
/// Constants are reported by the node description and cannot be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub value: Value,
    #[serde(default)]
    pub constant: bool,
}

impl Variable {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            constant: false,
        }
    }

    pub fn constant(value: Value) -> Self {
        Self {
            value,
            constant: true,
        }
    }
}

/// Named variables of a node.
pub type VariableMap = BTreeMap<String, Variable>;

/// Named event payloads, as emitted by clients or nodes.
pub type EventMap = BTreeMap<String, Value>;
