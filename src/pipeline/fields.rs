//! Per-stage named configuration ("fields").
//!
//! Fields are written through the stage builder and frozen behind an `Arc`
//! when the stage starts, so every instance reads the same immutable store
//! without locking.
//!
//! Structured values are stored as a `serde_json::Value` snapshot taken at
//! insertion time. Decoding always produces a fresh owned value, so neither
//! the caller's original nor any decoded copy can alias the stored field.

use crate::pipeline::error::{PipelineError, PipelineResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single field value.
///
/// Integers are stored as `i64`. Every signed type and the unsigned types up to
/// `u32` convert with `From`; `u64` and `usize` go through `TryFrom` and fail
/// when the value exceeds `i64::MAX`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Object(serde_json::Value),
}

impl FieldValue {
    /// Snapshot any serializable value as an `Object` field.
    pub fn object<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(FieldValue::Object)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::String(_) => "string",
            FieldValue::Object(_) => "object",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            FieldValue::Object(value) => T::deserialize(value),
            FieldValue::Bool(v) => T::deserialize(serde_json::Value::from(*v)),
            FieldValue::Int(v) => T::deserialize(serde_json::Value::from(*v)),
            FieldValue::Float(v) => T::deserialize(serde_json::Value::from(*v)),
            FieldValue::String(v) => T::deserialize(serde_json::Value::from(v.as_str())),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for FieldValue {
            fn from(v: $t) -> Self {
                FieldValue::Int(i64::from(v))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<isize> for FieldValue {
    fn from(v: isize) -> Self {
        FieldValue::Int(v as i64)
    }
}

macro_rules! impl_try_from_int {
    ($($t:ty),*) => {
        $(impl TryFrom<$t> for FieldValue {
            type Error = std::num::TryFromIntError;

            fn try_from(v: $t) -> Result<Self, Self::Error> {
                i64::try_from(v).map(FieldValue::Int)
            }
        })*
    };
}

impl_try_from_int!(u64, usize);

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(f64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// Key → value storage owned by one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldStore {
    fields: HashMap<String, FieldValue>,
}

impl FieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, returning the value it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Option<FieldValue> {
        self.fields.insert(key.into(), value.into())
    }

    /// Store a structured value as a snapshot.
    pub fn insert_object<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> PipelineResult<()> {
        let key = key.into();
        let value = FieldValue::object(value).map_err(|e| {
            PipelineError::config(format!("field '{}' could not be serialized: {}", key, e))
        })?;
        self.fields.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// `None` when the key is absent or not integer-typed.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(FieldValue::as_int)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(FieldValue::as_bool)
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(FieldValue::as_float)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_str)
    }

    fn require(&self, key: &str) -> PipelineResult<&FieldValue> {
        self.get(key).ok_or_else(|| PipelineError::FieldAbsent {
            key: key.to_string(),
        })
    }

    /// Like [`get_int`](Self::get_int) but says why the lookup failed.
    pub fn try_int(&self, key: &str) -> PipelineResult<i64> {
        let value = self.require(key)?;
        value.as_int().ok_or_else(|| PipelineError::FieldTypeMismatch {
            key: key.to_string(),
            expected: "int",
            found: value.type_name(),
        })
    }

    /// Decode the field into a fresh `T`.
    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> PipelineResult<T> {
        self.require(key)?
            .decode()
            .map_err(|source| PipelineError::FieldDecode {
                key: key.to_string(),
                source,
            })
    }

    /// Decode the field into `dest`. On error `dest` is left untouched.
    pub fn get_object_into<T: DeserializeOwned>(&self, key: &str, dest: &mut T) -> PipelineResult<()> {
        *dest = self.get_object(key)?;
        Ok(())
    }
}
