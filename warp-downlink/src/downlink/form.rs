//! Conversions between wire [`Value`]s and the types handles expose.

use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

/// Two-way conversion between [`Value`] and `Item`.
///
/// `cast` returning `None` is a form mismatch: handles substitute `unit()`
/// and log it, the link is not affected.
pub trait Form: Send + Sync + 'static {
    type Item: Clone + Debug + Send + Sync + 'static;

    fn mold(&self, item: &Self::Item) -> Value;

    fn cast(&self, value: &Value) -> Option<Self::Item>;

    fn unit(&self) -> Self::Item;
}

/// Passes values through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueForm;

impl Form for ValueForm {
    type Item = Value;

    fn mold(&self, item: &Value) -> Value {
        item.clone()
    }

    fn cast(&self, value: &Value) -> Option<Value> {
        Some(value.clone())
    }

    fn unit(&self) -> Value {
        Value::Absent
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TextForm;

impl Form for TextForm {
    type Item = String;

    fn mold(&self, item: &String) -> Value {
        Value::Text(item.clone())
    }

    fn cast(&self, value: &Value) -> Option<String> {
        match value {
            Value::Text(text) => Some(text.clone()),
            Value::Int(n) => Some(n.to_string()),
            Value::Float(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn unit(&self) -> String {
        String::new()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IntForm;

impl Form for IntForm {
    type Item = i64;

    fn mold(&self, item: &i64) -> Value {
        Value::Int(*item)
    }

    fn cast(&self, value: &Value) -> Option<i64> {
        match value {
            Value::Text(text) => text.trim().parse().ok(),
            other => other.as_i64(),
        }
    }

    fn unit(&self) -> i64 {
        0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FloatForm;

impl Form for FloatForm {
    type Item = f64;

    fn mold(&self, item: &f64) -> Value {
        Value::Float(*item)
    }

    fn cast(&self, value: &Value) -> Option<f64> {
        match value {
            Value::Text(text) => text.trim().parse().ok(),
            other => other.as_f64(),
        }
    }

    fn unit(&self) -> f64 {
        0.0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BoolForm;

impl Form for BoolForm {
    type Item = bool;

    fn mold(&self, item: &bool) -> Value {
        Value::Bool(*item)
    }

    fn cast(&self, value: &Value) -> Option<bool> {
        match value {
            Value::Text(text) => text.parse().ok(),
            other => other.as_bool(),
        }
    }

    fn unit(&self) -> bool {
        false
    }
}

/// Any serde type, through its JSON representation.
pub struct JsonForm<T>(PhantomData<fn() -> T>);

impl<T> JsonForm<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonForm<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonForm<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Form for JsonForm<T>
where
    T: Serialize + DeserializeOwned + Clone + Debug + Default + Send + Sync + 'static,
{
    type Item = T;

    fn mold(&self, item: &T) -> Value {
        serde_json::to_value(item)
            .map(Value::from)
            .unwrap_or_default()
    }

    fn cast(&self, value: &Value) -> Option<T> {
        serde_json::from_value(serde_json::Value::from(value.clone())).ok()
    }

    fn unit(&self) -> T {
        T::default()
    }
}
