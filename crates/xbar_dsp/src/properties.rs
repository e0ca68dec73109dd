//! Typed Property Bags
//!
//! Processing modules carry an opaque bag of typed scalar and vector
//! properties. The same bag type is used for module configuration, runtime
//! commands and module events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A typed property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PropertyValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Int32Vector(Vec<i32>),
    Int64Vector(Vec<i64>),
    Float32Vector(Vec<f32>),
    Float64Vector(Vec<f64>),
    StringVector(Vec<String>),
}

macro_rules! scalar_conversions {
    ($variant:ident, $ty:ty, $getter:ident) => {
        impl From<$ty> for PropertyValue {
            fn from(value: $ty) -> Self {
                PropertyValue::$variant(value)
            }
        }

        impl PropertyValue {
            pub fn $getter(&self) -> Option<$ty> {
                match self {
                    PropertyValue::$variant(value) => Some(value.clone()),
                    _ => None,
                }
            }
        }
    };
}

scalar_conversions!(Int32, i32, as_i32);
scalar_conversions!(Int64, i64, as_i64);
scalar_conversions!(Float32, f32, as_f32);
scalar_conversions!(Float64, f64, as_f64);
scalar_conversions!(String, String, as_string);
scalar_conversions!(Float32Vector, Vec<f32>, as_f32_vector);
scalar_conversions!(Int32Vector, Vec<i32>, as_i32_vector);

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

/// Ordered key/value bag of typed properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.entries.get(key).and_then(PropertyValue::as_i32)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(PropertyValue::as_i64)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.entries.get(key).and_then(PropertyValue::as_f32)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(PropertyValue::as_f64)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.entries.get(key).and_then(PropertyValue::as_string)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.entries.iter()
    }

    /// Merge `other` into this bag, overwriting duplicate keys
    pub fn merge(&mut self, other: &Properties) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut props = Properties::new();
        props.set("gain", 0.5f32);
        props.set("mode", "wide");
        props.set("count", 3i32);

        assert_eq!(props.get_f32("gain"), Some(0.5));
        assert_eq!(props.get_string("mode").as_deref(), Some("wide"));
        assert_eq!(props.get_i32("count"), Some(3));
        // Wrong type yields None rather than a coerced value
        assert_eq!(props.get_i32("gain"), None);
        assert_eq!(props.get_f32("missing"), None);
    }

    #[test]
    fn test_vectors() {
        let mut props = Properties::new();
        props.set("coeffs", vec![1.0f32, 0.5, 0.25]);
        let value = props.get("coeffs").unwrap();
        assert_eq!(value.as_f32_vector().unwrap().len(), 3);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base = Properties::new();
        base.set("a", 1i32);
        base.set("b", 2i32);
        let mut overlay = Properties::new();
        overlay.set("b", 20i32);

        base.merge(&overlay);
        assert_eq!(base.get_i32("a"), Some(1));
        assert_eq!(base.get_i32("b"), Some(20));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut props = Properties::new();
        props.set("name", "mixer0");
        props.set("level", 0.25f64);

        let json = serde_json::to_string(&props).unwrap();
        let back: Properties = serde_json::from_str(&json).unwrap();
        assert_eq!(props, back);
    }
}
