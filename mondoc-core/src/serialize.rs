//! Rendering records as JSON.
//!
//! Record serialization maps each field to its external key, applies custom
//! field serializers, adds computed values and loaded relations, and never
//! exposes internal state such as the dirty set or the original snapshot.
//! BSON values without a JSON counterpart are rendered in relaxed form:
//! object ids as hex strings and dates as RFC 3339 strings.

use bson::Bson;
use chrono::SecondsFormat;
use serde_json::{Map, Number, Value};

/// Call-time overrides for record serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializeOptions {
    /// Only these keys. Overrides hidden fields and `exclude`.
    pub include: Option<Vec<String>>,
    /// Keys left out.
    pub exclude: Vec<String>,
    /// Include computed values.
    pub computed: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            include: None,
            exclude: Vec::new(),
            computed: true,
        }
    }
}

impl SerializeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, fields: &[&str]) -> Self {
        self.include = Some(fields.iter().map(ToString::to_string).collect());
        self
    }

    pub fn exclude(mut self, fields: &[&str]) -> Self {
        self.exclude.extend(fields.iter().map(ToString::to_string));
        self
    }

    pub fn without_computed(mut self) -> Self {
        self.computed = false;
        self
    }

    /// Whether `key` is rendered. `hidden` marks fields declared hidden.
    pub fn wants(&self, key: &str, hidden: bool) -> bool {
        match &self.include {
            Some(include) => include.iter().any(|k| k == key),
            None => !hidden && !self.exclude.iter().any(|k| k == key),
        }
    }
}

/// Converts a BSON value to relaxed JSON.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(n) => Value::from(*n),
        Bson::Int64(n) => Value::from(*n),
        Bson::Double(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.to_chrono()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(k, v)| (k.clone(), bson_to_json(v)))
                .collect::<Map<_, _>>(),
        ),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Symbol(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}
