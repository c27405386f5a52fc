//! Dynamically typed values decoded from band frames.
//!
//! The codec hands inbound frames over as a tree of field names and loosely
//! typed values. Firmware revisions disagree on how numbers are sent (native
//! integers, floats, numeric strings), so every read goes through the
//! coercion helpers here rather than matching on the variant directly.
//!
//! | Helper | Accepts | Otherwise |
//! |--------|---------|-----------|
//! | [`DecodedValue::as_i64`] | integer, finite float (truncated), numeric text | `None` |
//! | [`DecodedValue::as_f64`] | integer, finite float, numeric text | `None` |
//! | [`DecodedValue::as_text`] | text, integer, float, bool | `None` |

use std::borrow::Cow;
use std::collections::BTreeMap;

/// A decoded record: field name to value.
pub type Record = BTreeMap<String, DecodedValue>;

/// A loosely typed value from a decoded frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DecodedValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<DecodedValue>),
    Map(Record),
}

impl DecodedValue {
    /// Integer view: numeric cast first, then text parse.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::Int(v) => Some(*v),
            DecodedValue::Float(v) => float_to_i64(*v),
            DecodedValue::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(float_to_i64))
            }
            _ => None,
        }
    }

    /// Floating point view: numeric cast first, then text parse.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Int(v) => Some(*v as f64),
            DecodedValue::Float(v) => v.is_finite().then_some(*v),
            DecodedValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    /// Text view. Scalars are rendered; collections and null have none.
    #[must_use]
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            DecodedValue::Text(s) => Some(Cow::Borrowed(s.as_str())),
            DecodedValue::Int(v) => Some(Cow::Owned(v.to_string())),
            DecodedValue::Float(v) => Some(Cow::Owned(v.to_string())),
            DecodedValue::Bool(v) => Some(Cow::Owned(v.to_string())),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            DecodedValue::Map(record) => Some(record),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[DecodedValue]> {
        match self {
            DecodedValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// The records carried by this value.
    ///
    /// A single map yields itself, a list yields every map it contains
    /// (non-map entries are skipped), and anything else yields nothing.
    #[must_use]
    pub fn records(&self) -> Vec<&Record> {
        match self {
            DecodedValue::Map(record) => vec![record],
            DecodedValue::List(items) => items.iter().filter_map(DecodedValue::as_record).collect(),
            _ => Vec::new(),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, DecodedValue::Null)
    }

    /// Short name of the variant, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedValue::Null => "null",
            DecodedValue::Bool(_) => "bool",
            DecodedValue::Int(_) => "int",
            DecodedValue::Float(_) => "float",
            DecodedValue::Text(_) => "text",
            DecodedValue::List(_) => "list",
            DecodedValue::Map(_) => "map",
        }
    }
}

fn float_to_i64(v: f64) -> Option<i64> {
    if v.is_finite() && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        Some(v.trunc() as i64)
    } else {
        None
    }
}

impl From<serde_json::Value> for DecodedValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => DecodedValue::Null,
            Value::Bool(b) => DecodedValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => DecodedValue::Int(i),
                None => n.as_f64().map_or(DecodedValue::Null, DecodedValue::Float),
            },
            Value::String(s) => DecodedValue::Text(s),
            Value::Array(items) => {
                DecodedValue::List(items.into_iter().map(DecodedValue::from).collect())
            }
            Value::Object(map) => DecodedValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, DecodedValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for DecodedValue {
    fn from(value: &str) -> Self {
        DecodedValue::Text(value.to_string())
    }
}

impl From<String> for DecodedValue {
    fn from(value: String) -> Self {
        DecodedValue::Text(value)
    }
}

impl From<i64> for DecodedValue {
    fn from(value: i64) -> Self {
        DecodedValue::Int(value)
    }
}

impl From<f64> for DecodedValue {
    fn from(value: f64) -> Self {
        DecodedValue::Float(value)
    }
}

impl From<Record> for DecodedValue {
    fn from(value: Record) -> Self {
        DecodedValue::Map(value)
    }
}

impl From<Vec<DecodedValue>> for DecodedValue {
    fn from(value: Vec<DecodedValue>) -> Self {
        DecodedValue::List(value)
    }
}
