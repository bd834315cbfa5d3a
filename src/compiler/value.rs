//! Value types inferred for traversal steps plus the literal values carried in
//! operator arguments and result records.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Primitive scalar kinds a property or computed value can take.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantType {
    /// Boolean.
    Bool,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 32-bit floating point.
    Float,
    /// 64-bit floating point.
    Double,
    /// UTF-8 string.
    String,
    /// Opaque binary payload.
    Bytes,
    /// Calendar date.
    Date,
    /// Timestamp with nanosecond precision.
    DateTime,
}

impl VariantType {
    fn name(self) -> &'static str {
        match self {
            VariantType::Bool => "bool",
            VariantType::Short => "short",
            VariantType::Int => "int",
            VariantType::Long => "long",
            VariantType::Float => "float",
            VariantType::Double => "double",
            VariantType::String => "string",
            VariantType::Bytes => "bytes",
            VariantType::Date => "date",
            VariantType::DateTime => "datetime",
        }
    }
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Output type of a traversal step.
///
/// Two value types are equal iff their variant and every nested parameter are
/// equal. Values are never mutated after construction.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "snake_case")]
pub enum ValueType {
    /// Graph vertex.
    Vertex,
    /// Graph edge.
    Edge,
    /// Computed scalar.
    Value(VariantType),
    /// Scalar read from a vertex or edge property.
    Property(VariantType),
    /// Homogeneous list.
    List(Box<ValueType>),
    /// Map from key type to value type.
    Map(Box<ValueType>, Box<ValueType>),
    /// One of several alternatives, kept sorted and de-duplicated.
    Variety(BTreeSet<ValueType>),
}

impl ValueType {
    /// Long-integer scalar, the output of every counting step.
    pub fn long() -> Self {
        ValueType::Value(VariantType::Long)
    }

    /// Wraps `element` into a list type.
    pub fn list_of(element: ValueType) -> Self {
        ValueType::List(Box::new(element))
    }

    /// Builds a map type.
    pub fn map_of(key: ValueType, value: ValueType) -> Self {
        ValueType::Map(Box::new(key), Box::new(value))
    }

    /// Merges alternatives into one type.
    ///
    /// Nested varieties are flattened; a single distinct alternative collapses
    /// to itself.
    pub fn unify<I>(types: I) -> Option<Self>
    where
        I: IntoIterator<Item = ValueType>,
    {
        let mut set = BTreeSet::new();
        for ty in types {
            match ty {
                ValueType::Variety(inner) => set.extend(inner),
                other => {
                    set.insert(other);
                }
            }
        }
        match set.len() {
            0 => None,
            1 => set.into_iter().next(),
            _ => Some(ValueType::Variety(set)),
        }
    }

    /// Element type produced when unfolding a value of this type.
    pub fn element(&self) -> ValueType {
        match self {
            ValueType::List(inner) => (**inner).clone(),
            ValueType::Map(key, value) => {
                ValueType::map_of((**key).clone(), (**value).clone())
            }
            other => other.clone(),
        }
    }

    /// Returns true for vertex and edge types.
    pub fn is_element(&self) -> bool {
        matches!(self, ValueType::Vertex | ValueType::Edge)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Vertex => f.write_str("vertex"),
            ValueType::Edge => f.write_str("edge"),
            ValueType::Value(v) => write!(f, "{v}"),
            ValueType::Property(v) => write!(f, "property<{v}>"),
            ValueType::List(inner) => write!(f, "list<{inner}>"),
            ValueType::Map(k, v) => write!(f, "map<{k}, {v}>"),
            ValueType::Variety(set) => {
                f.write_str("variety<")?;
                for (idx, ty) in set.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{ty}")?;
                }
                f.write_str(">")
            }
        }
    }
}

/// Typed literal tagged with explicit type information so the wire format
/// remains unambiguous across the external serialization layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 32-bit integer literal.
    Int(i32),
    /// Signed 64-bit integer literal.
    Long(i64),
    /// 64-bit floating point literal.
    Double(f64),
    /// UTF-8 string literal.
    String(String),
    /// Nanoseconds since Unix epoch in UTC.
    #[serde(deserialize_with = "serde_datetime::deserialize")]
    DateTime(i128),
    /// Ordered list of values.
    List(Vec<Value>),
}

mod serde_datetime {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i128, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DateTimeVisitor;

        impl<'de> Visitor<'de> for DateTimeVisitor {
            type Value = i128;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("nanoseconds since Unix epoch or an RFC 3339 timestamp")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(value as i128)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(value as i128)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if let Ok(nanos) = value.parse::<i128>() {
                    return Ok(nanos);
                }
                OffsetDateTime::parse(value, &Rfc3339)
                    .map(OffsetDateTime::unix_timestamp_nanos)
                    .map_err(|err| E::custom(format!("invalid datetime literal '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(DateTimeVisitor)
    }
}

impl Value {
    /// Scalar kind of this literal, if it has one.
    pub fn variant_type(&self) -> Option<VariantType> {
        match self {
            Value::Null | Value::List(_) => None,
            Value::Bool(_) => Some(VariantType::Bool),
            Value::Int(_) => Some(VariantType::Int),
            Value::Long(_) => Some(VariantType::Long),
            Value::Double(_) => Some(VariantType::Double),
            Value::String(_) => Some(VariantType::String),
            Value::DateTime(_) => Some(VariantType::DateTime),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}L"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{v}'"),
            Value::DateTime(v) => write!(f, "datetime({v})"),
            Value::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_covers_nested_parameters() {
        let a = ValueType::list_of(ValueType::Property(VariantType::Int));
        let b = ValueType::list_of(ValueType::Property(VariantType::Int));
        let c = ValueType::list_of(ValueType::Value(VariantType::Int));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unify_flattens_and_collapses() {
        assert_eq!(
            ValueType::unify([ValueType::Vertex, ValueType::Vertex]),
            Some(ValueType::Vertex)
        );
        let nested = ValueType::unify([ValueType::Vertex, ValueType::Edge]).unwrap();
        let merged = ValueType::unify([nested.clone(), ValueType::long()]).unwrap();
        match merged {
            ValueType::Variety(set) => assert_eq!(set.len(), 3),
            other => panic!("expected variety, got {other}"),
        }
        assert_eq!(ValueType::unify(Vec::new()), None);
    }

    #[test]
    fn display_is_readable() {
        let ty = ValueType::map_of(ValueType::Value(VariantType::String), ValueType::Vertex);
        assert_eq!(ty.to_string(), "map<string, vertex>");
        assert_eq!(
            ValueType::Property(VariantType::Double).to_string(),
            "property<double>"
        );
    }

    #[test]
    fn datetime_accepts_string_payloads() {
        let value: Value = serde_json::from_str(r#"{"t":"DateTime","v":"1700000000000000000"}"#)
            .expect("datetime parses");
        assert_eq!(value, Value::DateTime(1_700_000_000_000_000_000));
    }

    #[test]
    fn datetime_accepts_rfc3339() {
        let value: Value =
            serde_json::from_str(r#"{"t":"DateTime","v":"2023-11-14T22:13:20Z"}"#).unwrap();
        let expected = time::macros::datetime!(2023-11-14 22:13:20 UTC).unix_timestamp_nanos();
        assert_eq!(value, Value::DateTime(expected));
        assert_eq!(expected, 1_700_000_000_000_000_000);
    }
}
