//! The dynamic value (`CValue`) and static type (`CType`) model shared by
//! every module boundary in the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A dynamically-typed value flowing between pipeline nodes.
///
/// `Map` uses a `BTreeMap` (rather than `HashMap`) so that serialization is
/// key-order-stable without a separate canonicalization pass — important
/// since `CValue`s participate in cache-key hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CValue {
    Int64(i64),
    Float64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<CValue>),
    Map(BTreeMap<String, CValue>),
    Null,
}

impl CValue {
    /// The `CType` this value's shape satisfies, for the primitive cases.
    /// Structured values (`List`/`Map`) infer an element/field type from
    /// their first observed member; an empty list/map infers `Null`
    /// element type, which type-checks against any declared element type
    /// only at the `Null`/absent-input-boundary (callers should prefer
    /// declaring an explicit `CType` rather than relying on inference for
    /// empty collections).
    pub fn infer_type(&self) -> CType {
        match self {
            CValue::Int64(_) => CType::Int64,
            CValue::Float64(_) => CType::Float64,
            CValue::Bool(_) => CType::Bool,
            CValue::String(_) => CType::String,
            CValue::Bytes(_) => CType::Bytes,
            CValue::Null => CType::Null,
            CValue::List(items) => {
                let elem = items.first().map(CValue::infer_type).unwrap_or(CType::Null);
                CType::List(Box::new(elem))
            }
            CValue::Map(entries) => {
                let value_ty = entries
                    .values()
                    .next()
                    .map(CValue::infer_type)
                    .unwrap_or(CType::Null);
                CType::Map(Box::new(CType::String), Box::new(value_ty))
            }
        }
    }

    /// Structural validation of this value against a declared type.
    ///
    /// `Null` satisfies any type (an absent/optional value); this mirrors
    /// the spec's data model, which does not define an `Option<T>` wrapper
    /// type and instead lets modules return `Null` to mean "no value".
    pub fn is_valid(&self, declared: &CType) -> bool {
        match (self, declared) {
            (CValue::Null, _) => true,
            (CValue::Int64(_), CType::Int64) => true,
            (CValue::Float64(_), CType::Float64) => true,
            (CValue::Bool(_), CType::Bool) => true,
            (CValue::String(_), CType::String) => true,
            (CValue::Bytes(_), CType::Bytes) => true,
            (CValue::List(items), CType::List(elem_ty)) => {
                items.iter().all(|item| item.is_valid(elem_ty))
            }
            (CValue::Map(entries), CType::Map(_, value_ty)) => {
                entries.values().all(|v| v.is_valid(value_ty))
            }
            (CValue::Map(entries), CType::Record(fields)) => fields
                .iter()
                .all(|(name, ty)| entries.get(name).is_some_and(|v| v.is_valid(ty))),
            _ => false,
        }
    }
}

impl fmt::Display for CValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "<unrepresentable>"),
        }
    }
}

/// The static type tag of a [`CValue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CType {
    Int64,
    Float64,
    Bool,
    String,
    Bytes,
    Null,
    List(Box<CType>),
    Map(Box<CType>, Box<CType>),
    Record(BTreeMap<String, CType>),
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CType::Int64 => write!(f, "Int64"),
            CType::Float64 => write!(f, "Float64"),
            CType::Bool => write!(f, "Bool"),
            CType::String => write!(f, "String"),
            CType::Bytes => write!(f, "Bytes"),
            CType::Null => write!(f, "Null"),
            CType::List(elem) => write!(f, "List<{elem}>"),
            CType::Map(k, v) => write!(f, "Map<{k},{v}>"),
            CType::Record(fields) => {
                write!(f, "Record{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}:{ty}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_satisfies_any_type() {
        assert!(CValue::Null.is_valid(&CType::Int64));
        assert!(CValue::Null.is_valid(&CType::List(Box::new(CType::String))));
    }

    #[test]
    fn primitive_type_check() {
        assert!(CValue::Int64(5).is_valid(&CType::Int64));
        assert!(!CValue::Int64(5).is_valid(&CType::String));
    }

    #[test]
    fn list_type_check_recurses() {
        let v = CValue::List(vec![CValue::Int64(1), CValue::Int64(2)]);
        assert!(v.is_valid(&CType::List(Box::new(CType::Int64))));
        let bad = CValue::List(vec![CValue::Int64(1), CValue::String("x".into())]);
        assert!(!bad.is_valid(&CType::List(Box::new(CType::Int64))));
    }

    #[test]
    fn record_type_check_requires_all_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), CType::String);
        fields.insert("name".to_string(), CType::String);
        let ty = CType::Record(fields);

        let mut entries = BTreeMap::new();
        entries.insert("id".to_string(), CValue::String("u1".into()));
        entries.insert("name".to_string(), CValue::String("Alice".into()));
        assert!(CValue::Map(entries).is_valid(&ty));

        let mut incomplete = BTreeMap::new();
        incomplete.insert("id".to_string(), CValue::String("u1".into()));
        assert!(!CValue::Map(incomplete).is_valid(&ty));
    }

    #[test]
    fn display_is_json() {
        assert_eq!(CValue::Int64(5).to_string(), "5");
        assert_eq!(CValue::String("hi".into()).to_string(), "\"hi\"");
    }

    #[test]
    fn infer_type_from_value() {
        assert_eq!(CValue::Int64(1).infer_type(), CType::Int64);
        assert_eq!(
            CValue::List(vec![CValue::Bool(true)]).infer_type(),
            CType::List(Box::new(CType::Bool))
        );
    }
}
