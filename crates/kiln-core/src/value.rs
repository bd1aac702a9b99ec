//! Input values and implementation identity
//!
//! Both feed the cache key, so both must hash the same way across process
//! runs: nothing here may depend on memory addresses or object identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::hasher::{HashCode, Hasher};

/// Identity of a task type, task action or custom value type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Implementation {
    pub type_name: String,
    /// Hash of the loader the type came from; `None` when it was loaded
    /// by a loader the build does not track
    pub loader_hash: Option<HashCode>,
    /// Anonymous closure-like implementation with no stable identity
    #[serde(default)]
    pub anonymous: bool,
}

impl Implementation {
    pub fn new(type_name: impl Into<String>, loader_hash: HashCode) -> Self {
        Self {
            type_name: type_name.into(),
            loader_hash: Some(loader_hash),
            anonymous: false,
        }
    }

    pub fn untracked(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            loader_hash: None,
            anonymous: false,
        }
    }

    pub fn anonymous(type_name: impl Into<String>, loader_hash: HashCode) -> Self {
        Self {
            type_name: type_name.into(),
            loader_hash: Some(loader_hash),
            anonymous: true,
        }
    }

    /// Stable identity hash, or `None` when the implementation cannot be identified
    pub fn hash(&self) -> Option<HashCode> {
        if self.anonymous {
            return None;
        }
        let loader_hash = self.loader_hash?;
        let mut hasher = Hasher::new();
        hasher.put_str(&self.type_name).put_hash(&loader_hash);
        Some(hasher.finish())
    }

    pub fn is_cacheable(&self) -> bool {
        self.hash().is_some()
    }

    /// Human-readable reason why `subject` cannot be identity-hashed
    pub fn non_cacheable_reason(&self, subject: &str) -> Option<String> {
        if self.anonymous {
            Some(format!(
                "{} was implemented by the anonymous closure '{}'.",
                subject, self.type_name
            ))
        } else if self.loader_hash.is_none() {
            Some(format!(
                "{} was loaded with an unknown loader (type '{}').",
                subject, self.type_name
            ))
        } else {
            None
        }
    }
}

/// Value of an input value property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Path(PathBuf),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    /// Custom value carrying its own serialized state
    Object {
        implementation: Implementation,
        state: Vec<u8>,
    },
}

/// Raised when a value contains an object whose type cannot be identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonCacheableValue {
    pub type_name: String,
}

impl PropertyValue {
    pub fn list<T: Into<PropertyValue>>(items: impl IntoIterator<Item = T>) -> Self {
        PropertyValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn hash(&self) -> Result<HashCode, NonCacheableValue> {
        let mut hasher = Hasher::new();
        self.append_to(&mut hasher)?;
        Ok(hasher.finish())
    }

    fn append_to(&self, hasher: &mut Hasher) -> Result<(), NonCacheableValue> {
        match self {
            PropertyValue::Null => {
                hasher.put_null();
            }
            PropertyValue::Bool(value) => {
                hasher.put_bool(*value);
            }
            PropertyValue::Int(value) => {
                hasher.put_i64(*value);
            }
            PropertyValue::String(value) => {
                hasher.put_str("string").put_str(value);
            }
            PropertyValue::Path(value) => {
                hasher.put_str("path").put_str(&value.to_string_lossy());
            }
            PropertyValue::List(items) => {
                hasher.put_str("list").put_usize(items.len());
                for item in items {
                    item.append_to(hasher)?;
                }
            }
            PropertyValue::Map(entries) => {
                hasher.put_str("map").put_usize(entries.len());
                for (key, value) in entries {
                    hasher.put_str(key);
                    value.append_to(hasher)?;
                }
            }
            PropertyValue::Object {
                implementation,
                state,
            } => {
                let identity = implementation.hash().ok_or_else(|| NonCacheableValue {
                    type_name: implementation.type_name.clone(),
                })?;
                hasher.put_hash(&identity).put_bytes(state);
            }
        }
        Ok(())
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<PathBuf> for PropertyValue {
    fn from(value: PathBuf) -> Self {
        PropertyValue::Path(value)
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::String(n.to_string()),
            },
            Value::String(s) => PropertyValue::String(s),
            Value::Array(items) => PropertyValue::list(items),
            Value::Object(entries) => PropertyValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, PropertyValue::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> HashCode {
        HashCode::of(b"build-script-loader")
    }

    #[test]
    fn test_implementation_hash_is_stable() {
        let a = Implementation::new("org.example.Compile", loader());
        let b = Implementation::new("org.example.Compile", loader());
        assert_eq!(a.hash(), b.hash());
        assert!(a.hash().is_some());
    }

    #[test]
    fn test_untracked_and_anonymous_are_not_cacheable() {
        let untracked = Implementation::untracked("Foo");
        assert!(!untracked.is_cacheable());
        assert_eq!(
            untracked.non_cacheable_reason("Task action").unwrap(),
            "Task action was loaded with an unknown loader (type 'Foo')."
        );

        let anonymous = Implementation::anonymous("build_script$closure1", loader());
        assert!(!anonymous.is_cacheable());
        assert!(anonymous
            .non_cacheable_reason("Task action")
            .unwrap()
            .contains("anonymous closure"));
    }

    #[test]
    fn test_value_hashes_distinguish_types() {
        let string = PropertyValue::from("1").hash().unwrap();
        let int = PropertyValue::from(1).hash().unwrap();
        assert_ne!(string, int);
    }

    #[test]
    fn test_nested_object_with_unknown_loader() {
        let value = PropertyValue::list(vec![
            PropertyValue::from("ok"),
            PropertyValue::Object {
                implementation: Implementation::untracked("Custom"),
                state: vec![1, 2, 3],
            },
        ]);
        let err = value.hash().unwrap_err();
        assert_eq!(err.type_name, "Custom");
    }

    #[test]
    fn test_map_hash_ignores_insertion_order() {
        let json_a = serde_json::json!({"a": 1, "b": [true, null]});
        let json_b = serde_json::json!({"b": [true, null], "a": 1});
        assert_eq!(
            PropertyValue::from(json_a).hash().unwrap(),
            PropertyValue::from(json_b).hash().unwrap()
        );
    }
}
