//! Versioned key-value payload that jobs serialize themselves into.
//!
//! The engine never looks inside a [`Data`]; it only stores it and hands it
//! back to the job's factory on reconstruction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when reading a field from [`Data`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The key is not present.
    #[error("missing key: {0}")]
    Missing(String),

    /// The key holds a value of another type.
    #[error("key {key} is not a {expected}")]
    WrongType { key: String, expected: &'static str },
}

/// A single primitive field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
    Double(f64),
    StringArray(Vec<String>),
}

impl DataValue {
    fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "string",
            DataValue::Int(_) => "int",
            DataValue::Long(_) => "long",
            DataValue::Bool(_) => "bool",
            DataValue::Double(_) => "double",
            DataValue::StringArray(_) => "string array",
        }
    }
}

/// Immutable job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    /// Payload format version, owned by the job that wrote it.
    #[serde(default = "default_version")]
    version: u32,

    fields: BTreeMap<String, DataValue>,
}

fn default_version() -> u32 {
    1
}

impl Default for Data {
    fn default() -> Self {
        Self::empty()
    }
}

macro_rules! typed_getter {
    ($get:ident, $get_or:ident, $variant:ident, $ty:ty, $name:literal) => {
        #[doc = concat!("Read a ", $name, " field.")]
        pub fn $get(&self, key: &str) -> Result<$ty, DataError> {
            match self.fields.get(key) {
                Some(DataValue::$variant(v)) => Ok(v.clone()),
                Some(_) => Err(DataError::WrongType {
                    key: key.to_string(),
                    expected: $name,
                }),
                None => Err(DataError::Missing(key.to_string())),
            }
        }

        #[doc = concat!("Read a ", $name, " field, falling back to `default` when absent.")]
        pub fn $get_or(&self, key: &str, default: $ty) -> Result<$ty, DataError> {
            if self.has(key) {
                self.$get(key)
            } else {
                Ok(default)
            }
        }
    };
}

impl Data {
    /// A payload with no fields.
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            fields: BTreeMap::new(),
        }
    }

    /// Start building a payload.
    pub fn builder() -> DataBuilder {
        DataBuilder::default()
    }

    /// Payload format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the key is present.
    pub fn has(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the payload has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Raw access to a field.
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.fields.get(key)
    }

    typed_getter!(get_string, get_string_or, String, String, "string");
    typed_getter!(get_int, get_int_or, Int, i32, "int");
    typed_getter!(get_long, get_long_or, Long, i64, "long");
    typed_getter!(get_bool, get_bool_or, Bool, bool, "bool");
    typed_getter!(get_double, get_double_or, Double, f64, "double");
    typed_getter!(
        get_string_array,
        get_string_array_or,
        StringArray,
        Vec<String>,
        "string array"
    );

    /// Type name of a stored field, for diagnostics.
    pub fn type_of(&self, key: &str) -> Option<&'static str> {
        self.fields.get(key).map(DataValue::type_name)
    }

    /// Encode to the JSON form used by the stores.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from the JSON form used by the stores.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Builder for [`Data`].
#[derive(Debug, Default)]
pub struct DataBuilder {
    version: Option<u32>,
    fields: BTreeMap<String, DataValue>,
}

impl DataBuilder {
    /// Set the payload format version (defaults to 1).
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn put_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .insert(key.into(), DataValue::String(value.into()));
        self
    }

    pub fn put_int(mut self, key: impl Into<String>, value: i32) -> Self {
        self.fields.insert(key.into(), DataValue::Int(value));
        self
    }

    pub fn put_long(mut self, key: impl Into<String>, value: i64) -> Self {
        self.fields.insert(key.into(), DataValue::Long(value));
        self
    }

    pub fn put_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.fields.insert(key.into(), DataValue::Bool(value));
        self
    }

    pub fn put_double(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), DataValue::Double(value));
        self
    }

    pub fn put_string_array(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.fields
            .insert(key.into(), DataValue::StringArray(values));
        self
    }

    /// Finish the payload.
    pub fn build(self) -> Data {
        Data {
            version: self.version.unwrap_or_else(default_version),
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Data {
        Data::builder()
            .version(3)
            .put_string("recipient", "+15550100")
            .put_int("retries", 2)
            .put_long("message_id", 9_000_000_001)
            .put_bool("urgent", true)
            .put_double("ratio", 0.5)
            .put_string_array("attachments", ["a.jpg", "b.png"])
            .build()
    }

    #[test]
    fn test_typed_getters() {
        let data = sample();
        assert_eq!(data.version(), 3);
        assert_eq!(data.get_string("recipient").unwrap(), "+15550100");
        assert_eq!(data.get_int("retries").unwrap(), 2);
        assert_eq!(data.get_long("message_id").unwrap(), 9_000_000_001);
        assert!(data.get_bool("urgent").unwrap());
        assert_eq!(data.get_double("ratio").unwrap(), 0.5);
        assert_eq!(
            data.get_string_array("attachments").unwrap(),
            vec!["a.jpg".to_string(), "b.png".to_string()]
        );
        assert_eq!(data.len(), 6);
    }

    #[test]
    fn test_missing_and_wrong_type() {
        let data = sample();
        assert_eq!(
            data.get_string("nope"),
            Err(DataError::Missing("nope".to_string()))
        );
        assert_eq!(
            data.get_int("recipient"),
            Err(DataError::WrongType {
                key: "recipient".to_string(),
                expected: "int",
            })
        );
        assert_eq!(data.type_of("recipient"), Some("string"));
    }

    #[test]
    fn test_defaults() {
        let data = Data::empty();
        assert!(data.is_empty());
        assert_eq!(data.version(), 1);
        assert_eq!(data.get_int_or("retries", 7).unwrap(), 7);
        assert!(!data.get_bool_or("urgent", false).unwrap());
    }

    #[test]
    fn test_json_form() {
        let data = Data::builder().put_string("k", "v").build();
        let json = data.to_json().unwrap();
        assert_eq!(json, r#"{"version":1,"fields":{"k":{"string":"v"}}}"#);

        // Payloads written before versioning decode as version 1.
        let legacy = Data::from_json(r#"{"fields":{"n":{"int":4}}}"#).unwrap();
        assert_eq!(legacy.version(), 1);
        assert_eq!(legacy.get_int("n").unwrap(), 4);
    }
}
