//! Validation helpers for configuration mappings.
//!
//! Configuration sections are kept as [`serde_json::Value`] so that custom
//! hosts can read keys the crate does not know about. Required keys may be
//! dotted (`conn.host`) to check nested mappings.

use serde_json::Value;

use crate::error::{Error, Result};

/// Typed access to a configuration mapping.
pub trait ConfigValue {
    /// Value at a dotted path.
    fn lookup(&self, path: &str) -> Option<&Value>;

    /// Optional string; present but not a string is an error.
    fn opt_str(&self, key: &str) -> Result<Option<String>>;

    /// Optional boolean; present but not a boolean is an error.
    fn opt_bool(&self, key: &str) -> Result<Option<bool>>;
}

impl ConfigValue for Value {
    fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, |value, key| value.get(key))
    }

    fn opt_str(&self, key: &str) -> Result<Option<String>> {
        match self.lookup(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            // Numbers are accepted where YAML users write e.g. `password: 123`
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(Error::InvalidValue(format!(
                "Value of \"{key}\" must be a string, got {other}"
            ))),
        }
    }

    fn opt_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.lookup(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(Error::InvalidValue(format!(
                "Value of \"{key}\" must be a boolean, got {other}"
            ))),
        }
    }
}

/// True if the value counts as set: not null, not an empty string, list or
/// mapping and not `false`.
fn is_set(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}

/// Checks that every key in `keys` is set in `value`.
///
/// The first missing key produces
/// `"{key}" property is missing in {scope} configuration`.
pub fn validate_required(value: &Value, keys: &[&str], scope: &str) -> Result<()> {
    for key in keys {
        let mut current = Some(value);
        for part in key.split('.') {
            current = current.filter(|v| is_set(v)).and_then(|v| v.get(part));
        }

        if !current.is_some_and(is_set) {
            return Err(Error::missing_key(*key, scope));
        }
    }

    Ok(())
}

/// Reads a required string key.
pub fn require_str(value: &Value, key: &str, scope: &str) -> Result<String> {
    validate_required(value, &[key], scope)?;
    value
        .opt_str(key)?
        .ok_or_else(|| Error::missing_key(key, scope))
}
