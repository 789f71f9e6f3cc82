use std::fmt;

use serde_json::{Map, Value};

/// A mandatory field was absent or had the wrong JSON type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SanitizeError {
    pub path: String,
    pub expected: &'static str,
}

impl fmt::Display for SanitizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field '{}' is missing or is not {}",
            self.path, self.expected
        )
    }
}

impl std::error::Error for SanitizeError {}

/// Dotted-path reads over a borrowed JSON document, e.g. `system.os.name`.
/// An empty path addresses the root.
#[derive(Clone, Copy, Debug)]
pub struct JsonLookup<'a> {
    root: &'a Value,
}

impl<'a> JsonLookup<'a> {
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    pub fn value(&self, path: &str) -> Option<&'a Value> {
        if path.is_empty() {
            return Some(self.root);
        }
        path.split('.')
            .try_fold(self.root, |current, segment| current.as_object()?.get(segment))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.value(path).is_some()
    }

    pub fn object(&self, path: &str) -> Result<&'a Map<String, Value>, SanitizeError> {
        self.typed(path, "an object", Value::as_object)
    }

    pub fn array(&self, path: &str) -> Result<&'a Vec<Value>, SanitizeError> {
        self.typed(path, "an array", Value::as_array)
    }

    pub fn string(&self, path: &str) -> Result<String, SanitizeError> {
        self.typed(path, "a string", Value::as_str).map(str::to_owned)
    }

    pub fn int(&self, path: &str) -> Result<i32, SanitizeError> {
        self.typed(path, "a 32-bit integer", |value| {
            value.as_i64().and_then(|raw| i32::try_from(raw).ok())
        })
    }

    pub fn long(&self, path: &str) -> Result<i64, SanitizeError> {
        self.typed(path, "a 64-bit integer", Value::as_i64)
    }

    pub fn boolean(&self, path: &str) -> Result<bool, SanitizeError> {
        self.typed(path, "a boolean", Value::as_bool)
    }

    fn typed<T>(
        &self,
        path: &str,
        expected: &'static str,
        read: impl FnOnce(&'a Value) -> Option<T>,
    ) -> Result<T, SanitizeError> {
        self.value(path).and_then(read).ok_or_else(|| SanitizeError {
            path: path.to_owned(),
            expected,
        })
    }
}
