//! Named field transforms applied during projection

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use fanload_common::{FanloadError, Result};
use regex::Regex;

pub type TransformFn = dyn Fn(Option<&str>) -> Option<String> + Send + Sync;

static ZERO_DATE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^0000-00-00(?:[ T]00:00:00(?:\.0+)?)?$").ok());

/// A named value transform. Receives `None` for NULL input or for columns
/// without a source field.
#[derive(Clone)]
pub struct Transform {
    name: String,
    func: Arc<TransformFn>,
}

impl Transform {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Option<&str>) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, value: Option<&str>) -> Option<String> {
        (self.func)(value)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transform").field(&self.name).finish()
    }
}

/// Lookup table from transform name to implementation
#[derive(Debug, Clone, Default)]
pub struct TransformRegistry {
    transforms: BTreeMap<String, Transform>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Transform::new("trim", |v| v.map(|s| s.trim().to_string())));
        registry.register(Transform::new("right-trim", |v| {
            v.map(|s| s.trim_end().to_string())
        }));
        registry.register(Transform::new("upper", |v| v.map(str::to_uppercase)));
        registry.register(Transform::new("lower", |v| v.map(str::to_lowercase)));
        registry.register(Transform::new("empty-string-to-null", |v| {
            v.filter(|s| !s.is_empty()).map(str::to_string)
        }));
        registry.register(Transform::new("null-to-empty-string", |v| {
            Some(v.unwrap_or_default().to_string())
        }));
        registry.register(Transform::new("zero-dates-to-null", |v| {
            v.filter(|s| !is_zero_date(s)).map(str::to_string)
        }));
        registry
    }

    /// Add or replace a transform under its own name
    pub fn register(&mut self, transform: Transform) {
        self.transforms.insert(transform.name.clone(), transform);
    }

    pub fn get(&self, name: &str) -> Result<Transform> {
        self.transforms.get(name).cloned().ok_or_else(|| {
            FanloadError::Config(format!(
                "unknown transform '{}' (known: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.transforms.keys().map(String::as_str)
    }
}

fn is_zero_date(value: &str) -> bool {
    ZERO_DATE
        .as_ref()
        .is_some_and(|regex| regex.is_match(value.trim()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = TransformRegistry::with_builtins();
        let apply = |name: &str, value: Option<&str>| registry.get(name).unwrap().apply(value);

        assert_eq!(apply("trim", Some("  x ")), Some("x".to_string()));
        assert_eq!(apply("right-trim", Some("  x ")), Some("  x".to_string()));
        assert_eq!(apply("upper", Some("abc")), Some("ABC".to_string()));
        assert_eq!(apply("lower", None), None);
        assert_eq!(apply("empty-string-to-null", Some("")), None);
        assert_eq!(apply("null-to-empty-string", None), Some(String::new()));
    }

    #[test]
    fn test_zero_dates() {
        let registry = TransformRegistry::with_builtins();
        let zero = registry.get("zero-dates-to-null").unwrap();
        assert_eq!(zero.apply(Some("0000-00-00")), None);
        assert_eq!(zero.apply(Some("0000-00-00 00:00:00")), None);
        assert_eq!(
            zero.apply(Some("2024-02-29 00:00:00")),
            Some("2024-02-29 00:00:00".to_string())
        );
    }

    #[test]
    fn test_unknown_transform_is_config_error() {
        let err = TransformRegistry::with_builtins().get("rot13").unwrap_err();
        assert!(matches!(err, FanloadError::Config(_)));
        assert!(err.to_string().contains("rot13"));
    }

    #[test]
    fn test_custom_transform_replaces_builtin() {
        let mut registry = TransformRegistry::with_builtins();
        registry.register(Transform::new("upper", |_| Some("X".to_string())));
        assert_eq!(
            registry.get("upper").unwrap().apply(Some("a")),
            Some("X".to_string())
        );
    }
}
