//! Host-injected services for node plugins
//!
//! Some plugins need runtime objects that do not belong in configuration:
//! a shared `reqwest::Client`, a mock transport in tests, a rate limiter.
//! The host stores them in an [`ExecutorExtensions`] map when building the
//! engine, and every [`ExecutionContext`](crate::context::ExecutionContext)
//! exposes the same shared map.

use std::any::Any;
use std::collections::HashMap;

/// Typed map of `Send + Sync` services, keyed by name
pub struct ExecutorExtensions {
    inner: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl ExecutorExtensions {
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    /// Insert a service, replacing any previous value under `key`
    pub fn set<T: Send + Sync + 'static>(&mut self, key: &str, value: T) {
        if self.inner.insert(key.to_string(), Box::new(value)).is_some() {
            log::debug!("ExecutorExtensions: replaced '{}'", key);
        }
    }

    /// Builder-style [`set`](Self::set)
    pub fn with<T: Send + Sync + 'static>(mut self, key: &str, value: T) -> Self {
        self.set(key, value);
        self
    }

    /// Get a service by key
    ///
    /// Returns `None` if the key doesn't exist or holds a different type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<&T> {
        self.inner.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for ExecutorExtensions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutorExtensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.inner.keys().collect();
        keys.sort();
        f.debug_struct("ExecutorExtensions").field("keys", &keys).finish()
    }
}

/// Well-known extension keys
pub mod extension_keys {
    /// `reqwest::Client` shared by the HTTP and LLM plugins
    pub const HTTP_CLIENT: &str = "http_client";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_and_get() {
        let ext = ExecutorExtensions::new().with("name", "hello".to_string());

        assert_eq!(ext.get::<String>("name"), Some(&"hello".to_string()));
        assert!(ext.has("name"));
        assert!(!ext.has("missing"));
    }

    #[test]
    fn test_type_mismatch_returns_none() {
        let mut ext = ExecutorExtensions::new();
        ext.set("count", 42u32);

        assert!(ext.get::<String>("count").is_none());
        assert_eq!(ext.get::<u32>("count"), Some(&42));
    }

    #[test]
    fn test_shared_service_and_remove() {
        let service = Arc::new(vec![1, 2, 3]);
        let mut ext = ExecutorExtensions::new().with(extension_keys::HTTP_CLIENT, service.clone());

        let retrieved = ext.get::<Arc<Vec<i32>>>(extension_keys::HTTP_CLIENT).unwrap();
        assert!(Arc::ptr_eq(retrieved, &service));

        assert!(ext.remove(extension_keys::HTTP_CLIENT));
        assert!(ext.is_empty());
        assert!(!ext.remove(extension_keys::HTTP_CLIENT));
    }

    #[test]
    fn test_debug_lists_keys() {
        let ext = ExecutorExtensions::new().with("b", 1u8).with("a", 2u8);
        assert_eq!(format!("{:?}", ext), r#"ExecutorExtensions { keys: ["a", "b"] }"#);
    }
}
