//! Remote registry for resolving a backend from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ledgersync_common::{Error, Result};

use crate::provider::RemoteStore;

/// Factory function type for creating remote stores.
pub type RemoteFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteStore>> + Send + Sync>;

/// Registry for remote store factories.
///
/// Allows dynamic registration and resolution of remote backends
/// by name and configuration.
pub struct RemoteRegistry {
    factories: HashMap<String, RemoteFactory>,
}

impl RemoteRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a remote factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: RemoteFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Remote '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a remote by name and configuration.
    ///
    /// # Errors
    /// - Remote not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Remote '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered remote names.
    pub fn remotes(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
///
/// - `memory`: no configuration
/// - `fs`: `{"root": "<dir>"}`
/// - `http`: `{"url": "<base>", "token": "<bearer>"?, "poll_interval_ms": <n>?}`
pub fn create_default_registry() -> Result<RemoteRegistry> {
    let mut registry = RemoteRegistry::new();

    registry.register(
        "memory",
        Box::new(|_config: Value| {
            Ok(Arc::new(crate::memory::MemoryRemote::new()) as Arc<dyn RemoteStore>)
        }),
    )?;

    registry.register(
        "fs",
        Box::new(|config: Value| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidInput("fs remote requires 'root' path".to_string()))?;
            Ok(Arc::new(crate::local::FsRemote::new(root)?) as Arc<dyn RemoteStore>)
        }),
    )?;

    registry.register(
        "http",
        Box::new(|config: Value| {
            let url = config
                .get("url")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidInput("http remote requires 'url'".to_string()))?;
            let token = config
                .get("token")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            let mut remote = crate::http::RestRemote::new(url, token)?;
            if let Some(ms) = config.get("poll_interval_ms").and_then(|v| v.as_u64()) {
                remote = remote.with_poll_interval(Duration::from_millis(ms));
            }
            Ok(Arc::new(remote) as Arc<dyn RemoteStore>)
        }),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use serde_json::json;

    fn memory_factory() -> RemoteFactory {
        Box::new(|_: Value| Ok(Arc::new(MemoryRemote::new()) as Arc<dyn RemoteStore>))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = RemoteRegistry::new();

        registry.register("test", memory_factory()).unwrap();

        let remote = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(remote.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = RemoteRegistry::new();

        registry.register("test", memory_factory()).unwrap();

        let result = registry.register("test", memory_factory());
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = RemoteRegistry::new();
        assert!(registry.resolve("unknown", Value::Null).is_err());
    }

    #[test]
    fn test_default_registry_backends() {
        let registry = create_default_registry().unwrap();
        let mut names = registry.remotes();
        names.sort();
        assert_eq!(names, vec!["fs", "http", "memory"]);

        let temp = tempfile::TempDir::new().unwrap();
        let fs = registry
            .resolve("fs", json!({"root": temp.path().to_str().unwrap()}))
            .unwrap();
        assert_eq!(fs.name(), "fs");

        assert!(registry.resolve("fs", json!({})).is_err());
        assert!(registry.resolve("http", json!({})).is_err());

        let http = registry
            .resolve("http", json!({"url": "http://localhost:8080", "poll_interval_ms": 250}))
            .unwrap();
        assert_eq!(http.name(), "http");
    }
}
