//! Namespace registry

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::router::{BackendInstance, BalancedRouter, Router};
use crate::config::{Config, NamespaceConfig};

/// A named routing domain
///
/// Sessions only read it: the router inside is internally synchronized.
pub struct Namespace {
    name: String,
    router: Arc<dyn Router>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, router: Arc<dyn Router>) -> Self {
        Self {
            name: name.into(),
            router,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }
}

/// Process-wide registry of namespaces
///
/// Built once from configuration and shared by every session. Backend
/// instances are de-duplicated by address so that a backend listed in several
/// namespaces is checked once and carries one load counter.
pub struct NamespaceManager {
    namespaces: DashMap<String, Arc<Namespace>>,
    /// Shared backend registry keyed by address
    instances: DashMap<String, Arc<BackendInstance>>,
    default_namespace: String,
}

impl NamespaceManager {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            namespaces: DashMap::new(),
            instances: DashMap::new(),
            default_namespace: default_namespace.into(),
        }
    }

    /// Build every configured namespace with a `BalancedRouter`
    pub fn from_config(config: &Config) -> Self {
        let manager = Self::new(config.default_namespace.clone());
        for ns_config in &config.namespaces {
            manager.register(ns_config);
            info!(
                namespace = %ns_config.name,
                backends = ns_config.backends.len(),
                "Registered namespace"
            );
        }
        manager
    }

    fn register(&self, config: &NamespaceConfig) {
        let instances = config
            .backends
            .iter()
            .map(|addr| {
                self.instances
                    .entry(addr.clone())
                    .or_insert_with(|| Arc::new(BackendInstance::new(addr.clone())))
                    .clone()
            })
            .collect();
        let router = BalancedRouter::new(config.name.clone(), instances);
        self.insert(Namespace::new(config.name.clone(), Arc::new(router)));
    }

    /// Add or replace a namespace
    pub fn insert(&self, namespace: Namespace) {
        self.namespaces
            .insert(namespace.name().to_string(), Arc::new(namespace));
    }

    /// Resolve a namespace identifier; the empty identifier is the default
    pub fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        let key = if name.is_empty() {
            self.default_namespace.as_str()
        } else {
            name
        };
        self.namespaces.get(key).map(|ns| ns.clone())
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.iter().map(|e| e.key().clone()).collect()
    }

    /// Every distinct backend, for the health checker
    pub fn instances(&self) -> Vec<Arc<BackendInstance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::router::tests::TestConn;

    fn config() -> Config {
        Config {
            default_namespace: "main".to_string(),
            namespaces: vec![
                NamespaceConfig {
                    name: "main".to_string(),
                    backends: vec!["10.0.0.1:3306".to_string(), "10.0.0.2:3306".to_string()],
                },
                NamespaceConfig {
                    name: "reports".to_string(),
                    backends: vec!["10.0.0.2:3306".to_string()],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_identifier_resolves_default() {
        let manager = NamespaceManager::from_config(&config());
        let ns = manager.get_namespace("").unwrap();
        assert_eq!(ns.name(), "main");
        assert_eq!(manager.get_namespace("reports").unwrap().name(), "reports");
        assert!(manager.get_namespace("missing").is_none());
    }

    #[test]
    fn test_missing_default_namespace() {
        let manager = NamespaceManager::new("default");
        assert!(manager.get_namespace("").is_none());
    }

    #[test]
    fn test_shared_backends_are_deduplicated() {
        let manager = NamespaceManager::from_config(&config());
        assert_eq!(manager.instances().len(), 2);
        let mut names = manager.namespace_names();
        names.sort();
        assert_eq!(names, vec!["main", "reports"]);
    }

    #[test]
    fn test_health_is_shared_across_namespaces() {
        let manager = NamespaceManager::from_config(&config());
        for inst in manager.instances() {
            if inst.addr() == "10.0.0.2:3306" {
                inst.set_healthy(false);
            }
        }

        let reports = manager.get_namespace("reports").unwrap();
        assert!(reports.router().route(&TestConn::new(1)).is_err());

        let main = manager.get_namespace("").unwrap();
        assert_eq!(main.router().route(&TestConn::new(2)).unwrap(), "10.0.0.1:3306");
    }

    #[test]
    fn test_default_config_namespace() {
        let manager = NamespaceManager::from_config(&Config::default());
        let ns = manager.get_namespace("").unwrap();
        assert_eq!(ns.router().route(&TestConn::new(1)).unwrap(), "127.0.0.1:3306");
    }
}
