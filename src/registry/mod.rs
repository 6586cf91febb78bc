// src/registry/mod.rs
//! Process-wide catalog of pluggable components
//!
//! The registry maps string keys to capability bundles for five extension
//! kinds: models, features, real-time filters, visual interfaces and output
//! systems. Registration is an explicit initialization phase: built-in
//! defaults first, user extensions second, then the registry is shared
//! read-only behind an `Arc`. Later registrations for the same key overwrite
//! earlier ones (last writer wins) and fire a warning.

pub mod defaults;
pub mod kinds;

use kinds::{
    FeatureKind, FilterKind, ModelKind, OutputSystem, VisualInterfaceDescriptor,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Registry lookup errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown {kind} key: \"{key}\"")]
    UnknownKey { kind: &'static str, key: String },
}

/// Insertion-ordered string-keyed map.
///
/// Overwriting an existing key keeps its original position so UI listings
/// stay stable across re-registration.
struct OrderedMap<T> {
    order: Vec<String>,
    entries: HashMap<String, T>,
}

impl<T> OrderedMap<T> {
    fn new() -> Self {
        Self { order: Vec::new(), entries: HashMap::new() }
    }

    /// Insert or overwrite; returns whether a previous entry was replaced
    fn insert(&mut self, key: &str, value: T) -> bool {
        let replaced = self.entries.insert(key.to_string(), value).is_some();
        if !replaced {
            self.order.push(key.to_string());
        }
        replaced
    }

    fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }
}

/// The registry context object
pub struct Registry {
    models: OrderedMap<Arc<dyn ModelKind>>,
    features: OrderedMap<Arc<dyn FeatureKind>>,
    filters: OrderedMap<Arc<dyn FilterKind>>,
    visual_interfaces: OrderedMap<VisualInterfaceDescriptor>,
    output_systems: OrderedMap<Arc<dyn OutputSystem>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry with no kinds registered
    pub fn new() -> Self {
        Self {
            models: OrderedMap::new(),
            features: OrderedMap::new(),
            filters: OrderedMap::new(),
            visual_interfaces: OrderedMap::new(),
            output_systems: OrderedMap::new(),
        }
    }

    /// Registry pre-populated with the built-in defaults
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        defaults::register_defaults(&mut registry);
        registry
    }

    pub fn register_model(&mut self, key: &str, model: Arc<dyn ModelKind>) -> bool {
        let replaced = self.models.insert(key, model);
        if replaced {
            warn!(key, kind = "model", "duplicate registration, overwriting previous entry");
        }
        replaced
    }

    pub fn register_feature(&mut self, key: &str, feature: Arc<dyn FeatureKind>) -> bool {
        let replaced = self.features.insert(key, feature);
        if replaced {
            warn!(key, kind = "feature", "duplicate registration, overwriting previous entry");
        }
        replaced
    }

    pub fn register_filter(&mut self, key: &str, filter: Arc<dyn FilterKind>) -> bool {
        let replaced = self.filters.insert(key, filter);
        if replaced {
            warn!(key, kind = "filter", "duplicate registration, overwriting previous entry");
        }
        replaced
    }

    pub fn register_visual_interface(
        &mut self,
        key: &str,
        descriptor: VisualInterfaceDescriptor,
    ) -> bool {
        let replaced = self.visual_interfaces.insert(key, descriptor);
        if replaced {
            warn!(
                key,
                kind = "visual_interface",
                "duplicate registration, overwriting previous entry"
            );
        }
        replaced
    }

    pub fn register_output_system(&mut self, key: &str, system: Arc<dyn OutputSystem>) -> bool {
        let replaced = self.output_systems.insert(key, system);
        if replaced {
            warn!(key, kind = "output_system", "duplicate registration, overwriting previous entry");
        }
        replaced
    }

    pub fn get_model(&self, key: &str) -> Result<Arc<dyn ModelKind>, RegistryError> {
        self.models
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownKey { kind: "model", key: key.to_string() })
    }

    pub fn get_feature(&self, key: &str) -> Result<Arc<dyn FeatureKind>, RegistryError> {
        self.features
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownKey { kind: "feature", key: key.to_string() })
    }

    pub fn get_filter(&self, key: &str) -> Result<Arc<dyn FilterKind>, RegistryError> {
        self.filters
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownKey { kind: "filter", key: key.to_string() })
    }

    pub fn get_visual_interface(
        &self,
        key: &str,
    ) -> Result<VisualInterfaceDescriptor, RegistryError> {
        self.visual_interfaces.get(key).cloned().ok_or_else(|| RegistryError::UnknownKey {
            kind: "visual_interface",
            key: key.to_string(),
        })
    }

    pub fn get_output_system(&self, key: &str) -> Result<Arc<dyn OutputSystem>, RegistryError> {
        self.output_systems.get(key).cloned().ok_or_else(|| RegistryError::UnknownKey {
            kind: "output_system",
            key: key.to_string(),
        })
    }

    pub fn list_models(&self) -> impl Iterator<Item = &str> + '_ {
        self.models.keys()
    }

    pub fn list_features(&self) -> impl Iterator<Item = &str> + '_ {
        self.features.keys()
    }

    pub fn list_filters(&self) -> impl Iterator<Item = &str> + '_ {
        self.filters.keys()
    }

    pub fn list_visual_interfaces(&self) -> impl Iterator<Item = &str> + '_ {
        self.visual_interfaces.keys()
    }

    pub fn list_output_systems(&self) -> impl Iterator<Item = &str> + '_ {
        self.output_systems.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FilteredPrediction, TaskCategory};
    use kinds::{OutputError, VisualInterfaceDescriptor};
    /// No-op output system used for identity checks
    struct Marker;

    impl Marker {
        fn new(_id: u64) -> Arc<Self> {
            Arc::new(Self)
        }
    }

    impl OutputSystem for Marker {
        fn route(&self, _prediction: &FilteredPrediction) -> Result<(), OutputError> {
            Ok(())
        }
    }

    fn descriptor() -> VisualInterfaceDescriptor {
        VisualInterfaceDescriptor {
            task_category: TaskCategory::HandGestures,
            endpoint: "127.0.0.1:1236".parse().unwrap(),
            launch: None,
        }
    }

    #[test]
    fn test_listing_preserves_insertion_order() {
        let mut registry = Registry::new();
        registry.register_output_system("c", Marker::new(1));
        registry.register_output_system("a", Marker::new(2));
        registry.register_output_system("b", Marker::new(3));

        let keys: Vec<&str> = registry.list_output_systems().collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_overwrite_keeps_position_and_wins() {
        let mut registry = Registry::new();
        assert!(!registry.register_output_system("a", Marker::new(1)));
        assert!(!registry.register_output_system("b", Marker::new(2)));
        // last writer wins, position unchanged
        let winner: Arc<dyn OutputSystem> = Marker::new(3);
        assert!(registry.register_output_system("a", winner.clone()));

        let keys: Vec<&str> = registry.list_output_systems().collect();
        assert_eq!(keys, vec!["a", "b"]);

        let got = registry.get_output_system("a").unwrap();
        assert!(Arc::ptr_eq(&got, &winner));
    }

    #[test]
    fn test_unknown_key() {
        let registry = Registry::new();
        let err = registry.get_model("nope").err().unwrap();
        assert!(err.to_string().contains("unknown model key"));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_visual_interface_roundtrip() {
        let mut registry = Registry::new();
        registry.register_visual_interface("virtual_hand", descriptor());
        let vi = registry.get_visual_interface("virtual_hand").unwrap();
        assert_eq!(vi.task_category, TaskCategory::HandGestures);
    }

    proptest::proptest! {
        /// Whatever the registration sequence, listing order is the order
        /// of first appearance and duplicates keep their slot
        #[test]
        fn prop_listing_is_first_occurrence_order(
            keys in proptest::collection::vec("[a-z]{1,8}", 1..20)
        ) {
            let mut registry = Registry::new();
            for key in &keys {
                registry.register_feature(key, Arc::new(defaults::RmsFeature));
            }

            let mut expected: Vec<&str> = Vec::new();
            for key in &keys {
                if !expected.contains(&key.as_str()) {
                    expected.push(key);
                }
            }
            let listed: Vec<&str> = registry.list_features().collect();
            proptest::prop_assert_eq!(listed, expected);
        }
    }

    #[test]
    fn test_defaults_are_deterministic() {
        let a = Registry::with_defaults();
        let b = Registry::with_defaults();
        let keys_a: Vec<&str> = a.list_features().collect();
        let keys_b: Vec<&str> = b.list_features().collect();
        assert_eq!(keys_a, keys_b);
        assert!(!keys_a.is_empty());
    }
}
