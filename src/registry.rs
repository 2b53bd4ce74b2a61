//! The Check Registry: name → (factory, provisional descriptor).
//!
//! Decouples type declaration from instance construction so the worker
//! fleet and RRD adapter can be wired generically from each instance's
//! [`Descriptor`](crate::check::Descriptor), with no per-type code at the
//! worker layer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Map as JsonMap;
use serde_json::Value;

use crate::check::{Check, Descriptor};
use crate::errors::RegistryError;

/// A factory turns an untyped configuration map into a boxed [`Check`], or
/// fails with [`RegistryError::InvalidConfig`].
pub type Factory =
    Arc<dyn Fn(&JsonMap<String, Value>) -> Result<Box<dyn Check>, RegistryError> + Send + Sync>;

struct Entry {
    factory: Factory,
    provisional: Descriptor,
}

/// Thread-safe name → (factory, provisional descriptor) table.
///
/// Concurrent [`Registry::create`] calls are permitted; registration is
/// expected to happen once at startup but is itself thread-safe.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a check type. Fails with
    /// [`RegistryError::AlreadyRegistered`] if `name` is taken.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: Factory,
        provisional: Descriptor,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut entries = self.entries.write().expect("registry lock poisoned");
        if entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        entries.insert(
            name,
            Entry {
                factory,
                provisional,
            },
        );
        Ok(())
    }

    /// Instantiate a fresh [`Check`] of type `name` from `config`.
    ///
    /// Fails with [`RegistryError::UnknownType`] if no such type is
    /// registered, or propagates the factory's
    /// [`RegistryError::InvalidConfig`].
    pub fn create(
        &self,
        name: &str,
        config: &JsonMap<String, Value>,
    ) -> Result<Box<dyn Check>, RegistryError> {
        let factory = {
            let entries = self.entries.read().expect("registry lock poisoned");
            entries
                .get(name)
                .map(|e| e.factory.clone())
                .ok_or_else(|| RegistryError::UnknownType(name.to_string()))?
        };
        (factory)(config)
    }

    /// The provisional descriptor registered for `name`, used only when
    /// the final per-instance descriptor is not yet available (e.g.
    /// before any instance of this type has been constructed).
    pub fn describe(&self, name: &str) -> Option<Descriptor> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.get(name).map(|e| e.provisional.clone())
    }

    /// All registered check-type names.
    pub fn types(&self) -> Vec<String> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::check::{CheckContext, CheckResult, GraphStyle};

    struct Dummy;
    impl Check for Dummy {
        fn type_name(&self) -> &'static str {
            "dummy"
        }
        fn describe(&self) -> Descriptor {
            Descriptor {
                metrics: vec![],
                style: GraphStyle::Line,
                label: None,
            }
        }
        fn run(&self, _ctx: &CheckContext) -> CheckResult {
            CheckResult::started(chrono::Utc::now())
        }
    }

    fn dummy_descriptor() -> Descriptor {
        Descriptor {
            metrics: vec![],
            style: GraphStyle::Line,
            label: None,
        }
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let reg = Registry::new();
        let factory: Factory = Arc::new(|_cfg| Ok(Box::new(Dummy) as Box<dyn Check>));
        reg.register("dummy", factory.clone(), dummy_descriptor())
            .unwrap();
        let err = reg
            .register("dummy", factory, dummy_descriptor())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn create_unknown_type_fails() {
        let reg = Registry::new();
        let err = reg.create("nope", &JsonMap::new()).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType(_)));
    }

    #[test]
    fn concurrent_create_calls_do_not_corrupt_state() {
        let reg = Arc::new(Registry::new());
        let factory: Factory = Arc::new(|_cfg| Ok(Box::new(Dummy) as Box<dyn Check>));
        reg.register("dummy", factory, dummy_descriptor()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    assert!(reg.create("dummy", &JsonMap::new()).is_ok());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
