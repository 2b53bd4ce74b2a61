//! Loading and representing the host-configuration file.
//!
//! This is the one JSON-shaped boundary the core trusts without further
//! validation beyond basic shape checks: identity and configuration only, no
//! runtime state.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::ConfigError;

/// A single configured fleet member.
///
/// Immutable after load. A host with an empty `checks` map is *inert*: it
/// is still displayed by the API but no worker thread touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// The host's key in the host file; not repeated inside the object
    /// itself but carried here for convenience once loaded.
    #[serde(skip)]
    pub name: String,
    /// Optional network address (hostname or IP); purely informational to
    /// the core — individual check configs carry their own targets.
    #[serde(default)]
    pub address: Option<String>,
    /// Free-form key→value tags, used by the API's `tag=` filter.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Check-type name → that check type's factory configuration object.
    #[serde(default)]
    pub checks: HashMap<String, Map<String, Value>>,
    /// Unrecognized top-level fields, preserved verbatim but otherwise
    /// ignored by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Host {
    /// Whether this host has at least one declared check.
    pub fn is_inert(&self) -> bool {
        self.checks.is_empty()
    }
}

/// The full, loaded host-configuration file: host name → [`Host`].
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    hosts: HashMap<String, Host>,
}

impl FleetConfig {
    /// Load and validate a host-configuration file at `path`.
    ///
    /// The top-level document must be a JSON object mapping host names to
    /// host objects; each host object's `checks` entries must themselves
    /// be JSON objects (the recognised keys inside are check-type
    /// specific and validated later, at instantiation).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse an already-read host-configuration document.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct RawHost {
            #[serde(default)]
            address: Option<String>,
            #[serde(default)]
            tags: HashMap<String, String>,
            #[serde(default)]
            checks: Map<String, Value>,
            #[serde(flatten)]
            extra: Map<String, Value>,
        }

        let document: Map<String, Value> = serde_json::from_str(raw)?;
        let mut hosts = HashMap::with_capacity(document.len());
        for (name, value) in document {
            let raw_host: RawHost = serde_json::from_value(value)?;
            let mut checks = HashMap::with_capacity(raw_host.checks.len());
            for (check_type, cfg) in raw_host.checks {
                let cfg = cfg.as_object().cloned().ok_or_else(|| {
                    ConfigError::InvalidCheckConfig {
                        host: name.clone(),
                        check_type: check_type.clone(),
                    }
                })?;
                checks.insert(check_type, cfg);
            }
            hosts.insert(
                name.clone(),
                Host {
                    name,
                    address: raw_host.address,
                    tags: raw_host.tags,
                    checks,
                    extra: raw_host.extra,
                },
            );
        }
        for host in hosts.values().filter(|h| h.is_inert()) {
            warn!("host '{}' declares no checks; it will be inert", host.name);
        }
        Ok(Self { hosts })
    }

    /// Iterate over all configured hosts.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// Look up a single host by name.
    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Number of configured hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the host file declared zero hosts.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_host() {
        let raw = r#"{
            "google": {
                "address": "8.8.8.8",
                "checks": { "ping": { "timeout_secs": 5 } }
            }
        }"#;
        let cfg = FleetConfig::parse(raw).unwrap();
        let host = cfg.get("google").unwrap();
        assert_eq!(host.address.as_deref(), Some("8.8.8.8"));
        assert!(!host.is_inert());
    }

    #[test]
    fn host_with_no_checks_is_inert() {
        let raw = r#"{ "spare": {} }"#;
        let cfg = FleetConfig::parse(raw).unwrap();
        assert!(cfg.get("spare").unwrap().is_inert());
    }

    #[test]
    fn unrecognised_top_level_fields_are_preserved_not_rejected() {
        let raw = r#"{ "a": { "address": "1.2.3.4", "note": "scratch host" } }"#;
        let cfg = FleetConfig::parse(raw).unwrap();
        let host = cfg.get("a").unwrap();
        assert_eq!(host.extra.get("note").and_then(|v| v.as_str()), Some("scratch host"));
    }

    #[test]
    fn non_object_check_config_is_rejected() {
        let raw = r#"{ "a": { "checks": { "ping": "not-an-object" } } }"#;
        let err = FleetConfig::parse(raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCheckConfig { .. }));
    }

    #[test]
    fn unknown_host_lookup_returns_none() {
        let cfg = FleetConfig::parse("{}").unwrap();
        assert!(cfg.get("nope").is_none());
    }
}
