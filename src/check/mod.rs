//! The check contract: [`Descriptor`], [`CheckResult`] and the [`Check`] trait
//! itself, plus the four concrete check implementations.
//!
//! Every check type lives in its own submodule and registers a factory with
//! the [registry](crate::registry) at process startup (see
//! [`register_builtin_checks`]). A check instance is constructed once per
//! host and retained for the process lifetime; see [`Check::run`].

#[cfg(feature = "dns-check")]
pub mod dns;
#[cfg(feature = "http-check")]
pub mod http;
#[cfg(feature = "ping-check")]
pub mod ping;
#[cfg(feature = "wifi-check")]
pub mod wifi;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::CheckError;
use crate::registry::Registry;

/// How a check's metrics should be drawn on its RRD graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GraphStyle {
    /// First metric as an AREA, the rest STACKed on top. Appropriate when
    /// metrics are parts of a whole (e.g. per-radio station counts).
    Stacked,
    /// Every metric its own independent LINE. Appropriate for unrelated
    /// per-target measurements (per-URL latency, per-query RTT).
    Line,
}

/// One metric a check instance produces.
///
/// `result_key` is the key used in
/// [`CheckResult::metrics`], `storage_key` is the RRD data-source name
/// (must be a short alphanumeric+underscore token), `scale` of `S > 1`
/// means the raw stored value must be divided by `S` for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDef {
    /// Key used in [`CheckResult::metrics`]
    pub result_key: String,
    /// Data-source name in the backing RRD file
    pub storage_key: String,
    /// Human label, e.g. "Latency"
    pub label: String,
    /// Display unit, e.g. "ms"
    pub unit: String,
    /// Divide the raw stored value by this to get the displayed value.
    /// `<= 1` means "stored value is the display value".
    pub scale: u32,
}

impl MetricDef {
    /// Convenience constructor for a 1:1 (unscaled) metric.
    pub fn new(
        result_key: impl Into<String>,
        storage_key: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            result_key: result_key.into(),
            storage_key: storage_key.into(),
            label: label.into(),
            unit: unit.into(),
            scale: 1,
        }
    }

    /// Convenience constructor for a scaled metric (e.g. stored
    /// microseconds, displayed milliseconds with `scale = 1000`).
    pub fn scaled(
        result_key: impl Into<String>,
        storage_key: impl Into<String>,
        label: impl Into<String>,
        unit: impl Into<String>,
        scale: u32,
    ) -> Self {
        Self {
            result_key: result_key.into(),
            storage_key: storage_key.into(),
            label: label.into(),
            unit: unit.into(),
            scale,
        }
    }
}

/// Per-instance declaration of what a check produces.
///
/// Config-dependent: a check with N targets (N URLs, N DNS queries, N
/// monitored radios) exposes N [`MetricDef`]s.
/// "Dynamic metric shapes".
#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    /// The metrics this instance produces, in stable declared order.
    /// [`crate::worker`] relies on this order to build the positional
    /// value slice passed to [`crate::rrd::RrdAdapter::safe_update`].
    pub metrics: Vec<MetricDef>,
    /// Rendering hint: how to lay out this check's metrics on a graph.
    pub style: GraphStyle,
    /// Optional human label for the whole check (used as a graph title
    /// suffix); defaults to the check type name if absent.
    pub label: Option<String>,
}

/// Outcome of one [`Check::run`] invocation.
///
/// Invariants:
/// - keys present in `metrics` are a subset of the descriptor's `result_key`s
/// - an absent key means "not attempted"
/// - a present `None` value means "attempted, failed, no value"
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Wall-clock time the probe began (or was attempted).
    pub timestamp: DateTime<Utc>,
    /// Whether the check as a whole succeeded. Check types decide their
    /// own semantics for partial success.
    pub success: bool,
    /// Human-readable error, set whenever any part of the probe failed,
    /// even if `success` ended up true for some other reason.
    pub error: Option<String>,
    /// Metric map keyed by `result_key`. `Some(value)` is a measurement,
    /// `None` is "attempted but missing".
    pub metrics: HashMap<String, Option<i64>>,
}

impl CheckResult {
    /// Start building a result for a probe that begins now.
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            success: false,
            error: None,
            metrics: HashMap::new(),
        }
    }

    /// Record a successful measurement for `result_key`.
    pub fn record(&mut self, result_key: impl Into<String>, value: i64) {
        self.metrics.insert(result_key.into(), Some(value));
    }

    /// Record that `result_key` was attempted but produced no value.
    pub fn record_missing(&mut self, result_key: impl Into<String>) {
        self.metrics.insert(result_key.into(), None);
    }

    /// Positional values aligned with `defs`, using `None` for metrics
    /// that are absent from this result (i.e. "not attempted", which the
    /// RRD adapter also renders as unknown).
    pub fn values_for(&self, defs: &[MetricDef]) -> Vec<Option<i64>> {
        defs.iter()
            .map(|d| self.metrics.get(&d.result_key).copied().flatten())
            .collect()
    }
}

/// Cancellation/deadline context threaded through a single [`Check::run`]
/// call. The worker fleet shares one [`CheckContext::shutdown`] flag across
/// every check on every host; an individual check also carries its own
/// per-instance timeout (set at construction).
#[derive(Clone)]
pub struct CheckContext {
    shutdown: Arc<AtomicBool>,
}

impl CheckContext {
    /// Build a context around a shared shutdown flag.
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self { shutdown }
    }

    /// A context that never reports cancellation; for tests.
    pub fn noop() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }

    /// Whether the process-wide shutdown signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// A stateless-per-invocation probe bound to one host's configuration.
///
/// Implementations must respect `ctx`'s cancellation: a timeout or
/// cancellation translates into a failure [`CheckResult`], never a panic.
pub trait Check: Send + Sync {
    /// The registered name of this check's type, e.g. `"ping"`.
    fn type_name(&self) -> &'static str;

    /// The final, possibly config-dependent, descriptor for this instance.
    fn describe(&self) -> Descriptor;

    /// Execute one probe. Must never panic; all failure modes are
    /// expressed through the returned [`CheckResult`].
    fn run(&self, ctx: &CheckContext) -> CheckResult;
}

/// Register the four built-in check types (`ping`, `http`, `wifi_stations`,
/// `dns`) with `registry`. Called once at daemon startup.
pub fn register_builtin_checks(registry: &Registry) {
    #[cfg(feature = "ping-check")]
    ping::register(registry);
    #[cfg(feature = "http-check")]
    http::register(registry);
    #[cfg(feature = "wifi-check")]
    wifi::register(registry);
    #[cfg(feature = "dns-check")]
    dns::register(registry);
}

/// Shared helper: pull a required string field out of a factory config map.
pub(crate) fn require_str<'a>(
    cfg: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
    check_type: &str,
) -> Result<&'a str, CheckError> {
    cfg.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CheckError::Parse(format!("{check_type}: missing or non-string '{key}'")))
}

/// Shared helper: read an optional timeout (seconds) from a factory config
/// map, falling back to `default`.
pub(crate) fn read_timeout(
    cfg: &serde_json::Map<String, serde_json::Value>,
    default: Duration,
) -> Duration {
    cfg.get("timeout_secs")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Whether this check's factory-config carries `"enabled": false` (the
/// cross-cutting convention).
pub fn is_enabled(cfg: &serde_json::Map<String, serde_json::Value>) -> bool {
    cfg.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true)
}
