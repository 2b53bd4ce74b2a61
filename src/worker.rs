//! The Worker Fleet: one OS thread per configured host, running that
//! host's checks sequentially once per round.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::check::{Check, CheckContext};
use crate::config::Host;
use crate::registry::Registry;
use crate::rrd::RrdAdapter;
use crate::status::{HostStatusMap, Status};

/// Wall-clock interval between check rounds for every worker.
const ROUND_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound (inclusive) of the startup jitter sleep.
const MAX_JITTER_SECS: u64 = 59;

/// One (check, storage, status) triple a worker drives every round.
struct Instance {
    check_type: String,
    check: Box<dyn Check>,
    metrics: Vec<crate::check::MetricDef>,
    rrd: RrdAdapter,
    status: Arc<Status>,
}

/// Runtime handle to a single host's worker thread.
pub struct Worker {
    host_name: String,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Signal this worker to stop after its current round.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// The host this worker is responsible for.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }
}

/// Inject `target` into a copy of the user's per-check configuration
/// without mutating the original.
fn with_target(cfg: &Map<String, Value>, target: &str) -> Map<String, Value> {
    let mut cfg = cfg.clone();
    cfg.entry("target".to_string())
        .or_insert_with(|| Value::String(target.to_string()));
    cfg
}

/// Spawn the worker thread for `host` and return a handle plus the shared
/// status map the HTTP layer reads from.
pub fn spawn(
    host: Host,
    registry: Arc<Registry>,
    data_dir: PathBuf,
    shutdown: Arc<AtomicBool>,
) -> (Worker, Arc<RwLock<HostStatusMap>>) {
    let statuses: Arc<RwLock<HostStatusMap>> = Arc::new(RwLock::new(HostStatusMap::new()));
    let worker = Worker {
        host_name: host.name.clone(),
        shutdown: Arc::clone(&shutdown),
    };

    let statuses_for_thread = Arc::clone(&statuses);
    std::thread::Builder::new()
        .name(format!("worker-{}", host.name))
        .spawn(move || run(host, registry, data_dir, shutdown, statuses_for_thread))
        .expect("failed to spawn worker thread");

    (worker, statuses)
}

fn sleep_cancellable(duration: Duration, shutdown: &AtomicBool) {
    const POLL: Duration = Duration::from_millis(250);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let step = remaining.min(POLL);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn run(
    host: Host,
    registry: Arc<Registry>,
    data_dir: PathBuf,
    shutdown: Arc<AtomicBool>,
    statuses: Arc<RwLock<HostStatusMap>>,
) {
    if host.is_inert() {
        info!("host '{}' has no checks configured; worker exiting", host.name);
        return;
    }

    let jitter = rand::thread_rng().gen_range(1..=MAX_JITTER_SECS);
    sleep_cancellable(Duration::from_secs(jitter), &shutdown);
    if shutdown.load(Ordering::Relaxed) {
        return;
    }

    let target = host.address.clone().unwrap_or_else(|| host.name.clone());
    let mut instances = Vec::new();

    for (check_type, cfg) in &host.checks {
        let factory_cfg = with_target(cfg, &target);
        let check = match registry.create(check_type, &factory_cfg) {
            Ok(check) => check,
            Err(err) => {
                warn!("host '{}': could not create check '{check_type}': {err}", host.name);
                continue;
            }
        };
        let descriptor = check.describe();
        let rrd = match RrdAdapter::new(&data_dir, &host.name, check_type, descriptor.metrics.clone(), descriptor.style) {
            Ok(rrd) => rrd,
            Err(err) => {
                warn!("host '{}': could not initialize storage for '{check_type}': {err}", host.name);
                continue;
            }
        };
        let status = Arc::new(Status::new());
        statuses
            .write()
            .expect("status map lock poisoned")
            .insert(check_type.clone(), Arc::clone(&status));
        instances.push(Instance {
            check_type: check_type.clone(),
            check,
            metrics: descriptor.metrics,
            rrd,
            status,
        });
    }

    let ctx = CheckContext::new(Arc::clone(&shutdown));
    while !shutdown.load(Ordering::Relaxed) {
        for instance in &instances {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let result = instance.check.run(&ctx);
            let values = if result.metrics.is_empty() && !result.success {
                Vec::new()
            } else {
                result.values_for(&instance.metrics)
            };
            let timestamp = result.timestamp;
            instance.status.set_result(result);

            match instance.rrd.safe_update(timestamp, &values) {
                Ok(ts) => instance.status.set_last_update(ts),
                Err(err) => warn!(
                    "host '{}': storage update for '{}' failed: {err}",
                    host.name, instance.check_type
                ),
            }
        }
        sleep_cancellable(ROUND_INTERVAL, &shutdown);
    }
    info!("worker for host '{}' shutting down", host.name);
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_target_does_not_mutate_original_and_does_not_override_explicit() {
        let cfg = json!({"timeout_secs": 5}).as_object().unwrap().clone();
        let injected = with_target(&cfg, "1.2.3.4");
        assert_eq!(injected.get("target").and_then(|v| v.as_str()), Some("1.2.3.4"));
        assert!(!cfg.contains_key("target"));

        let explicit = json!({"target": "explicit.example"}).as_object().unwrap().clone();
        let injected = with_target(&explicit, "1.2.3.4");
        assert_eq!(injected.get("target").and_then(|v| v.as_str()), Some("explicit.example"));
    }
}
