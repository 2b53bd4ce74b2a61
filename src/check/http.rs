//! HTTP reachability check: one `curl::easy::Easy` transfer per configured
//! URL, timing the full request/response round trip. Redirects are not
//! followed and TLS verification is disabled, since targets are often
//! self-signed fleet devices rather than public endpoints.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use curl::easy::Easy;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{is_enabled, read_timeout, Check, CheckContext, CheckResult, Descriptor, MetricDef};
use crate::errors::{CheckError, RegistryError};
use crate::registry::Registry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One URL target within an `http` check instance.
struct Target {
    /// Key in [`CheckResult::metrics`], e.g. `"url_0"`.
    result_key: String,
    url: String,
}

/// An HTTP check bound to one or more URLs on a single host.
pub struct HttpCheck {
    targets: Vec<Target>,
    timeout: Duration,
}

impl HttpCheck {
    /// Perform one GET, returning the elapsed round trip in microseconds.
    /// Redirects are not followed and any response code counts as
    /// reachable: only the transfer itself failing is an error.
    fn probe_one(&self, target: &Target) -> Result<u64, CheckError> {
        let mut handle = Easy::new();
        handle.url(&target.url)?;
        handle.follow_location(false)?;
        handle.ssl_verify_peer(false)?;
        handle.ssl_verify_host(false)?;
        handle.timeout(self.timeout)?;

        let start = Instant::now();
        handle.perform()?;
        let elapsed = start.elapsed();

        // perform() succeeding means a response was received; any status
        // code (including 4xx/5xx) counts as reachable.
        let _status = handle.response_code()?;
        Ok(elapsed.as_micros() as u64)
    }
}

impl Check for HttpCheck {
    fn type_name(&self) -> &'static str {
        "http"
    }

    fn describe(&self) -> Descriptor {
        Descriptor {
            metrics: self
                .targets
                .iter()
                .map(|t| MetricDef::scaled(&t.result_key, &t.result_key, &t.url, "ms", 1000))
                .collect(),
            style: super::GraphStyle::Line,
            label: None,
        }
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let mut result = CheckResult::started(Utc::now());
        let mut all_ok = true;
        for target in &self.targets {
            if ctx.is_cancelled() {
                all_ok = false;
                result.record_missing(&target.result_key);
                continue;
            }
            debug!("probing http target {}", target.url);
            match self.probe_one(target) {
                Ok(elapsed_us) => {
                    result.record(&target.result_key, elapsed_us as i64);
                }
                Err(err) => {
                    warn!("http check against '{}' failed: {err}", target.url);
                    result.error = Some(match &result.error {
                        Some(existing) => format!("{existing}; {err}"),
                        None => err.to_string(),
                    });
                    all_ok = false;
                    result.record_missing(&target.result_key);
                }
            }
        }
        result.success = all_ok;
        result
    }
}

/// Register the `http` check type factory with `registry`.
pub fn register(registry: &Registry) {
    let factory = Arc::new(|cfg: &Map<String, Value>| -> Result<Box<dyn Check>, RegistryError> {
        if !is_enabled(cfg) {
            return Err(RegistryError::InvalidConfig {
                check_type: "http".into(),
                reason: "disabled".into(),
            });
        }
        let urls = cfg
            .get("urls")
            .and_then(|v| v.as_array())
            .ok_or_else(|| RegistryError::InvalidConfig {
                check_type: "http".into(),
                reason: "missing 'urls' array".into(),
            })?;
        if urls.is_empty() {
            return Err(RegistryError::InvalidConfig {
                check_type: "http".into(),
                reason: "'urls' must not be empty".into(),
            });
        }
        let targets = urls
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str()
                    .map(|url| Target {
                        result_key: format!("url_{i}"),
                        url: url.to_string(),
                    })
                    .ok_or_else(|| RegistryError::InvalidConfig {
                        check_type: "http".into(),
                        reason: format!("'urls[{i}]' is not a string"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let timeout = read_timeout(cfg, DEFAULT_TIMEOUT);
        Ok(Box::new(HttpCheck { targets, timeout }))
    });
    registry
        .register(
            "http",
            factory,
            Descriptor {
                metrics: vec![],
                style: super::GraphStyle::Line,
                label: None,
            },
        )
        .expect("http registered twice");
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_empty_urls() {
        let registry = Registry::new();
        register(&registry);
        let cfg = json!({"urls": []}).as_object().unwrap().clone();
        let err = registry.create("http", &cfg).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig { .. }));
    }

    #[test]
    fn descriptor_has_one_metric_per_url() {
        let registry = Registry::new();
        register(&registry);
        let cfg = json!({"urls": ["https://a.example/", "https://b.example/"]})
            .as_object()
            .unwrap()
            .clone();
        let check = registry.create("http", &cfg).unwrap();
        assert_eq!(check.describe().metrics.len(), 2);
    }

    #[test]
    fn metric_is_microseconds_stored_milliseconds_displayed() {
        let registry = Registry::new();
        register(&registry);
        let cfg = json!({"urls": ["https://a.example/"]}).as_object().unwrap().clone();
        let check = registry.create("http", &cfg).unwrap();
        let metric = &check.describe().metrics[0];
        assert_eq!(metric.unit, "ms");
        assert_eq!(metric.scale, 1000);
    }

    /// Scenario B: one URL reachable, one not. Overall `success` must be
    /// false even though the reachable URL's metric is present — only
    /// `wifi_stations` uses an any-of-N success rule, not `http`.
    #[test]
    fn partial_failure_is_not_overall_success() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        });

        // A port nothing is listening on: bind then immediately drop, so
        // connecting to it is refused rather than hanging.
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let registry = Registry::new();
        register(&registry);
        let cfg = json!({
            "urls": [
                format!("http://127.0.0.1:{port}/"),
                format!("http://127.0.0.1:{dead_port}/"),
            ],
            "timeout_secs": 2,
        })
        .as_object()
        .unwrap()
        .clone();
        let check = registry.create("http", &cfg).unwrap();
        let result = check.run(&CheckContext::noop());
        server.join().unwrap();

        assert!(!result.success);
        assert!(result.metrics.get("url_0").copied().flatten().is_some());
        assert_eq!(result.metrics.get("url_1").copied(), Some(None));
    }
}
