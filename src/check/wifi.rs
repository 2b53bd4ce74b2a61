//! `wifi_stations` check: scrapes a Prometheus text-exposition endpoint
//! (typically a device's own `/metrics`) and pulls out
//! `wifi_stations{ifname="<name>"} <count>` samples for a configured set
//! of interfaces.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use curl::easy::Easy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::{is_enabled, read_timeout, require_str, Check, CheckContext, CheckResult, Descriptor, MetricDef};
use crate::errors::{CheckError, RegistryError};
use crate::registry::Registry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn station_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^wifi_stations\{[^}]*ifname="([^"]+)"[^}]*\}\s+(\d+)"#)
            .expect("valid regex")
    })
}

/// Scrape `url`, requiring an HTTP 200 response.
fn fetch(url: &str, timeout: Duration) -> Result<String, CheckError> {
    let mut handle = Easy::new();
    handle.url(url)?;
    handle.follow_location(false)?;
    handle.timeout(timeout)?;
    let mut body = Vec::new();
    {
        let mut transfer = handle.transfer();
        transfer.write_function(|data| {
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform()?;
    }
    let status = handle.response_code()?;
    if status != 200 {
        return Err(CheckError::Parse(format!(
            "unexpected status {status} from {url}"
        )));
    }
    String::from_utf8(body).map_err(|e| CheckError::Parse(format!("non-utf8 response: {e}")))
}

/// A `wifi_stations` check bound to a scrape URL and a set of interfaces.
pub struct WifiStationsCheck {
    url: String,
    ifnames: Vec<String>,
    timeout: Duration,
}

impl Check for WifiStationsCheck {
    fn type_name(&self) -> &'static str {
        "wifi_stations"
    }

    fn describe(&self) -> Descriptor {
        Descriptor {
            metrics: self
                .ifnames
                .iter()
                .map(|ifname| {
                    MetricDef::new(
                        format!("stations_{ifname}"),
                        format!("st_{ifname}"),
                        format!("Stations ({ifname})"),
                        "count",
                    )
                })
                .collect(),
            style: super::GraphStyle::Stacked,
            label: None,
        }
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let mut result = CheckResult::started(Utc::now());
        if ctx.is_cancelled() {
            for ifname in &self.ifnames {
                result.record_missing(format!("stations_{ifname}"));
            }
            return result;
        }

        let body = match fetch(&self.url, self.timeout) {
            Ok(body) => body,
            Err(err) => {
                debug!("wifi_stations scrape of '{}' failed: {err}", self.url);
                result.error = Some(err.to_string());
                for ifname in &self.ifnames {
                    result.record_missing(format!("stations_{ifname}"));
                }
                return result;
            }
        };

        let mut counts = std::collections::HashMap::new();
        for caps in station_regex().captures_iter(&body) {
            if let Ok(count) = caps[2].parse::<i64>() {
                counts.insert(caps[1].to_string(), count);
            }
        }

        let mut any_ok = false;
        for ifname in &self.ifnames {
            match counts.get(ifname) {
                Some(count) => {
                    any_ok = true;
                    result.record(format!("stations_{ifname}"), *count);
                }
                None => result.record_missing(format!("stations_{ifname}")),
            }
        }
        result.success = any_ok;
        result
    }
}

/// Register the `wifi_stations` check type factory with `registry`.
pub fn register(registry: &Registry) {
    let factory = Arc::new(|cfg: &Map<String, Value>| -> Result<Box<dyn Check>, RegistryError> {
        if !is_enabled(cfg) {
            return Err(RegistryError::InvalidConfig {
                check_type: "wifi_stations".into(),
                reason: "disabled".into(),
            });
        }
        let url = require_str(cfg, "url", "wifi_stations")
            .map_err(|e| RegistryError::InvalidConfig {
                check_type: "wifi_stations".into(),
                reason: e.to_string(),
            })?
            .to_string();
        let ifnames = cfg
            .get("interfaces")
            .and_then(|v| v.as_array())
            .ok_or_else(|| RegistryError::InvalidConfig {
                check_type: "wifi_stations".into(),
                reason: "missing 'interfaces' array".into(),
            })?
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    RegistryError::InvalidConfig {
                        check_type: "wifi_stations".into(),
                        reason: "'interfaces' entries must be strings".into(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if ifnames.is_empty() {
            return Err(RegistryError::InvalidConfig {
                check_type: "wifi_stations".into(),
                reason: "'interfaces' must not be empty".into(),
            });
        }
        let timeout = read_timeout(cfg, DEFAULT_TIMEOUT);
        Ok(Box::new(WifiStationsCheck {
            url,
            ifnames,
            timeout,
        }))
    });
    registry
        .register(
            "wifi_stations",
            factory,
            Descriptor {
                metrics: vec![],
                style: super::GraphStyle::Stacked,
                label: None,
            },
        )
        .expect("wifi_stations registered twice");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_multiple_interfaces() {
        let body = "# HELP wifi_stations number of associated stations\n\
# TYPE wifi_stations gauge\n\
wifi_stations{ifname=\"wlan0\"} 3\n\
wifi_stations{ifname=\"wlan1\"} 0\n";
        let mut found = std::collections::HashMap::new();
        for caps in station_regex().captures_iter(body) {
            found.insert(caps[1].to_string(), caps[2].parse::<i64>().unwrap());
        }
        assert_eq!(found.get("wlan0"), Some(&3));
        assert_eq!(found.get("wlan1"), Some(&0));
    }
}
