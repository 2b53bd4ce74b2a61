//! ICMP-echo ("ping") check: shells out to the system `ping` binary rather
//! than vendoring a raw-socket implementation, so it keeps working after
//! the daemon drops `CAP_NET_RAW`.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, error};

use super::{is_enabled, read_timeout, require_str, Check, CheckContext, CheckResult, Descriptor};
use crate::errors::{CheckError, RegistryError};
use crate::registry::Registry;

const RESULT_KEY: &str = "latency_us";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_COUNT: u32 = 3;

/// `rtt min/avg/max/mdev = 0.123/0.456/0.789/0.012 ms` (iputils) summary line.
fn rtt_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"=\s*[0-9.]+/([0-9.]+)/[0-9.]+/[0-9.]+\s*ms").expect("valid regex")
    })
}

/// A ping check bound to one target.
pub struct PingCheck {
    target: String,
    count: u32,
    timeout: Duration,
}

impl PingCheck {
    fn probe(&self) -> Result<u32, CheckError> {
        let timeout_secs = self.timeout.as_secs().max(1);
        let mut cmd = Command::new("ping");
        cmd.arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(timeout_secs.to_string())
            .arg(&self.target);
        debug!("running ping check: {cmd:?}");

        let output = cmd.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CheckError::Parse(format!(
                "ping exited with {}: {stderr}",
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let caps = rtt_regex()
            .captures(&stdout)
            .ok_or_else(|| CheckError::Parse("no rtt summary line in ping output".into()))?;
        let avg_ms: f64 = caps[1]
            .parse()
            .map_err(|_| CheckError::Parse("could not parse avg rtt as float".into()))?;
        Ok((avg_ms * 1000.0).round() as u32)
    }
}

impl Check for PingCheck {
    fn type_name(&self) -> &'static str {
        "ping"
    }

    fn describe(&self) -> Descriptor {
        Descriptor {
            metrics: vec![super::MetricDef::scaled(
                RESULT_KEY,
                "latency_us",
                "Latency",
                "ms",
                1000,
            )],
            style: super::GraphStyle::Line,
            label: None,
        }
    }

    fn run(&self, ctx: &CheckContext) -> CheckResult {
        let mut result = CheckResult::started(Utc::now());
        if ctx.is_cancelled() {
            result.error = Some(CheckError::Cancelled.to_string());
            result.record_missing(RESULT_KEY);
            return result;
        }
        match self.probe() {
            Ok(latency_us) => {
                result.success = true;
                result.record(RESULT_KEY, latency_us as i64);
            }
            Err(err) => {
                error!("ping check against '{}' failed: {err}", self.target);
                result.error = Some(err.to_string());
                result.record_missing(RESULT_KEY);
            }
        }
        result
    }
}

/// Register the `ping` check type factory with `registry`.
pub fn register(registry: &Registry) {
    let factory = Arc::new(|cfg: &Map<String, Value>| -> Result<Box<dyn Check>, RegistryError> {
        if !is_enabled(cfg) {
            return Err(RegistryError::InvalidConfig {
                check_type: "ping".into(),
                reason: "disabled".into(),
            });
        }
        let target = require_str(cfg, "target", "ping")
            .map_err(|e| RegistryError::InvalidConfig {
                check_type: "ping".into(),
                reason: e.to_string(),
            })?
            .to_string();
        let count = cfg
            .get("count")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_COUNT);
        let timeout = read_timeout(cfg, DEFAULT_TIMEOUT);
        Ok(Box::new(PingCheck {
            target,
            count,
            timeout,
        }))
    });
    registry
        .register(
            "ping",
            factory,
            Descriptor {
                metrics: vec![super::MetricDef::scaled(
                    RESULT_KEY,
                    "latency_us",
                    "Latency",
                    "ms",
                    1000,
                )],
                style: super::GraphStyle::Line,
                label: None,
            },
        )
        .expect("ping registered twice");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_iputils_summary_line() {
        let stdout = "--- 8.8.8.8 ping statistics ---\n\
3 packets transmitted, 3 received, 0% packet loss, time 2003ms\n\
rtt min/avg/max/mdev = 12.345/23.456/34.567/5.678 ms\n";
        let caps = rtt_regex().captures(stdout).unwrap();
        let avg: f64 = caps[1].parse().unwrap();
        assert!((avg - 23.456).abs() < 1e-6);
    }
}
