//! Renders the `/metrics` Prometheus text-exposition body.
//!
//! Hand-rolled rather than built on the `prometheus` crate: the exact
//! shape (two fixed metric families, `check` and `metric` labels) is part
//! of the wire contract, and a registry-based client library would add
//! more machinery than two `HELP`/`TYPE` blocks need.

use std::fmt::Write as _;

use crate::api::FleetView;

/// Escape a label value per the exposition format: backslash, double
/// quote, and newline.
fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Render the full `/metrics` body for the given fleet view.
pub fn render(view: &FleetView) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# HELP check_alive Whether the check target is reachable (1=up, 0=down).");
    let _ = writeln!(out, "# TYPE check_alive gauge");
    for host in &view.hosts {
        for check in &host.checks {
            let _ = writeln!(
                out,
                "check_alive{{host=\"{}\",check=\"{}\"}} {}",
                escape_label_value(&host.name),
                escape_label_value(&check.check_type),
                if check.alive { 1 } else { 0 }
            );
        }
    }

    let _ = writeln!(out, "# HELP check_metric Check metric value.");
    let _ = writeln!(out, "# TYPE check_metric gauge");
    for host in &view.hosts {
        for check in &host.checks {
            for (key, value) in &check.metrics {
                if let Some(value) = value {
                    let _ = writeln!(
                        out,
                        "check_metric{{host=\"{}\",check=\"{}\",metric=\"{}\"}} {}",
                        escape_label_value(&host.name),
                        escape_label_value(&check.check_type),
                        escape_label_value(key),
                        value
                    );
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{CheckView, HostView};
    use crate::status::HostStatus;
    use std::collections::HashMap;

    #[test]
    fn escapes_special_characters_in_label_values() {
        assert_eq!(escape_label_value("a\\b\"c\nd"), "a\\\\b\\\"c\\nd");
    }

    #[test]
    fn emits_one_alive_line_and_one_metric_line_per_present_metric() {
        let mut metrics = HashMap::new();
        metrics.insert("url_0".to_string(), Some(45));
        metrics.insert("url_1".to_string(), None);
        let view = FleetView {
            hosts: vec![HostView {
                name: "qube".to_string(),
                status: HostStatus::Degraded,
                tags: HashMap::new(),
                checks: vec![CheckView {
                    check_type: "http".to_string(),
                    alive: false,
                    metrics,
                    lastupdate: 100,
                }],
            }],
            generated_at: 100,
        };
        let body = render(&view);
        assert!(body.contains("check_alive{host=\"qube\",check=\"http\"} 0"));
        assert!(body.contains("check_metric{host=\"qube\",check=\"http\",metric=\"url_0\"} 45"));
        assert!(!body.contains("metric=\"url_1\""));
    }
}
