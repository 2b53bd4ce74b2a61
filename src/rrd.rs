//! The RRD Adapter: owns one storage file and its graph set for one
//! (host, check-type) pair, talking to an external `rrdtool`-compatible
//! binary as a subprocess.
//!
//! Storage and rendering are both delegated to the external tool rather
//! than reimplemented in-process; this process never touches the binary
//! RRD format directly.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::check::{GraphStyle, MetricDef};
use crate::errors::RrdError;

/// Gauge step, in seconds, for every data source this adapter creates.
const STEP_SECS: u32 = 60;
/// Heartbeat, in seconds: how long a data source may go without an update
/// before the tool itself starts reporting "unknown".
const HEARTBEAT_SECS: u32 = 120;

struct Archive {
    consolidation: &'static str,
    steps: u32,
    rows: u32,
}

/// The fixed archive table: consolidation function, step multiplier, row count.
const ARCHIVES: &[Archive] = &[
    Archive { consolidation: "MAX", steps: 1, rows: 10_080 },     // ~1 week at 1-min resolution
    Archive { consolidation: "AVERAGE", steps: 1, rows: 10_080 }, // ~1 week
    Archive { consolidation: "AVERAGE", steps: 5, rows: 8_928 },  // ~31 days at 5-min
    Archive { consolidation: "AVERAGE", steps: 15, rows: 8_736 }, // ~13 weeks at 15-min
    Archive { consolidation: "AVERAGE", steps: 60, rows: 8_760 }, // ~1 year at 60-min
    Archive { consolidation: "AVERAGE", steps: 480, rows: 5_475 }, // ~5 years at 8-hour
];

/// One rendered time window, with its own redraw rate limit.
#[derive(Clone, Copy)]
struct Window {
    name: &'static str,
    span_secs: u64,
    redraw_interval: Duration,
}

/// The 12 graph windows, each with its redraw rate limit
/// ("short windows redraw at most every minute, ... year-range windows
/// every 6 hours").
const WINDOWS: &[Window] = &[
    Window { name: "15m", span_secs: 900, redraw_interval: Duration::from_secs(60) },
    Window { name: "1h", span_secs: 3_600, redraw_interval: Duration::from_secs(60) },
    Window { name: "4h", span_secs: 14_400, redraw_interval: Duration::from_secs(300) },
    Window { name: "8h", span_secs: 28_800, redraw_interval: Duration::from_secs(300) },
    Window { name: "1d", span_secs: 86_400, redraw_interval: Duration::from_secs(600) },
    Window { name: "4d", span_secs: 345_600, redraw_interval: Duration::from_secs(1_200) },
    Window { name: "1w", span_secs: 604_800, redraw_interval: Duration::from_secs(1_800) },
    Window { name: "31d", span_secs: 2_678_400, redraw_interval: Duration::from_secs(1_800) },
    Window { name: "93d", span_secs: 8_035_200, redraw_interval: Duration::from_secs(1_800) },
    Window { name: "1y", span_secs: 31_536_000, redraw_interval: Duration::from_secs(21_600) },
    Window { name: "2y", span_secs: 63_072_000, redraw_interval: Duration::from_secs(21_600) },
    Window { name: "5y", span_secs: 157_680_000, redraw_interval: Duration::from_secs(21_600) },
];

/// A fixed palette cycled by metric index.
const PALETTE: &[&str] = &["#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b"];

/// Escape a label for the storage tool's DEF/LINE/AREA grammar: backslash
/// and colon are the two characters with special meaning there.
fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace(':', "\\:")
}

fn run_tool(args: &[String]) -> Result<std::process::Output, RrdError> {
    debug!("rrdtool {}", args.join(" "));
    Command::new("rrdtool")
        .args(args)
        .output()
        .map_err(|e| RrdError::Subprocess(e.to_string()))
}

/// Binds one (host, check-type) pair to its `.rrd` file and its rendered
/// graph PNGs. Holds the single mutex serializing this file's updates.
pub struct RrdAdapter {
    host: String,
    check_type: String,
    rrd_path: PathBuf,
    graph_dir: PathBuf,
    metrics: Vec<MetricDef>,
    style: GraphStyle,
    guard: Mutex<RedrawState>,
}

struct RedrawState {
    last_drawn: [Option<Instant>; 12],
}

impl RrdAdapter {
    /// Ensure directories, create-if-missing the storage file, and draw
    /// every window once.
    pub fn new(
        data_dir: &Path,
        host: &str,
        check_type: &str,
        metrics: Vec<MetricDef>,
        style: GraphStyle,
    ) -> Result<Self, RrdError> {
        if !data_dir.exists() {
            return Err(RrdError::Precondition(data_dir.to_path_buf()));
        }
        let rrd_dir = data_dir.join("rrds").join(host);
        let graph_dir = data_dir.join("graphs").join("imgs").join(host);
        std::fs::create_dir_all(&rrd_dir)?;
        std::fs::create_dir_all(&graph_dir)?;

        let rrd_path = rrd_dir.join(format!("{check_type}.rrd"));
        let adapter = Self {
            host: host.to_string(),
            check_type: check_type.to_string(),
            rrd_path,
            graph_dir,
            metrics,
            style,
            guard: Mutex::new(RedrawState {
                last_drawn: [None; 12],
            }),
        };

        if adapter.rrd_path.exists() {
            adapter.warn_on_descriptor_drift();
        } else {
            adapter.create_file()?;
        }
        for (i, window) in WINDOWS.iter().enumerate() {
            if let Err(err) = adapter.render_window(window) {
                warn!(
                    "initial render of {}/{} {} window failed: {err}",
                    adapter.host, adapter.check_type, window.name
                );
            } else {
                adapter.guard.lock().expect("rrd lock poisoned").last_drawn[i] = Some(Instant::now());
            }
        }
        Ok(adapter)
    }

    fn create_file(&self) -> Result<(), RrdError> {
        let mut args = vec![
            "create".to_string(),
            self.rrd_path.to_string_lossy().into_owned(),
            "--step".to_string(),
            STEP_SECS.to_string(),
        ];
        for metric in &self.metrics {
            args.push(format!(
                "DS:{}:GAUGE:{}:0:U",
                metric.storage_key, HEARTBEAT_SECS
            ));
        }
        for archive in ARCHIVES {
            args.push(format!(
                "RRA:{}:0.5:{}:{}",
                archive.consolidation, archive.steps, archive.rows
            ));
        }
        let output = run_tool(&args)?;
        if !output.status.success() {
            return Err(RrdError::Subprocess(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }

    /// Reusing an existing file unconditionally can silently diverge from
    /// the current descriptor if a check's metric set has changed since
    /// the file was created (the migrate-vs-reinitialize-vs-fatal open
    /// question this crate resolves as "reuse unconditionally, but warn").
    /// Queries the file's data-source count via `rrdtool info` and logs a
    /// mismatch against `self.metrics.len()`; never fails the call.
    fn warn_on_descriptor_drift(&self) {
        match self.existing_data_source_count() {
            Ok(existing) if existing != self.metrics.len() => warn!(
                "{}/{}: existing RRD file at {} has {existing} data source(s), \
                 descriptor now declares {}; reusing the file unchanged",
                self.host,
                self.check_type,
                self.rrd_path.display(),
                self.metrics.len(),
            ),
            Ok(_) => {}
            Err(err) => warn!(
                "{}/{}: could not inspect existing RRD file at {} for descriptor drift: {err}",
                self.host,
                self.check_type,
                self.rrd_path.display(),
            ),
        }
    }

    /// Number of distinct `ds[<name>]` data sources `rrdtool info` reports
    /// for this file.
    fn existing_data_source_count(&self) -> Result<usize, RrdError> {
        let output = run_tool(&[
            "info".to_string(),
            self.rrd_path.to_string_lossy().into_owned(),
        ])?;
        if !output.status.success() {
            return Err(RrdError::Subprocess(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut names = std::collections::HashSet::new();
        for line in stdout.lines() {
            let line = line.trim_start();
            if let Some(rest) = line.strip_prefix("ds[") {
                if let Some(end) = rest.find(']') {
                    names.insert(rest[..end].to_string());
                }
            }
        }
        Ok(names.len())
    }

    fn last_update(&self) -> Result<i64, RrdError> {
        let output = run_tool(&[
            "lastupdate".to_string(),
            self.rrd_path.to_string_lossy().into_owned(),
        ])?;
        if !output.status.success() {
            return Err(RrdError::Subprocess(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Last non-empty line looks like "<ts>: <v1> <v2> ...".
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| RrdError::Subprocess("empty lastupdate output".into()))?;
        line.split(':')
            .next()
            .and_then(|ts| ts.trim().parse().ok())
            .ok_or_else(|| RrdError::Subprocess(format!("could not parse lastupdate line: {line}")))
    }

    /// Apply one update, rendering any graph windows whose redraw interval
    /// has elapsed.
    ///
    /// `values[i]` corresponds to `metrics[i]` (positional, per descriptor
    /// order); `None` means "attempted but missing" and is rendered as the
    /// tool's unknown sentinel `U`.
    pub fn safe_update(
        &self,
        timestamp: DateTime<Utc>,
        values: &[Option<i64>],
    ) -> Result<i64, RrdError> {
        let _guard = self.guard.lock().expect("rrd lock poisoned");
        let ts = timestamp.timestamp();

        if !values.is_empty() {
            let last = self.last_update().unwrap_or(0);
            if ts <= last {
                return Err(RrdError::NonMonotonicTimestamp { new: ts, last });
            }
            let fields: Vec<String> = values
                .iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_else(|| "U".to_string()))
                .collect();
            let update_arg = format!("{ts}:{}", fields.join(":"));
            let output = run_tool(&[
                "update".to_string(),
                self.rrd_path.to_string_lossy().into_owned(),
                update_arg,
            ])?;
            if !output.status.success() {
                return Err(RrdError::Subprocess(
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                ));
            }
        }

        self.redraw_due_windows();
        Ok(ts)
    }

    fn redraw_due_windows(&self) {
        let mut state = self.guard.lock().expect("rrd lock poisoned");
        for (i, window) in WINDOWS.iter().enumerate() {
            let due = match state.last_drawn[i] {
                Some(last) => last.elapsed() >= window.redraw_interval,
                None => true,
            };
            if !due {
                continue;
            }
            if let Err(err) = self.render_window(window) {
                error!(
                    "redraw of {}/{} {} window failed: {err}",
                    self.host, self.check_type, window.name
                );
                continue;
            }
            state.last_drawn[i] = Some(Instant::now());
        }
    }

    fn graph_path(&self, window: &Window) -> PathBuf {
        self.graph_dir
            .join(format!("{}_{}_{}.png", self.host, self.check_type, window.name))
    }

    fn render_window(&self, window: &Window) -> Result<(), RrdError> {
        let consolidation = if window.span_secs <= 8 * 3600 { "MAX" } else { "AVERAGE" };
        let mut args = vec![
            "graph".to_string(),
            self.graph_path(window).to_string_lossy().into_owned(),
            "--start".to_string(),
            format!("-{}", window.span_secs),
            "--title".to_string(),
            escape_label(&format!("{} {}", self.host, self.check_type)),
        ];

        for (i, metric) in self.metrics.iter().enumerate() {
            let colour = PALETTE[i % PALETTE.len()];
            let source_expr = if metric.scale > 1 {
                let raw = format!("raw{i}");
                args.push(format!("DEF:{raw}={}:{}:{consolidation}", self.rrd_path.display(), metric.storage_key));
                let scaled = format!("scaled{i}");
                args.push(format!("CDEF:{scaled}={raw},{},/", metric.scale));
                scaled
            } else {
                let name = format!("ds{i}");
                args.push(format!("DEF:{name}={}:{}:{consolidation}", self.rrd_path.display(), metric.storage_key));
                name
            };

            let draw_kind = match (self.style, i) {
                (GraphStyle::Line, _) => "LINE2",
                (GraphStyle::Stacked, 0) => "AREA",
                (GraphStyle::Stacked, _) => "STACK",
            };
            args.push(format!(
                "{draw_kind}:{source_expr}{colour}:{}",
                escape_label(&format!("{} ({})", metric.label, metric.unit))
            ));
        }

        let output = run_tool(&args)?;
        if !output.status.success() {
            return Err(RrdError::Subprocess(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escapes_backslash_and_colon() {
        assert_eq!(escape_label("a:b\\c"), "a\\:b\\\\c");
    }

    #[test]
    fn short_windows_use_max_consolidation() {
        let window = WINDOWS.iter().find(|w| w.name == "8h").unwrap();
        let consolidation = if window.span_secs <= 8 * 3600 { "MAX" } else { "AVERAGE" };
        assert_eq!(consolidation, "MAX");
    }

    #[test]
    fn year_windows_use_average_consolidation() {
        let window = WINDOWS.iter().find(|w| w.name == "1y").unwrap();
        let consolidation = if window.span_secs <= 8 * 3600 { "MAX" } else { "AVERAGE" };
        assert_eq!(consolidation, "AVERAGE");
    }

    #[test]
    fn twelve_windows_are_declared() {
        assert_eq!(WINDOWS.len(), 12);
    }

    #[test]
    fn new_rejects_missing_data_dir() {
        let missing = PathBuf::from("/nonexistent/fleetwatch-data-dir-for-test");
        let err = RrdAdapter::new(&missing, "h", "ping", vec![], GraphStyle::Line).unwrap_err();
        assert!(matches!(err, RrdError::Precondition(_)));
    }

    /// Even when `rrdtool` itself is unavailable on `PATH`, the adapter must
    /// still lay out the per-host storage and graph directories before
    /// attempting the subprocess call, and must surface the failure as a
    /// `Subprocess` error rather than panicking.
    #[test]
    fn new_creates_directories_even_if_rrdtool_invocation_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = RrdAdapter::new(dir.path(), "myhost", "ping", vec![], GraphStyle::Line);
        assert!(dir.path().join("rrds").join("myhost").is_dir());
        assert!(dir.path().join("graphs").join("imgs").join("myhost").is_dir());
        if let Err(err) = result {
            assert!(matches!(err, RrdError::Subprocess(_)));
        }
    }

    /// Serializes the tests below that put a fake `rrdtool` on `PATH`,
    /// since mutating process-wide environment state is otherwise racy
    /// against other tests in this binary.
    static FAKE_RRDTOOL_PATH_LOCK: Mutex<()> = Mutex::new(());

    /// Install a fake `rrdtool` shell script on `PATH` for the duration of
    /// `body`, restoring the original `PATH` afterwards. The fake tracks
    /// each file's last-update state in a `<path>.laststate` sidecar file,
    /// mimicking just enough of `rrdtool lastupdate`/`update` to drive
    /// [`RrdAdapter::safe_update`]'s monotonicity check; `create`, `graph`
    /// and `info` always succeed without touching disk.
    #[cfg(unix)]
    fn with_fake_rrdtool<R>(body: impl FnOnce() -> R) -> R {
        use std::os::unix::fs::PermissionsExt;

        let _guard = FAKE_RRDTOOL_PATH_LOCK.lock().expect("lock poisoned");

        let bin_dir = tempfile::tempdir().expect("bin tempdir");
        let script_path = bin_dir.path().join("rrdtool");
        std::fs::write(
            &script_path,
            r#"#!/bin/sh
case "$1" in
  create) exit 0 ;;
  graph) exit 0 ;;
  info) exit 0 ;;
  lastupdate)
    state="$2.laststate"
    if [ -f "$state" ]; then
      cat "$state"
    else
      echo "0: U"
    fi
    exit 0
    ;;
  update)
    state="$2.laststate"
    ts="${3%%:*}"
    echo "$ts: $3" > "$state"
    exit 0
    ;;
  *) exit 1 ;;
esac
"#,
        )
        .expect("write fake rrdtool script");
        let mut perms = std::fs::metadata(&script_path)
            .expect("stat fake rrdtool script")
            .permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).expect("chmod fake rrdtool script");

        let original_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{original_path}", bin_dir.path().display()));
        let result = body();
        std::env::set_var("PATH", original_path);
        result
    }

    /// Testable property 2 ("Monotonic storage", spec §8) / Scenario D: a
    /// `SafeUpdate` at the file's current last-update timestamp is
    /// rejected and leaves the stored state untouched; a strictly later
    /// timestamp is accepted.
    #[cfg(unix)]
    #[test]
    fn safe_update_rejects_non_monotonic_timestamp_and_leaves_state_untouched() {
        with_fake_rrdtool(|| {
            let data_dir = tempfile::tempdir().expect("data dir");
            let metrics = vec![MetricDef::new("latency_us", "latency_us", "Latency", "us")];
            let adapter =
                RrdAdapter::new(data_dir.path(), "fakehost", "ping", metrics, GraphStyle::Line)
                    .expect("adapter construction with fake rrdtool on PATH should succeed");

            let first_ts = Utc::now();
            let accepted = adapter
                .safe_update(first_ts, &[Some(10)])
                .expect("first update at a fresh timestamp is accepted");
            assert_eq!(accepted, first_ts.timestamp());

            let state_path = data_dir
                .path()
                .join("rrds")
                .join("fakehost")
                .join("ping.rrd.laststate");
            let state_before =
                std::fs::read_to_string(&state_path).expect("state file written by fake update");

            let err = adapter
                .safe_update(first_ts, &[Some(20)])
                .expect_err("repeating the same timestamp must be rejected");
            assert!(matches!(err, RrdError::NonMonotonicTimestamp { .. }));

            let state_after =
                std::fs::read_to_string(&state_path).expect("state file still present");
            assert_eq!(
                state_before, state_after,
                "a rejected update must not mutate the stored state"
            );

            let later_ts = first_ts + chrono::Duration::seconds(60);
            let accepted = adapter
                .safe_update(later_ts, &[Some(30)])
                .expect("a strictly later timestamp is accepted");
            assert_eq!(accepted, later_ts.timestamp());
        });
    }
}
