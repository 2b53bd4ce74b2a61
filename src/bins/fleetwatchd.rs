//! The fleetwatch daemon binary: loads the host file, starts one worker
//! per host, and serves the JSON/Prometheus/UI HTTP boundary until
//! SIGINT or SIGTERM.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleetwatch::api::{ApiState, HostEntry};
use fleetwatch::check::register_builtin_checks;
use fleetwatch::common::{init_logging, print_usage, setup_panic_handler};
use fleetwatch::config::FleetConfig;
use fleetwatch::errors::ConfigError;
use fleetwatch::registry::Registry;
use fleetwatch::worker;
use getopts::Options;
use nix::sys::signal::{self, SigHandler, Signal};
use thiserror::Error;
use tracing::{error, info};

/// Startup-fatal failures `run` can return. Kept as a single enum (rather
/// than scattered `process::exit` calls) so the startup path can be
/// exercised by a test without killing the test process.
#[derive(Error, Debug)]
enum DaemonError {
    #[error("data directory '{0}' does not exist")]
    DataDirMissing(PathBuf),
    #[error("could not load host file '{path}': {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("could not bind to '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_signal))
            .expect("failed to install SIGINT handler");
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_signal))
            .expect("failed to install SIGTERM handler");
    }
}

struct Cli {
    host_file: PathBuf,
    data_dir: PathBuf,
    port: u16,
    bind: String,
    log_level: tracing::Level,
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optflag("V", "version", "print the version");
    opts.optopt("", "host-file", "path to the host-configuration JSON file", "PATH");
    opts.optopt("", "data-dir", "root directory for rrds/ and graphs/", "PATH");
    opts.optopt("", "port", "HTTP listen port", "PORT");
    opts.optopt("", "bind", "HTTP bind address", "ADDR");
    opts.optopt("", "log-level", "default log level (trace/debug/info/warn/error)", "LEVEL");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{f}");
            print_usage(&program, &opts);
        }
    };

    if matches.opt_present("help") {
        print_usage(&program, &opts);
    }
    if matches.opt_present("version") {
        println!("{} {}", env!("CARGO_BIN_NAME"), env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    let host_file = matches
        .opt_str("host-file")
        .unwrap_or_else(|| print_usage(&program, &opts));
    let data_dir = matches
        .opt_str("data-dir")
        .unwrap_or_else(|| print_usage(&program, &opts));
    let port = matches
        .opt_str("port")
        .map(|p| p.parse().unwrap_or_else(|_| {
            eprintln!("--port must be a valid u16");
            std::process::exit(2)
        }))
        .unwrap_or(8787);
    let bind = matches.opt_str("bind").unwrap_or_else(|| "0.0.0.0".to_string());
    let log_level = matches
        .opt_str("log-level")
        .map(|l| tracing::Level::from_str(&l).unwrap_or_else(|_| {
            eprintln!("--log-level must be one of trace/debug/info/warn/error");
            std::process::exit(2)
        }))
        .unwrap_or(tracing::Level::INFO);

    Cli {
        host_file: PathBuf::from(host_file),
        data_dir: PathBuf::from(data_dir),
        port,
        bind,
        log_level,
    }
}

/// Load configuration, start the worker fleet, and serve the HTTP boundary
/// until shutdown. Startup-fatal conditions (missing data directory,
/// unparseable host file, bind failure) are returned rather than exiting
/// the process directly, so callers (including tests) can observe them.
async fn run(cli: Cli) -> Result<(), DaemonError> {
    if !cli.data_dir.exists() {
        return Err(DaemonError::DataDirMissing(cli.data_dir.clone()));
    }

    let fleet_config = FleetConfig::load(&cli.host_file).map_err(|source| DaemonError::Config {
        path: cli.host_file.clone(),
        source,
    })?;
    info!("loaded {} host(s) from '{}'", fleet_config.len(), cli.host_file.display());

    let registry = Arc::new(Registry::new());
    register_builtin_checks(&registry);

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut hosts = HashMap::new();
    let mut workers = Vec::new();
    for host in fleet_config.hosts() {
        let (worker, statuses) = worker::spawn(
            host.clone(),
            Arc::clone(&registry),
            cli.data_dir.clone(),
            Arc::clone(&shutdown),
        );
        hosts.insert(
            host.name.clone(),
            HostEntry {
                tags: host.tags.clone(),
                statuses,
            },
        );
        workers.push(worker);
    }

    let state = ApiState {
        hosts: Arc::new(hosts),
        graph_dir: cli.data_dir.join("graphs").join("imgs"),
    };
    let app = fleetwatch::api::router(state);

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| DaemonError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!("listening on {addr}");

    let serve_shutdown = Arc::clone(&shutdown);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        loop {
            if serve_shutdown.load(Ordering::Relaxed) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    });

    if let Err(err) = server.await {
        error!("HTTP server error: {err}");
    }

    shutdown.store(true, Ordering::Relaxed);
    for worker in &workers {
        worker.request_shutdown();
    }
    info!("fleetwatchd shutting down cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    setup_panic_handler();
    let cli = parse_args();
    init_logging(cli.log_level);
    install_signal_handlers();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            std::process::ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Startup-fatal path: a missing data directory must be reported
    /// through `run`'s `Result`, not `process::exit`, so this test process
    /// survives to assert on it.
    #[tokio::test]
    async fn run_reports_missing_data_dir_without_exiting() {
        let cli = Cli {
            host_file: PathBuf::from("/nonexistent/fleetwatch-host-file-for-test.json"),
            data_dir: PathBuf::from("/nonexistent/fleetwatch-data-dir-for-test"),
            port: 0,
            bind: "127.0.0.1".to_string(),
            log_level: tracing::Level::ERROR,
        };
        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, DaemonError::DataDirMissing(_)));
    }
}
