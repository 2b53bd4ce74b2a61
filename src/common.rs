//! Common functionality shared by the fleetwatch binary.
//!
//! - Logging setup
//! - CLI usage printing
//! - Panic handler for user-friendly crash reports
//!
//! # Logging
//!
//! Logging can be configured via the `FLEETWATCH_LOG` environment
//! variable, which takes `tracing-subscriber`
//! [`EnvFilter`](tracing_subscriber::EnvFilter) syntax (e.g.
//! `fleetwatch=debug,tower_http=info`). If unset, falls back to the level
//! given to [`init_logging`].

use std::str::FromStr;

use getopts::Options;
use tracing_subscriber::EnvFilter;

/// Environment variable name for configuring log level/filter directives.
pub const ENV_LOG_FILTER: &str = "FLEETWATCH_LOG";

/// Displays program usage information and exits.
pub fn print_usage(program: &str, opts: &Options) -> ! {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
    std::process::exit(0)
}

/// Initializes the tracing subscriber.
///
/// The effective filter is read from [`ENV_LOG_FILTER`] if set, otherwise
/// built from `default_level`.
///
/// # Exits
///
/// Exits with status code 1 if the environment variable is set but is not
/// valid `EnvFilter` syntax.
pub fn init_logging(default_level: tracing::Level) {
    let filter = match std::env::var(ENV_LOG_FILTER) {
        Ok(raw) => EnvFilter::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("Bad filter in environment variable '{ENV_LOG_FILTER}': '{raw}'");
            eprintln!("{e}");
            std::process::exit(1)
        }),
        Err(_) => EnvFilter::new(default_level.to_string()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    tracing::trace!("logging initialized");
}

/// Sets up a custom panic handler for user-friendly error reporting.
///
/// In debug builds, uses the default panic handler for detailed debugging
/// output. In release builds, reports version/OS/command/location so a
/// crash report is actionable without a backtrace capture.
pub fn setup_panic_handler() {
    if cfg!(debug_assertions) {
        return;
    }
    std::panic::set_hook(Box::new(|panic_info| {
        let mut message = String::new();
        message.push_str("\nfleetwatchd crashed. This is a bug.\n\n");
        message.push_str("Technical details:\n");
        message.push_str(&format!("Version:     {}\n", env!("CARGO_PKG_VERSION")));

        #[cfg(target_os = "linux")]
        let os = "linux";
        #[cfg(target_os = "macos")]
        let os = "macos";
        #[cfg(target_os = "windows")]
        let os = "windows";

        message.push_str(&format!("OS:          {} {}\n", os, std::env::consts::ARCH));

        let args: Vec<_> = std::env::args().collect();
        message.push_str(&format!("Command:     {}\n", args.join(" ")));

        if let Some(msg) = panic_info.payload().downcast_ref::<&str>() {
            message.push_str(&format!("Error:       {}\n", msg));
        } else if let Some(msg) = panic_info.payload().downcast_ref::<String>() {
            message.push_str(&format!("Error:       {}\n", msg));
        }

        if let Some(location) = panic_info.location() {
            message.push_str(&format!("Location:    {}:{}\n", location.file(), location.line()));
        }

        eprintln!("{}", message);
        std::process::exit(1);
    }));
}
