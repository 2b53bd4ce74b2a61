//! Error types for the fleetwatch crate.
//!
//! Each subsystem gets its own error enum:
//! - [`ConfigError`] - loading and validating the host-configuration file
//! - [`RegistryError`] - check-type registration and instantiation
//! - [`CheckError`] - errors that occur while a check is running
//! - [`RrdError`] - the storage/graph adapter and its `rrdtool` subprocess
//! - [`ApiError`] - the HTTP boundary

use thiserror::Error;

/// Errors raised while loading or validating the host-configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The host file could not be read from disk.
    #[error("could not read host file: {source}")]
    Io {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },
    /// The host file is not valid JSON, or does not match the expected shape.
    #[error("could not parse host file: {source}")]
    Parse {
        /// Underlying error
        #[from]
        source: serde_json::Error,
    },
    /// A host's `checks` entry for some check type was not a JSON object.
    #[error("host '{host}' has a non-object configuration for check type '{check_type}'")]
    InvalidCheckConfig {
        /// The offending host
        host: String,
        /// The offending check type name
        check_type: String,
    },
}

/// Errors raised by the [Registry](crate::registry::Registry).
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A check type with this name is already registered.
    #[error("check type '{0}' is already registered")]
    AlreadyRegistered(String),
    /// No check type with this name has been registered.
    #[error("unknown check type '{0}'")]
    UnknownType(String),
    /// The factory-config map given to a factory was invalid for that check type.
    #[error("invalid configuration for check type '{check_type}': {reason}")]
    InvalidConfig {
        /// The check type whose factory rejected the configuration
        check_type: String,
        /// Human-readable reason
        reason: String,
    },
}

/// Errors that can occur while a [Check](crate::check::Check) is running.
#[derive(Error, Debug)]
pub enum CheckError {
    /// An I/O error occurred during the check.
    #[error("IO error: {source}")]
    Io {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },
    /// An error occurred while performing an HTTP request.
    #[cfg(any(feature = "http-check", feature = "wifi-check"))]
    #[error("HTTP error: {source}")]
    Http {
        /// Underlying error
        #[from]
        source: curl::Error,
    },
    /// The probe ran out of time before completing.
    #[error("check timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The probe's output could not be parsed (ping summary line, DNS
    /// message, or scrape body).
    #[error("could not parse check output: {0}")]
    Parse(String),
    /// DNS-specific failure: the answer did not match what was expected,
    /// or the response code indicated failure.
    #[error("DNS check failed: {0}")]
    Dns(String),
    /// The check observed the worker's shutdown signal mid-probe.
    #[error("check was cancelled")]
    Cancelled,
}

/// Errors raised by the [RrdAdapter](crate::rrd::RrdAdapter).
#[derive(Error, Debug)]
pub enum RrdError {
    /// The root storage directory does not exist.
    #[error("storage root '{0}' does not exist")]
    Precondition(std::path::PathBuf),
    /// A filesystem operation (directory creation, file access) failed.
    #[error("filesystem error: {source}")]
    Filesystem {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },
    /// The `rrdtool` subprocess exited unsuccessfully or produced
    /// unparseable output.
    #[error("rrdtool subprocess failed: {0}")]
    Subprocess(String),
    /// `SafeUpdate` was called with a timestamp that is not strictly
    /// greater than the file's current last-update timestamp.
    #[error("update timestamp {new} is not after last update {last}")]
    NonMonotonicTimestamp {
        /// The rejected timestamp
        new: i64,
        /// The file's current last-update timestamp
        last: i64,
    },
}

/// Errors surfaced by the HTTP boundary.
#[derive(Error, Debug)]
pub enum ApiError {
    /// A query-string filter could not be parsed (e.g. a malformed
    /// `tag=` filter missing its `:` separator).
    #[error("malformed filter: {0}")]
    MalformedFilter(String),
    /// The requested host does not exist.
    #[error("unknown host '{0}'")]
    UnknownHost(String),
}
