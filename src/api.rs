//! The HTTP boundary: JSON API, Prometheus text endpoint, rendered-graph
//! static files, and the embedded web UI shell.
//!
//! Everything here is thin plumbing over [`crate::status`] snapshots; no
//! check or storage logic lives in this module.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::extract::{Path as AxumPath, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use rust_embed::RustEmbed;
use serde::Serialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::errors::ApiError;
use crate::status::{aggregate_host_status, HostStatus, HostStatusMap};

#[derive(RustEmbed)]
#[folder = "webui/"]
struct WebUiAssets;

/// One configured host's tags, plus the name the worker registered its
/// status map under.
#[derive(Clone)]
pub struct HostEntry {
    /// This host's configured tags.
    pub tags: HashMap<String, String>,
    /// The host's worker-owned per-check-type status map.
    pub statuses: Arc<RwLock<HostStatusMap>>,
}

/// Shared state the HTTP layer reads every request; never mutated here.
#[derive(Clone)]
pub struct ApiState {
    /// Every configured host, by name.
    pub hosts: Arc<HashMap<String, HostEntry>>,
    /// Root directory the `/imgs/` route serves rendered graphs from.
    pub graph_dir: PathBuf,
}

/// One check's rendered state inside a [`HostView`].
#[derive(Debug, Clone, Serialize)]
pub struct CheckView {
    #[serde(skip)]
    pub(crate) check_type: String,
    /// Whether the last result reported success.
    pub alive: bool,
    /// The last result's metric map.
    pub metrics: HashMap<String, Option<i64>>,
    /// UNIX seconds of the last successful storage update.
    pub lastupdate: i64,
}

/// One host's rendered state inside a [`FleetView`].
#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    #[serde(skip)]
    pub(crate) name: String,
    /// This host's aggregate status.
    pub status: HostStatus,
    /// This host's configured tags.
    pub tags: HashMap<String, String>,
    #[serde(serialize_with = "serialize_checks_by_type")]
    pub(crate) checks: Vec<CheckView>,
}

fn serialize_checks_by_type<S: serde::Serializer>(
    checks: &[CheckView],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(checks.len()))?;
    for check in checks {
        map.serialize_entry(&check.check_type, check)?;
    }
    map.end()
}

/// The full point-in-time view the JSON API is built from.
#[derive(Debug, Clone, Serialize)]
pub struct FleetView {
    #[serde(serialize_with = "serialize_hosts_by_name")]
    /// Every host's rendered view, keyed by name when serialized.
    pub hosts: Vec<HostView>,
    /// UNIX seconds this view was generated at.
    pub generated_at: i64,
}

fn serialize_hosts_by_name<S: serde::Serializer>(
    hosts: &[HostView],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(hosts.len()))?;
    for host in hosts {
        map.serialize_entry(&host.name, host)?;
    }
    map.end()
}

/// Parsed, repeatable query filters: `hostname=`, `status=`, `tag=key:value`.
#[derive(Debug, Default)]
pub struct Filters {
    hostnames: Vec<String>,
    statuses: Vec<String>,
    tags: Vec<(String, String)>,
}

impl Filters {
    /// Parse from a raw query string (already percent-decoded key/value
    /// pairs are produced internally). Repeated keys of the same name
    /// combine with OR; different keys combine with AND.
    pub fn parse(raw_query: Option<&str>) -> Result<Self, ApiError> {
        let mut hostnames = Vec::new();
        let mut statuses = Vec::new();
        let mut tags = Vec::new();
        for (key, value) in form_urlencoded::parse(raw_query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "hostname" => hostnames.push(value.into_owned()),
                "status" => statuses.push(value.into_owned()),
                "tag" => {
                    let (k, v) = value
                        .split_once(':')
                        .ok_or_else(|| ApiError::MalformedFilter(value.into_owned()))?;
                    tags.push((k.to_string(), v.to_string()));
                }
                _ => {}
            }
        }
        Ok(Self {
            hostnames,
            statuses,
            tags,
        })
    }

    fn matches(&self, name: &str, status: HostStatus, tags: &HashMap<String, String>) -> bool {
        let hostname_ok = self.hostnames.is_empty() || self.hostnames.iter().any(|h| h == name);
        let status_ok = self.statuses.is_empty()
            || self.statuses.iter().any(|s| s.eq_ignore_ascii_case(&status.to_string()));
        let tag_ok = self.tags.is_empty()
            || self
                .tags
                .iter()
                .any(|(k, v)| tags.get(k).is_some_and(|actual| actual == v));
        hostname_ok && status_ok && tag_ok
    }
}

/// Build the filtered [`FleetView`] of the fleet at `now`.
pub fn build_view(state: &ApiState, filters: &Filters, now: chrono::DateTime<Utc>) -> FleetView {
    let mut hosts = Vec::new();
    for (name, entry) in state.hosts.iter() {
        let status_map = entry.statuses.read().expect("status map lock poisoned");
        let snapshots: Vec<_> = status_map.values().map(|s| s.snapshot()).collect();
        let status = aggregate_host_status(&snapshots, now);
        if !filters.matches(name, status, &entry.tags) {
            continue;
        }
        let checks = status_map
            .iter()
            .map(|(check_type, status)| {
                let snap = status.snapshot();
                CheckView {
                    check_type: check_type.clone(),
                    alive: snap.alive(),
                    metrics: snap
                        .last_result
                        .as_ref()
                        .map(|r| r.metrics.clone())
                        .unwrap_or_default(),
                    lastupdate: snap.last_update,
                }
            })
            .collect();
        hosts.push(HostView {
            name: name.clone(),
            status,
            tags: entry.tags.clone(),
            checks,
        });
    }
    FleetView {
        hosts,
        generated_at: now.timestamp(),
    }
}

async fn get_api(
    State(state): State<ApiState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<FleetView>, ApiErrorResponse> {
    let filters = Filters::parse(raw.as_deref())?;
    Ok(Json(build_view(&state, &filters, Utc::now())))
}

async fn get_host(
    State(state): State<ApiState>,
    AxumPath(hostname): AxumPath<String>,
) -> Result<Json<HostView>, ApiErrorResponse> {
    let filters = Filters::default();
    let view = build_view(&state, &filters, Utc::now());
    view.hosts
        .into_iter()
        .find(|h| h.name == hostname)
        .map(Json)
        .ok_or_else(|| ApiErrorResponse(ApiError::UnknownHost(hostname)))
}

#[derive(Serialize)]
struct Summary {
    total: usize,
    by_status: HashMap<String, usize>,
}

async fn get_summary(
    State(state): State<ApiState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Summary>, ApiErrorResponse> {
    let filters = Filters::parse(raw.as_deref())?;
    let view = build_view(&state, &filters, Utc::now());
    let mut by_status = HashMap::new();
    for host in &view.hosts {
        *by_status.entry(host.status.to_string()).or_insert(0) += 1;
    }
    Ok(Json(Summary {
        total: view.hosts.len(),
        by_status,
    }))
}

async fn get_metrics(State(state): State<ApiState>) -> Response {
    let view = build_view(&state, &Filters::default(), Utc::now());
    let body = crate::metrics_text::render(&view);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn get_webui_index() -> Response {
    serve_embedded("index.html")
}

async fn get_webui_asset(AxumPath(path): AxumPath<String>) -> Response {
    serve_embedded(&path)
}

fn serve_embedded(path: &str) -> Response {
    match WebUiAssets::get(path) {
        Some(file) => {
            let mime = file.metadata.mimetype();
            ([(header::CONTENT_TYPE, mime.to_string())], file.data).into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

struct ApiErrorResponse(ApiError);

impl From<ApiError> for ApiErrorResponse {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ApiError::MalformedFilter(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownHost(_) => StatusCode::NOT_FOUND,
        };
        (status, self.0.to_string()).into_response()
    }
}

/// Build the full router: JSON API, metrics, rendered graphs, and the
/// embedded web UI shell.
pub fn router(state: ApiState) -> Router {
    let graph_service = ServeDir::new(state.graph_dir.clone());
    Router::new()
        .route("/api", get(get_api))
        .route("/api/hosts/:hostname", get(get_host))
        .route("/api/summary", get(get_summary))
        .route("/metrics", get(get_metrics))
        .route("/", get(get_webui_index))
        .route("/assets/*path", get(get_webui_asset))
        .nest_service("/imgs", graph_service)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_parse_rejects_tag_without_colon() {
        assert!(Filters::parse(Some("tag=no-colon-here")).is_err());
    }

    #[test]
    fn filter_parse_accepts_well_formed_tag() {
        let filters = Filters::parse(Some("tag=role:edge")).unwrap();
        assert_eq!(filters.tags, vec![("role".to_string(), "edge".to_string())]);
    }

    #[test]
    fn empty_filters_match_everything() {
        let filters = Filters::default();
        assert!(filters.matches("any-host", HostStatus::Up, &HashMap::new()));
    }

    #[test]
    fn hostname_filter_is_exact_match() {
        let filters = Filters::parse(Some("hostname=google")).unwrap();
        assert!(filters.matches("google", HostStatus::Up, &HashMap::new()));
        assert!(!filters.matches("not-google", HostStatus::Up, &HashMap::new()));
    }

    #[test]
    fn repeated_keys_combine_with_or_across_keys_with_and() {
        let filters = Filters::parse(Some("hostname=a&hostname=b&status=up")).unwrap();
        assert!(filters.matches("a", HostStatus::Up, &HashMap::new()));
        assert!(filters.matches("b", HostStatus::Up, &HashMap::new()));
        assert!(!filters.matches("a", HostStatus::Down, &HashMap::new()));
        assert!(!filters.matches("c", HostStatus::Up, &HashMap::new()));
    }
}
