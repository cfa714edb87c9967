use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tracing::warn;

use pulse_cache::{SnapshotCache, SnapshotKey, SnapshotMeta};
use pulse_core::coerce::{coerce_i64, str_field};
use pulse_core::event::{normalize_event, EventOutcome};
use pulse_core::route::normalize_route;
use pulse_core::now_ms;
use pulse_gateway::capture::{CaptureSpec, DEFAULT_VIEWPORT_HEIGHT, DEFAULT_VIEWPORT_WIDTH};
use pulse_gateway::{flux, CaptureConfig, CaptureGateway, GatewayError, StoreConfig, StoreGateway};
use pulse_heatmap::{Cell, GridSpec, HeatmapGrid};
use pulse_skeleton::{render_boxes, render_tree, SkeletonBox, Viewport};

// ── Config ──

pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

/// Heatmap grid and lookback defaults, overridable per request.
#[derive(Debug, Clone, Copy)]
pub struct HeatmapDefaults {
    pub cols: usize,
    pub rows: usize,
    pub lookback_hours: u32,
}

impl HeatmapDefaults {
    pub fn from_env() -> Self {
        Self {
            cols: env_usize("PULSE_HEATMAP_COLS", 12),
            rows: env_usize("PULSE_HEATMAP_ROWS", 8),
            lookback_hours: env_usize("PULSE_HEATMAP_LOOKBACK_HOURS", 24).min(168) as u32,
        }
    }

    fn grid(&self) -> GridSpec {
        GridSpec::new(self.cols, self.rows)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|value| *value >= 1)
        .unwrap_or(default)
}

/// Everything the server needs, assembled once at startup.
pub struct AppConfig {
    pub store: StoreConfig,
    pub capture: CaptureConfig,
    pub cache_dir: PathBuf,
    pub heatmap: HeatmapDefaults,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let cache_dir = std::env::var("PULSE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("heatmap_cache"));
        Self {
            store: StoreConfig::from_env(),
            capture: CaptureConfig::from_env(),
            cache_dir,
            heatmap: HeatmapDefaults::from_env(),
        }
    }
}

// ── App State ──

pub struct AppState {
    store: StoreGateway,
    capture: CaptureGateway,
    cache: SnapshotCache,
    heatmap: HeatmapDefaults,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            store: StoreGateway::new(config.store)?,
            capture: CaptureGateway::new(config.capture)?,
            cache: SnapshotCache::new(config.cache_dir),
            heatmap: config.heatmap,
        }))
    }
}

// ── Error Handling ──

enum AppError {
    BadRequest(String),
    NotFound(String),
    Gateway(GatewayError),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Gateway(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
            AppError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        Self::Gateway(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

// ── Entrypoint ──

pub async fn serve(config: ServeConfig, app_config: AppConfig) -> anyhow::Result<()> {
    let state = AppState::new(app_config)?;
    let app = router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    eprintln!("pulse HTTP server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router (for testing without binding to a port).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/summary", get(get_summary))
        .route("/api/top-routes", get(get_top_routes))
        .route("/api/series", get(get_series))
        .route("/ba", post(post_event))
        .route("/ba/snapshot", post(post_skeleton))
        .route("/snapshot/request", post(post_snapshot_request))
        .route("/heatmap", get(get_heatmap))
        .route("/heatmap/media", get(get_heatmap_media))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

// ── POST /ba ──

/// Ingest one interaction event. Always answers 204 with an empty body;
/// malformed input and store failures are invisible to the client.
async fn post_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let ip = client_ip(&headers);
    let Ok(value) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::NO_CONTENT;
    };
    let Some(event) = value.as_object() else {
        return StatusCode::NO_CONTENT;
    };

    match normalize_event(event, now_ms(), &ip) {
        EventOutcome::Heartbeat => {}
        EventOutcome::Record(record) => {
            let lines: Vec<String> = record.lines().iter().map(|line| line.encode()).collect();
            state.store.write_lines(&lines).await;
        }
    }
    StatusCode::NO_CONTENT
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

// ── POST /ba/snapshot ──

/// Accept a client-rendered page skeleton and cache it as a wireframe
/// document. Same contract as ingest: always 204.
async fn post_skeleton(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let Ok(value) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::NO_CONTENT;
    };
    let Some(payload) = value.as_object() else {
        return StatusCode::NO_CONTENT;
    };

    let raw_route = first_nonempty(payload, &["route", "path", "url"]);
    let route = normalize_route(Some(&raw_route));
    let route_norm_raw = str_field(payload, "route_norm");
    let route_norm = if route_norm_raw.is_empty() {
        route.clone()
    } else {
        normalize_route(Some(&route_norm_raw))
    };

    let site = str_field(payload, "site");
    let snapshot_hash = non_empty_or(str_field(payload, "snapshot_hash"), "default");
    let vp_bucket = non_empty_or(first_nonempty(payload, &["vp_bucket", "vp"]), "any");
    let grid_id = non_empty_or(first_nonempty(payload, &["grid_id", "grid"]), "grid");
    let section = non_empty_or(str_field(payload, "section"), "all");

    let Some(skeleton) = payload.get("skeleton").and_then(Value::as_object) else {
        return StatusCode::NO_CONTENT;
    };

    let captured_at = skeleton
        .get("captured_at")
        .map(|value| coerce_i64(value, now_ms()))
        .unwrap_or_else(now_ms);
    let label_raw = str_field(skeleton, "label");
    let label = if !label_raw.is_empty() {
        label_raw
    } else if !site.is_empty() {
        format!("{site} · {route_norm}")
    } else {
        format!("{route_norm} · {snapshot_hash}")
    };

    let (html, box_count) = match render_skeleton(skeleton, &label) {
        Some(rendered) => rendered,
        None => return StatusCode::NO_CONTENT,
    };

    let key = SnapshotKey {
        route_norm: route_norm.clone(),
        snapshot_hash: snapshot_hash.clone(),
        vp_bucket: vp_bucket.clone(),
        grid_id: grid_id.clone(),
        section: section.clone(),
    };
    let meta = SnapshotMeta {
        route: if raw_route.is_empty() { route } else { raw_route },
        route_norm,
        snapshot_hash,
        vp_bucket,
        grid_id,
        section,
        site: non_empty_or(site, "default"),
        captured_at: Some(captured_at),
        format: Some("html".to_string()),
        boxes: box_count,
        label: Some(label),
        ..Default::default()
    };
    let stored = state
        .cache
        .write_html(&key, &html)
        .and_then(|path| state.cache.write_meta(&path, &meta));
    if let Err(err) = stored {
        warn!(%err, "failed to persist skeleton cache entry");
    }
    StatusCode::NO_CONTENT
}

/// Dispatch on the skeleton shape: a flat `boxes` list renders with the
/// box stage, a serialized DOM under `node` goes through the tree walker.
fn render_skeleton(
    skeleton: &Map<String, Value>,
    label: &str,
) -> Option<(String, Option<usize>)> {
    if let Some(boxes_value) = skeleton.get("boxes") {
        let boxes: Vec<SkeletonBox> = match serde_json::from_value(boxes_value.clone()) {
            Ok(boxes) => boxes,
            Err(err) => {
                warn!(%err, "unreadable skeleton box list");
                return None;
            }
        };
        let viewport: Option<Viewport> = skeleton
            .get("viewport")
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        let count = boxes.len();
        return Some((render_boxes(&boxes, viewport, label), Some(count)));
    }
    if let Some(node) = skeleton.get("node") {
        if node.is_object() {
            return Some((render_tree(node, label), None));
        }
    }
    None
}

// ── POST /snapshot/request ──

#[derive(Deserialize)]
struct SnapshotRequestBody {
    url: String,
    site: Option<String>,
    route: Option<String>,
    #[serde(alias = "snapshot")]
    snapshot_hash: Option<String>,
    #[serde(alias = "vp")]
    vp_bucket: Option<String>,
    #[serde(alias = "grid")]
    grid_id: Option<String>,
    section: Option<String>,
    viewport: Option<ViewportBody>,
}

#[derive(Deserialize, Default)]
struct ViewportBody {
    width: Option<i64>,
    height: Option<i64>,
    #[serde(alias = "dpr")]
    device_scale_factor: Option<f64>,
}

#[derive(Serialize)]
struct SnapshotRequestResponse {
    ok: bool,
    route: String,
    snapshot_hash: String,
    vp_bucket: String,
    grid_id: String,
    section: String,
    width: i64,
    height: i64,
    bytes: u64,
    rel_path: String,
    format: String,
    captured_at: i64,
    sha256: Option<String>,
}

/// Ask the capture worker to screenshot a page into the snapshot cache.
async fn post_snapshot_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SnapshotRequestBody>,
) -> Result<Json<SnapshotRequestResponse>, AppError> {
    let target_url = body.url.trim().to_string();
    let parsed = url::Url::parse(&target_url)
        .map_err(|_| AppError::BadRequest("invalid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(AppError::BadRequest("invalid URL".to_string()));
    }

    let raw_route = match body.route.as_deref().map(str::trim) {
        Some(route) if !route.is_empty() => route.to_string(),
        _ => parsed.path().to_string(),
    };
    let route_norm = normalize_route(Some(&raw_route));
    let site = clean_token(body.site.as_deref(), "default", 120);
    let snapshot_hash = clean_token(body.snapshot_hash.as_deref(), "default", 80);
    let vp_bucket = clean_token(body.vp_bucket.as_deref(), "any", 40);
    let grid_id = clean_token(body.grid_id.as_deref(), &state.heatmap.grid().id(), 40);
    let section = clean_token(body.section.as_deref(), "all", 40);

    let viewport = body.viewport.unwrap_or_default();
    let width = viewport
        .width
        .filter(|w| *w > 0)
        .map(|w| w.clamp(240, 8192))
        .unwrap_or(DEFAULT_VIEWPORT_WIDTH);
    let height = viewport
        .height
        .filter(|h| *h > 0)
        .map(|h| h.clamp(240, 8192))
        .unwrap_or(DEFAULT_VIEWPORT_HEIGHT);
    let device_scale = viewport
        .device_scale_factor
        .filter(|dpr| *dpr > 0.0)
        .map(|dpr| dpr.clamp(0.1, 4.0))
        .unwrap_or(1.0);

    let key = SnapshotKey {
        route_norm: route_norm.clone(),
        snapshot_hash: snapshot_hash.clone(),
        vp_bucket: vp_bucket.clone(),
        grid_id: grid_id.clone(),
        section: section.clone(),
    };
    let rel_path = state.cache.rel_media_path(&key, "webp");

    let mut spec = CaptureSpec::new(target_url.clone(), rel_path.clone());
    spec.width = width;
    spec.height = height;
    spec.device_scale_factor = device_scale;
    let result = state.capture.capture(&spec).await?;

    let captured_at = result.captured_at.unwrap_or_else(now_ms);
    let out_width = result.width.filter(|w| *w > 0).unwrap_or(width);
    let out_height = result.height.filter(|h| *h > 0).unwrap_or(height);
    let size_bytes = result.bytes.unwrap_or(0);
    let media_format = result
        .format
        .map(|format| format.to_lowercase())
        .filter(|format| !format.is_empty())
        .unwrap_or_else(|| "webp".to_string());

    let meta = SnapshotMeta {
        route: raw_route,
        route_norm: route_norm.clone(),
        snapshot_hash: snapshot_hash.clone(),
        vp_bucket: vp_bucket.clone(),
        grid_id: grid_id.clone(),
        section: section.clone(),
        site,
        captured_at: Some(captured_at),
        width: Some(out_width),
        height: Some(out_height),
        bytes: Some(size_bytes),
        duration_ms: result.duration_ms,
        format: Some(media_format.clone()),
        sha256: result.sha256.clone(),
        url: Some(target_url),
        rel_path: Some(rel_path.clone()),
        ..Default::default()
    };
    let content_path = state.cache.media_path(&key, &media_format);
    if let Err(err) = state.cache.write_meta(&content_path, &meta) {
        warn!(%err, "failed to persist snapshot metadata");
    }

    Ok(Json(SnapshotRequestResponse {
        ok: true,
        route: route_norm,
        snapshot_hash,
        vp_bucket,
        grid_id,
        section,
        width: out_width,
        height: out_height,
        bytes: size_bytes,
        rel_path,
        format: media_format,
        captured_at,
        sha256: result.sha256,
    }))
}

/// Trim, strip non-printable ASCII, cap length; fall back to a default.
fn clean_token(value: Option<&str>, default: &str, limit: usize) -> String {
    let Some(text) = value.map(str::trim).filter(|text| !text.is_empty()) else {
        return default.to_string();
    };
    let sanitized: String = text
        .chars()
        .filter(|ch| (' '..='~').contains(ch))
        .take(limit)
        .collect();
    non_empty_or(sanitized, default)
}

// ── GET /api/summary ──

#[derive(Deserialize)]
struct SummaryQuery {
    hours: Option<i64>,
    site: Option<String>,
}

#[derive(Serialize)]
struct SummaryResponse {
    site: Option<String>,
    hours: u32,
    count: i64,
}

async fn get_summary(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SummaryQuery>,
) -> Result<Json<SummaryResponse>, AppError> {
    let hours = validate_hours(params.hours, state.heatmap.lookback_hours)?;
    let site = normalize_site(params.site);
    let query = flux::summary(state.store.bucket(), hours, site.as_deref());
    let rows = state.store.query(&query).await?;

    let count = rows
        .iter()
        .filter_map(|row| row_i64(row, "_value"))
        .sum::<i64>();
    Ok(Json(SummaryResponse { site, hours, count }))
}

// ── GET /api/top-routes ──

#[derive(Deserialize)]
struct TopRoutesQuery {
    hours: Option<i64>,
    limit: Option<i64>,
    site: Option<String>,
}

#[derive(Serialize)]
struct RouteCount {
    route: String,
    count: i64,
}

#[derive(Serialize)]
struct TopRoutesResponse {
    site: Option<String>,
    hours: u32,
    limit: u32,
    routes: Vec<RouteCount>,
}

async fn get_top_routes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopRoutesQuery>,
) -> Result<Json<TopRoutesResponse>, AppError> {
    let hours = validate_hours(params.hours, state.heatmap.lookback_hours)?;
    let limit = match params.limit {
        None => 10,
        Some(limit) if (1..=50).contains(&limit) => limit as u32,
        Some(_) => return Err(AppError::BadRequest("limit must be 1-50".to_string())),
    };
    let site = normalize_site(params.site);
    let query = flux::top_routes(state.store.bucket(), hours, limit, site.as_deref());
    let rows = state.store.query(&query).await?;

    let mut totals: HashMap<String, i64> = HashMap::new();
    for row in &rows {
        let Some(route) = row.get("route").filter(|route| !route.is_empty()) else {
            continue;
        };
        let Some(value) = row_i64(row, "_value") else {
            continue;
        };
        *totals.entry(route.clone()).or_insert(0) += value;
    }
    let mut routes: Vec<RouteCount> = totals
        .into_iter()
        .map(|(route, count)| RouteCount { route, count })
        .collect();
    routes.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.route.cmp(&b.route)));
    routes.truncate(limit as usize);

    Ok(Json(TopRoutesResponse {
        site,
        hours,
        limit,
        routes,
    }))
}

// ── GET /api/series ──

#[derive(Deserialize)]
struct SeriesQuery {
    hours: Option<i64>,
    bucket: Option<String>,
    site: Option<String>,
}

#[derive(Serialize)]
struct SeriesPoint {
    ts: String,
    count: i64,
}

#[derive(Serialize)]
struct SeriesResponse {
    site: Option<String>,
    hours: u32,
    bucket: String,
    points: Vec<SeriesPoint>,
}

async fn get_series(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesQuery>,
) -> Result<Json<SeriesResponse>, AppError> {
    let hours = validate_hours(params.hours, state.heatmap.lookback_hours)?;
    let bucket = params.bucket.unwrap_or_else(|| "5m".to_string());
    if !flux::valid_window(&bucket) {
        return Err(AppError::BadRequest("invalid bucket size".to_string()));
    }
    let site = normalize_site(params.site);
    let query = flux::series(state.store.bucket(), hours, &bucket, site.as_deref());
    let rows = state.store.query(&query).await?;

    let mut points: Vec<SeriesPoint> = rows
        .iter()
        .filter_map(|row| {
            let ts = row.get("_time").filter(|ts| !ts.is_empty())?;
            let count = row_i64(row, "_value")?;
            Some(SeriesPoint {
                ts: ts.clone(),
                count,
            })
        })
        .collect();
    points.sort_by(|a, b| a.ts.cmp(&b.ts));

    Ok(Json(SeriesResponse {
        site,
        hours,
        bucket,
        points,
    }))
}

// ── GET /heatmap ──

#[derive(Deserialize)]
struct HeatmapQuery {
    route: Option<String>,
    snapshot: Option<String>,
    vp: Option<String>,
    grid: Option<String>,
    section: Option<String>,
    site: Option<String>,
    hours: Option<i64>,
}

#[derive(Serialize)]
struct HeatmapFilters {
    site: String,
    route: String,
    snapshot: String,
    vp: String,
    grid: String,
    section: String,
    hours: u32,
}

#[derive(Serialize)]
struct CachedRouteLink {
    route: String,
    route_norm: String,
    url: String,
    resolution: String,
    size: String,
    format: String,
    captured_at: String,
    active: bool,
}

#[derive(Serialize)]
struct HeatmapResponse {
    grid: Vec<Vec<f64>>,
    raw_grid: Vec<Vec<u64>>,
    cells: Vec<Cell>,
    cols: usize,
    rows: usize,
    hours: u32,
    max_count: u64,
    total_count: u64,
    route_norm: String,
    snapshot_hash: String,
    vp_bucket: String,
    grid_id: String,
    section: String,
    site: String,
    snapshot_media_url: Option<String>,
    snapshot_available: bool,
    snapshot_meta: Option<SnapshotMeta>,
    snapshot_size: String,
    snapshot_aspect_ratio: Option<String>,
    snapshot_captured: String,
    cache_path: String,
    cached_routes: Vec<CachedRouteLink>,
    filters: HeatmapFilters,
}

/// Click-density view model: the aggregated grid, resolved filters, cached
/// snapshot media, and navigation links to other cached routes. Store
/// trouble degrades to an all-zero grid rather than an error.
async fn get_heatmap(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HeatmapQuery>,
) -> Result<Response, AppError> {
    let hours = validate_hours(params.hours, state.heatmap.lookback_hours)?;
    let route = params.route.unwrap_or_else(|| "/".to_string());
    let route_norm = normalize_route(Some(&route));
    let spec = GridSpec::parse(params.grid.as_deref(), state.heatmap.grid());
    let grid_id = spec.id();

    let snapshot_param = params.snapshot.unwrap_or_default().trim().to_string();
    let snapshot_hash = non_empty_or(snapshot_param.clone(), "default");
    let snapshot_filter = facet_filter(&snapshot_hash, &["*", "all", "any"]);

    let vp_param = params.vp.unwrap_or_default().trim().to_string();
    let vp_filter = facet_filter(&vp_param, &["", "*", "any"]);

    let section_param = params.section.unwrap_or_default().trim().to_string();
    let section_filter = facet_filter(&section_param, &["", "*", "all", "__all__"]);

    let site_param = params.site.unwrap_or_default().trim().to_string();

    let filter = flux::HeatmapFilter {
        site: facet_filter(&site_param, &[""]),
        route_norm: Some(route_norm.clone()),
        snapshot: snapshot_filter.clone(),
        grid: Some(grid_id.clone()),
        vp: vp_filter.clone(),
        section: section_filter.clone(),
    };
    let query = flux::click_heatmap(state.store.bucket(), hours, &filter);
    let rows = state.store.query_or_empty(&query).await;
    let grid = HeatmapGrid::accumulate(spec, rows.iter());

    let cache_snapshot_key = if snapshot_filter.is_some() {
        snapshot_hash.clone()
    } else {
        non_empty_or(snapshot_hash.clone(), "all")
    };
    let cache_vp_key = if vp_filter.is_some() {
        vp_param.clone()
    } else {
        "any".to_string()
    };
    let cache_section_key = if section_filter.is_some() {
        section_param.clone()
    } else {
        "all".to_string()
    };

    let key = SnapshotKey {
        route_norm: route_norm.clone(),
        snapshot_hash: cache_snapshot_key.clone(),
        vp_bucket: cache_vp_key.clone(),
        grid_id: grid_id.clone(),
        section: cache_section_key.clone(),
    };
    let media = state.cache.media_info(&key);
    let snapshot_media_url = if media.available {
        Some(media_url(
            &route_norm,
            &cache_snapshot_key,
            &cache_vp_key,
            &grid_id,
            &cache_section_key,
            media.etag.as_deref(),
        ))
    } else {
        None
    };

    let cached_routes = cached_route_links(
        &state.cache,
        &snapshot_hash,
        &route_norm,
        &snapshot_param,
        &vp_param,
        params.grid.as_deref(),
        &section_param,
        &site_param,
        hours,
    );

    let etag = media.etag.clone();
    let response = HeatmapResponse {
        grid: grid.normalized(),
        raw_grid: grid.raw.clone(),
        cells: grid.cells(),
        cols: spec.cols,
        rows: spec.rows,
        hours,
        max_count: grid.max_count,
        total_count: grid.total_count,
        route_norm: route_norm.clone(),
        snapshot_hash: snapshot_hash.clone(),
        vp_bucket: cache_vp_key,
        grid_id: grid_id.clone(),
        section: section_param.clone(),
        site: site_param.clone(),
        snapshot_media_url,
        snapshot_available: media.available,
        snapshot_size: format_filesize(media.size_bytes),
        snapshot_aspect_ratio: media.meta.as_ref().and_then(format_aspect_ratio),
        snapshot_captured: media
            .meta
            .as_ref()
            .map(|meta| format_timestamp(meta.captured_at))
            .unwrap_or_default(),
        snapshot_meta: media.meta,
        cache_path: media.rel_path,
        cached_routes,
        filters: HeatmapFilters {
            site: site_param,
            route: route_norm,
            snapshot: snapshot_hash,
            vp: vp_param,
            grid: grid_id,
            section: section_param,
            hours,
        },
    };

    let mut headers = HeaderMap::new();
    if let Some(etag) = etag {
        if let Ok(value) = HeaderValue::from_str(&etag) {
            headers.insert(ETAG, value);
        }
    }
    Ok((headers, Json(response)).into_response())
}

/// Navigation links to other cached routes under the same snapshot hash:
/// site-filtered, newest first, one entry per normalized route, capped
/// at 16.
#[allow(clippy::too_many_arguments)]
fn cached_route_links(
    cache: &SnapshotCache,
    snapshot_hash: &str,
    route_norm: &str,
    snapshot_param: &str,
    vp_param: &str,
    grid_param: Option<&str>,
    section_param: &str,
    site_param: &str,
    hours: u32,
) -> Vec<CachedRouteLink> {
    let mut entries = cache.list_meta(Some(snapshot_hash));
    entries.retain(|entry| {
        if !site_param.is_empty() && !entry.site.is_empty() && entry.site != site_param {
            return false;
        }
        !entry.route.is_empty() || !entry.route_norm.is_empty()
    });
    entries.sort_by_key(|entry| std::cmp::Reverse(entry.captured_at.unwrap_or(0)));

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for entry in entries {
        let route_value = if entry.route.is_empty() {
            entry.route_norm.clone()
        } else {
            entry.route.clone()
        };
        let norm_value = if entry.route_norm.is_empty() {
            normalize_route(Some(&route_value))
        } else {
            entry.route_norm.clone()
        };
        if !seen.insert(norm_value.clone()) {
            continue;
        }
        let url = heatmap_link(
            &route_value,
            snapshot_param,
            vp_param,
            grid_param,
            section_param,
            site_param,
            hours,
        );
        links.push(CachedRouteLink {
            route: route_value,
            route_norm: norm_value.clone(),
            url,
            resolution: format_resolution(entry.width, entry.height),
            size: format_filesize(entry.bytes.unwrap_or(0)),
            format: entry
                .format
                .unwrap_or_else(|| "webp".to_string())
                .to_uppercase(),
            captured_at: format_timestamp(entry.captured_at),
            active: norm_value == route_norm,
        });
        if links.len() >= 16 {
            break;
        }
    }
    links
}

fn heatmap_link(
    route: &str,
    snapshot_param: &str,
    vp_param: &str,
    grid_param: Option<&str>,
    section_param: &str,
    site_param: &str,
    hours: u32,
) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("route", if route.is_empty() { "/" } else { route });
    if !snapshot_param.is_empty() {
        query.append_pair("snapshot", snapshot_param);
    }
    if !vp_param.is_empty() {
        query.append_pair("vp", vp_param);
    }
    if let Some(grid) = grid_param.filter(|grid| !grid.is_empty()) {
        query.append_pair("grid", grid);
    }
    if !section_param.is_empty() {
        query.append_pair("section", section_param);
    }
    if !site_param.is_empty() {
        query.append_pair("site", site_param);
    }
    query.append_pair("hours", &hours.to_string());
    format!("/heatmap?{}", query.finish())
}

fn media_url(
    route_norm: &str,
    snapshot_hash: &str,
    vp_bucket: &str,
    grid_id: &str,
    section: &str,
    etag: Option<&str>,
) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    let pairs = [
        ("route", non_empty_or(route_norm.to_string(), "/")),
        ("snapshot", non_empty_or(snapshot_hash.to_string(), "default")),
        ("vp", non_empty_or(vp_bucket.to_string(), "any")),
        ("grid", grid_id.to_string()),
        ("section", section.to_string()),
    ];
    for (name, value) in pairs {
        if !value.is_empty() {
            query.append_pair(name, &value);
        }
    }
    if let Some(etag) = etag {
        // short version token for cache-busting
        query.append_pair("v", etag.get(..12).unwrap_or(etag));
    }
    format!("/heatmap/media?{}", query.finish())
}

// ── GET /heatmap/media ──

#[derive(Deserialize)]
struct MediaQuery {
    route: Option<String>,
    snapshot: Option<String>,
    vp: Option<String>,
    grid: Option<String>,
    section: Option<String>,
}

async fn get_heatmap_media(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MediaQuery>,
) -> Result<Response, AppError> {
    let route = params.route.unwrap_or_else(|| "/".to_string());
    let route_norm = normalize_route(Some(&route));
    let grid_id = GridSpec::parse(params.grid.as_deref(), state.heatmap.grid()).id();
    let snapshot_hash = non_empty_or(params.snapshot.unwrap_or_default().trim().to_string(), "default");
    let vp_bucket = non_empty_or(params.vp.unwrap_or_default().trim().to_string(), "any");
    let section = non_empty_or(params.section.unwrap_or_default().trim().to_string(), "all");

    let key = SnapshotKey {
        route_norm,
        snapshot_hash,
        vp_bucket,
        grid_id,
        section,
    };
    let info = state.cache.media_info(&key);
    if !info.available {
        return Err(AppError::NotFound("snapshot not found".to_string()));
    }
    let bytes = std::fs::read(&info.path)
        .map_err(|_| AppError::NotFound("snapshot not found".to_string()))?;

    let format = info.meta.as_ref().and_then(|meta| meta.format.clone());
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(media_type(format.as_deref())));
    if let Some(etag) = info.etag {
        if let Ok(value) = HeaderValue::from_str(&etag) {
            headers.insert(ETAG, value);
        }
    }
    Ok((headers, bytes).into_response())
}

fn media_type(format: Option<&str>) -> &'static str {
    match format.map(str::trim).map(str::to_lowercase).as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("avif") => "image/avif",
        Some("html") => "text/html; charset=utf-8",
        _ => "image/webp",
    }
}

// ── Shared helpers ──

fn validate_hours(hours: Option<i64>, default: u32) -> Result<u32, AppError> {
    match hours {
        None => Ok(default),
        Some(hours) if (1..=168).contains(&hours) => Ok(hours as u32),
        Some(_) => Err(AppError::BadRequest("hours must be 1-168".to_string())),
    }
}

fn normalize_site(site: Option<String>) -> Option<String> {
    site.map(|site| site.trim().to_string())
        .filter(|site| !site.is_empty())
}

/// `None` when the token is one of the wildcard spellings for its facet
/// (case-insensitive), widening the store query.
fn facet_filter(token: &str, wildcards: &[&str]) -> Option<String> {
    let lowered = token.to_lowercase();
    if wildcards.contains(&lowered.as_str()) {
        None
    } else {
        Some(token.to_string())
    }
}

fn first_nonempty(map: &Map<String, Value>, keys: &[&str]) -> String {
    for key in keys {
        let text = str_field(map, key);
        if !text.is_empty() {
            return text;
        }
    }
    String::new()
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn row_i64(row: &HashMap<String, String>, key: &str) -> Option<i64> {
    row.get(key)?.parse::<f64>().ok().map(|value| value as i64)
}

fn format_filesize(size: u64) -> String {
    if size == 0 {
        return String::new();
    }
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut number = size as f64;
    let mut idx = 0;
    while number >= 1024.0 && idx < units.len() - 1 {
        number /= 1024.0;
        idx += 1;
    }
    if idx == 0 {
        format!("{} {}", size, units[idx])
    } else {
        format!("{number:.1} {}", units[idx])
    }
}

fn format_resolution(width: Option<i64>, height: Option<i64>) -> String {
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => format!("{w}×{h}"),
        _ => String::new(),
    }
}

fn format_aspect_ratio(meta: &SnapshotMeta) -> Option<String> {
    let width = meta.width.filter(|w| *w > 0)?;
    let height = meta.height.filter(|h| *h > 0)?;
    Some(format!("{width} / {height}"))
}

/// Render an epoch timestamp (seconds or milliseconds) as `YYYY-MM-DD HH:MM`
/// UTC; unusable values render empty.
fn format_timestamp(value: Option<i64>) -> String {
    let Some(raw) = value else {
        return String::new();
    };
    let seconds = if raw > 10_000_000_000 { raw / 1000 } else { raw };
    let Ok(moment) = time::OffsetDateTime::from_unix_timestamp(seconds) else {
        return String::new();
    };
    let Ok(layout) = time::format_description::parse("[year]-[month]-[day] [hour]:[minute]")
    else {
        return String::new();
    };
    moment.format(&layout).unwrap_or_default()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::Path;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(cache_dir: &Path) -> Arc<AppState> {
        // port 9 is unassigned locally, connections fail fast
        AppState::new(AppConfig {
            store: StoreConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                org: "pulse".to_string(),
                bucket: "pulse".to_string(),
                token: String::new(),
            },
            capture: CaptureConfig {
                worker_url: "http://127.0.0.1:9".to_string(),
                timeout: Duration::from_secs(2),
            },
            cache_dir: cache_dir.to_path_buf(),
            heatmap: HeatmapDefaults {
                cols: 12,
                rows: 8,
                lookback_hours: 24,
            },
        })
        .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn ingest_accepts_garbage_body() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ba")
                    .body(Body::from("this is not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn ingest_heartbeat_is_acknowledged() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(post_json("/ba", serde_json::json!({"type": "heartbeat"})))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn ingest_swallows_store_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(post_json(
                "/ba",
                serde_json::json!({
                    "site": "shop",
                    "type": "click",
                    "route": "/pricing",
                    "x_bin": 3,
                    "y_bin": 2
                }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn skeleton_submission_caches_wireframe() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(post_json(
                "/ba/snapshot",
                serde_json::json!({
                    "route": "/pricing",
                    "site": "shop",
                    "skeleton": {
                        "viewport": {"w": 1280, "h": 720},
                        "boxes": [
                            {"x": 0.0, "y": 0.0, "w": 1.0, "h": 0.1, "kind": "header"},
                            {"x": 0.1, "y": 0.2, "w": 0.5, "h": 0.3, "kind": "card"}
                        ]
                    }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let entry = tmp
            .path()
            .join("default/pricing/any/grid/all/index.html");
        assert!(entry.exists());
        assert!(entry.with_file_name("meta.json").exists());
        let html = std::fs::read_to_string(&entry).unwrap();
        assert!(html.contains("data-kind=\"header\""));
    }

    #[tokio::test]
    async fn skeleton_with_dotdot_keys_stays_inside_cache_root() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(post_json(
                "/ba/snapshot",
                serde_json::json!({
                    "route": "/pricing",
                    "snapshot_hash": "..",
                    "vp_bucket": "..",
                    "section": "..",
                    "skeleton": {
                        "boxes": [{"x": 0.0, "y": 0.0, "w": 1.0, "h": 0.1}]
                    }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        // Traversal tokens collapse to the default component.
        let entry = tmp
            .path()
            .join("default/pricing/default/grid/default/index.html");
        assert!(entry.exists());
        assert!(!tmp.path().join("../pricing").exists());
    }

    #[tokio::test]
    async fn skeleton_without_renderable_payload_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let app = router(state);

        let resp = app
            .oneshot(post_json(
                "/ba/snapshot",
                serde_json::json!({"route": "/x", "skeleton": {"unknown": 1}}),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(!tmp.path().join("default").exists());
    }

    #[tokio::test]
    async fn snapshot_request_rejects_bad_url() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());

        for url in ["ftp://example.com/x", "not a url", "http://"] {
            let resp = router(state.clone())
                .oneshot(post_json("/snapshot/request", serde_json::json!({"url": url})))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{url}");
        }
    }

    #[tokio::test]
    async fn snapshot_request_maps_worker_failure_to_502() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(post_json(
                "/snapshot/request",
                serde_json::json!({"url": "https://example.com/pricing"}),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn summary_maps_store_failure_to_502() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/summary")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn summary_rejects_out_of_range_hours() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/summary?hours=500")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn series_rejects_bad_bucket_token() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/series?bucket=5x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn top_routes_rejects_bad_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/top-routes?limit=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn heatmap_degrades_to_empty_grid_when_store_down() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/heatmap?route=/pricing&grid=6x4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total_count"], 0);
        assert_eq!(json["max_count"], 0);
        assert_eq!(json["cols"], 6);
        assert_eq!(json["rows"], 4);
        assert_eq!(json["cells"].as_array().unwrap().len(), 24);
        assert_eq!(json["route_norm"], "/pricing");
        assert_eq!(json["snapshot_available"], false);
        assert!(json["snapshot_media_url"].is_null());
    }

    #[tokio::test]
    async fn heatmap_lists_cached_routes() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let app = router(state.clone());

        for (route, captured) in [("/pricing", 200i64), ("/about", 100)] {
            let key = SnapshotKey {
                route_norm: route.to_string(),
                snapshot_hash: "default".to_string(),
                vp_bucket: "any".to_string(),
                grid_id: "12x8".to_string(),
                section: "all".to_string(),
            };
            let path = state.cache.write_html(&key, "<html></html>").unwrap();
            state
                .cache
                .write_meta(
                    &path,
                    &SnapshotMeta {
                        route: route.to_string(),
                        route_norm: route.to_string(),
                        snapshot_hash: "default".to_string(),
                        captured_at: Some(captured),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/heatmap?route=/pricing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let routes = json["cached_routes"].as_array().unwrap();
        assert_eq!(routes.len(), 2);
        // newest first
        assert_eq!(routes[0]["route_norm"], "/pricing");
        assert_eq!(routes[0]["active"], true);
        assert_eq!(routes[1]["active"], false);
        assert!(routes[0]["url"].as_str().unwrap().starts_with("/heatmap?route="));
    }

    #[tokio::test]
    async fn heatmap_media_missing_returns_404() {
        let tmp = tempfile::tempdir().unwrap();
        let app = router(test_state(tmp.path()));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/heatmap/media?route=/nowhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heatmap_media_serves_cached_html() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path());
        let app = router(state.clone());

        let key = SnapshotKey {
            route_norm: "/pricing".to_string(),
            snapshot_hash: "default".to_string(),
            vp_bucket: "any".to_string(),
            grid_id: "12x8".to_string(),
            section: "all".to_string(),
        };
        let path = state.cache.write_html(&key, "<html>wf</html>").unwrap();
        state
            .cache
            .write_meta(
                &path,
                &SnapshotMeta {
                    route_norm: "/pricing".to_string(),
                    snapshot_hash: "default".to_string(),
                    format: Some("html".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/heatmap/media?route=/pricing&grid=12x8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(ETAG));
        assert_eq!(
            resp.headers()[CONTENT_TYPE],
            HeaderValue::from_static("text/html; charset=utf-8")
        );
    }

    #[test]
    fn filesize_formatting() {
        assert_eq!(format_filesize(0), "");
        assert_eq!(format_filesize(512), "512 B");
        assert_eq!(format_filesize(2048), "2.0 KB");
        assert_eq!(format_filesize(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn wildcard_facets_resolve_to_none() {
        assert!(facet_filter("ALL", &["*", "all", "any"]).is_none());
        assert!(facet_filter("*", &["*", "all", "any"]).is_none());
        assert_eq!(
            facet_filter("v3", &["*", "all", "any"]).as_deref(),
            Some("v3")
        );
    }

    #[test]
    fn timestamp_formatting_handles_both_scales() {
        let ms = format_timestamp(Some(1_760_000_000_000));
        let secs = format_timestamp(Some(1_760_000_000));
        assert_eq!(ms, secs);
        assert!(ms.starts_with("2025-10-09"));
        assert_eq!(format_timestamp(None), "");
    }
}
