//! Event normalization: raw untrusted payload → canonical record → lines.
//!
//! A raw event is whatever JSON object the client sent. Every field is
//! optional and may be the wrong type; normalization coerces with defaults
//! and never fails. Presence is tracked separately from the coerced value
//! so "present but zero" and "absent" encode differently downstream.

use serde_json::{Map, Value};

use crate::coerce::{coerce_f64, coerce_i64, str_field, string_like, try_f64};
use crate::line::Line;
use crate::route::normalize_route;
use crate::{CLICK_MEASUREMENT, MEASUREMENT};

/// Sentinel for absent document-relative coordinates.
const DOC_ABSENT: f64 = -1.0;

/// Viewport pointer coordinates, each tracked for presence independently.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Coords {
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub page_x: Option<i64>,
    pub page_y: Option<i64>,
}

impl Coords {
    pub fn any_present(&self) -> bool {
        self.x.is_some() || self.y.is_some() || self.page_x.is_some() || self.page_y.is_some()
    }
}

/// The normalized interaction record. Exists only long enough to produce
/// line-protocol statements; nothing retains it in-process.
#[derive(Debug, Clone)]
pub struct CanonicalEvent {
    pub site: String,
    pub event_type: String,
    pub route: String,
    pub route_norm: String,
    pub path: String,
    pub element: String,
    pub element_text: String,
    pub el_hash: String,
    pub section: String,
    pub depth: i64,
    pub sec: i64,
    pub vp_w: i64,
    pub vp_h: i64,
    pub vp_dpr: f64,
    pub coords: Coords,
    pub x_bin: Option<i64>,
    pub y_bin: Option<i64>,
    pub doc_x: f64,
    pub doc_y: f64,
    pub doc_w: i64,
    pub doc_h: i64,
    pub scroll_top: Option<i64>,
    pub scroll_height: Option<i64>,
    pub viewport_height: Option<i64>,
    pub snapshot_hash: String,
    pub vp_bucket: String,
    pub grid_id: String,
    pub event_id: Option<String>,
    pub uid: Option<String>,
    pub sid: Option<String>,
    pub source: Option<Value>,
    pub trigger: Option<Value>,
    pub client_ip: String,
    pub timestamp_ms: i64,
}

/// What normalization decided to do with a raw event.
#[derive(Debug)]
pub enum EventOutcome {
    /// Heartbeats are acknowledged but never persisted.
    Heartbeat,
    Record(Box<CanonicalEvent>),
}

/// Normalize a raw event object. `now_ms` is the ingestion wall clock,
/// used when the client supplies no parseable timestamp. `client_ip` is
/// whatever the HTTP layer saw (may be empty).
pub fn normalize_event(raw: &Map<String, Value>, now_ms: i64, client_ip: &str) -> EventOutcome {
    let site = non_empty(str_field(raw, "site"), "default");
    let event_type = non_empty(str_field(raw, "type"), "event");
    if event_type.eq_ignore_ascii_case("heartbeat") {
        return EventOutcome::Heartbeat;
    }

    let route_source = first_string(raw, &["route", "path", "url"]);
    let route = normalize_route(route_source.as_deref());
    let route_norm_raw = str_field(raw, "route_norm");
    let route_norm = if route_norm_raw.is_empty() {
        route.clone()
    } else {
        normalize_route(Some(&route_norm_raw))
    };

    let vp = raw.get("vp").and_then(Value::as_object);
    let vp_field = |key: &str| vp.and_then(|m| m.get(key));
    let coords_map = raw.get("coords").and_then(Value::as_object);
    let coord = |key: &str| {
        coords_map
            .and_then(|m| m.get(key))
            .filter(|v| !v.is_null())
            .map(|v| coerce_i64(v, 0))
    };

    let present_int = |key: &str| raw.get(key).map(|v| coerce_i64(v, 0));

    let mut timestamp_ms = now_ms;
    for key in ["ts", "timestamp"] {
        if let Some(value) = raw.get(key) {
            if let Some(parsed) = try_f64(value) {
                timestamp_ms = parsed as i64;
                break;
            }
        }
    }

    let event = CanonicalEvent {
        site,
        event_type,
        path: first_string(raw, &["path", "url"]).unwrap_or_else(|| route.clone()),
        route,
        route_norm,
        element: str_field(raw, "element"),
        element_text: str_field(raw, "element_text"),
        el_hash: str_field(raw, "el_hash"),
        section: str_field(raw, "section"),
        depth: raw.get("depth").map_or(0, |v| coerce_i64(v, 0)),
        sec: raw.get("sec").map_or(0, |v| coerce_i64(v, 0)),
        vp_w: vp_field("w").map_or(0, |v| coerce_i64(v, 0)),
        vp_h: vp_field("h").map_or(0, |v| coerce_i64(v, 0)),
        vp_dpr: vp_field("dpr").map_or(0.0, |v| coerce_f64(v, 0.0)),
        coords: Coords {
            x: coord("x"),
            y: coord("y"),
            page_x: coord("pageX"),
            page_y: coord("pageY"),
        },
        // Unparseable bins coerce to -1 so they read as present-but-invalid
        // and never gate a click aggregate on a fabricated cell.
        x_bin: raw.get("x_bin").filter(|v| !v.is_null()).map(|v| coerce_i64(v, -1)),
        y_bin: raw.get("y_bin").filter(|v| !v.is_null()).map(|v| coerce_i64(v, -1)),
        doc_x: raw.get("doc_x").map_or(DOC_ABSENT, |v| coerce_f64(v, DOC_ABSENT)),
        doc_y: raw.get("doc_y").map_or(DOC_ABSENT, |v| coerce_f64(v, DOC_ABSENT)),
        doc_w: raw.get("doc_w").map_or(0, |v| coerce_i64(v, 0)),
        doc_h: raw.get("doc_h").map_or(0, |v| coerce_i64(v, 0)),
        scroll_top: present_int("scroll_top"),
        scroll_height: present_int("scroll_height"),
        viewport_height: present_int("viewport_height"),
        snapshot_hash: non_empty(str_field(raw, "snapshot_hash"), "default"),
        vp_bucket: str_field(raw, "vp_bucket"),
        grid_id: non_empty(str_field(raw, "grid_id"), "default"),
        event_id: opt_string(raw, "event_id"),
        uid: opt_string(raw, "uid"),
        sid: opt_string(raw, "sid"),
        source: raw.get("source").cloned(),
        trigger: raw.get("trigger").cloned(),
        client_ip: client_ip.to_string(),
        timestamp_ms,
    };

    EventOutcome::Record(Box::new(event))
}

impl CanonicalEvent {
    /// Produce the line-protocol statements for this event: the generic
    /// statement always, plus the click-aggregate statement when the event
    /// is a click with both bins present and non-negative.
    pub fn lines(&self) -> Vec<Line> {
        let mut out = vec![self.generic_line()];
        if self.event_type == "click" {
            if let Some(click) = self.click_line() {
                out.push(click);
            }
        }
        out
    }

    fn generic_line(&self) -> Line {
        let mut line = Line::new(MEASUREMENT, self.timestamp_ms)
            .tag("site", &self.site)
            .tag("t", &self.event_type)
            .tag("route", &self.route)
            .int_field("count", 1)
            .int_field("depth", self.depth)
            .int_field("sec", self.sec)
            .int_field("vp_w", self.vp_w)
            .int_field("vp_h", self.vp_h)
            .float_field("vp_dpr", self.vp_dpr, 3)
            .text_field("path", &self.path);
        if !self.element.is_empty() {
            line = line.text_field("element", &self.element);
        }
        if self.coords.any_present() {
            line = line
                .int_field("cx", self.coords.x.unwrap_or(0))
                .int_field("cy", self.coords.y.unwrap_or(0));
            if let Some(px) = self.coords.page_x {
                line = line.int_field("px", px);
            }
            if let Some(py) = self.coords.page_y {
                line = line.int_field("py", py);
            }
        }
        line = self.doc_geometry_fields(line);
        line = line
            .text_field("snapshot", &self.snapshot_hash)
            .text_field("grid", &self.grid_id);
        if !self.vp_bucket.is_empty() {
            line = line.text_field("vp_bucket", &self.vp_bucket);
        }
        if !self.el_hash.is_empty() {
            line = line.text_field("el_hash", &self.el_hash);
        }
        line.text_field("payload", &self.debug_payload().to_string())
    }

    fn click_line(&self) -> Option<Line> {
        let x_bin = self.x_bin.unwrap_or(-1);
        let y_bin = self.y_bin.unwrap_or(-1);
        if x_bin < 0 || y_bin < 0 {
            return None;
        }
        let section = if self.section.is_empty() {
            "unspecified"
        } else {
            self.section.as_str()
        };
        let mut line = Line::new(CLICK_MEASUREMENT, self.timestamp_ms)
            .tag("site", &self.site)
            .tag("route", &self.route)
            .tag("route_norm", &self.route_norm)
            .tag("section", section)
            .tag("snapshot", &self.snapshot_hash)
            .tag("grid", &self.grid_id)
            .tag("vp", &self.vp_bucket)
            .tag("el", &self.el_hash)
            .int_field("count", 1)
            .int_field("x_bin", x_bin)
            .int_field("y_bin", y_bin);
        line = self.doc_geometry_fields(line);
        if let Some(px) = self.coords.page_x {
            line = line.int_field("px", px);
        }
        if let Some(py) = self.coords.page_y {
            line = line.int_field("py", py);
        }
        Some(line)
    }

    fn doc_geometry_fields(&self, mut line: Line) -> Line {
        if self.doc_x >= 0.0 {
            line = line.float_field("doc_x", self.doc_x, 6);
        }
        if self.doc_y >= 0.0 {
            line = line.float_field("doc_y", self.doc_y, 6);
        }
        if self.doc_w > 0 {
            line = line.int_field("doc_w", self.doc_w);
        }
        if self.doc_h > 0 {
            line = line.int_field("doc_h", self.doc_h);
        }
        line
    }

    /// A compact JSON mirror of the record, embedded as the `payload` field
    /// for after-the-fact debugging. Presence-driven like the line fields.
    pub fn debug_payload(&self) -> Value {
        let mut map = Map::new();
        map.insert("site".into(), Value::from(self.site.clone()));
        map.insert("type".into(), Value::from(self.event_type.clone()));
        map.insert("route".into(), Value::from(self.route.clone()));
        map.insert("route_norm".into(), Value::from(self.route_norm.clone()));
        map.insert("path".into(), Value::from(self.path.clone()));
        map.insert("source".into(), self.source.clone().unwrap_or(Value::Null));
        map.insert("trigger".into(), self.trigger.clone().unwrap_or(Value::Null));
        map.insert("depth".into(), Value::from(self.depth));
        map.insert("sec".into(), Value::from(self.sec));
        map.insert("ts".into(), Value::from(self.timestamp_ms));
        map.insert("snapshot_hash".into(), Value::from(self.snapshot_hash.clone()));
        map.insert("grid_id".into(), Value::from(self.grid_id.clone()));
        map.insert("vp_bucket".into(), Value::from(self.vp_bucket.clone()));
        if !self.client_ip.is_empty() {
            map.insert("ip".into(), Value::from(self.client_ip.clone()));
        }
        if !self.element.is_empty() {
            map.insert("element".into(), Value::from(self.element.clone()));
        }
        if !self.element_text.is_empty() {
            map.insert("element_text".into(), Value::from(self.element_text.clone()));
        }
        if !self.el_hash.is_empty() {
            map.insert("el_hash".into(), Value::from(self.el_hash.clone()));
        }
        let mut coords = Map::new();
        if let Some(x) = self.coords.x {
            coords.insert("x".into(), Value::from(x));
        }
        if let Some(y) = self.coords.y {
            coords.insert("y".into(), Value::from(y));
        }
        if let Some(px) = self.coords.page_x {
            coords.insert("pageX".into(), Value::from(px));
        }
        if let Some(py) = self.coords.page_y {
            coords.insert("pageY".into(), Value::from(py));
        }
        if !coords.is_empty() {
            map.insert("coords".into(), Value::Object(coords));
        }
        if !self.section.is_empty() {
            map.insert("section".into(), Value::from(self.section.clone()));
        }
        if let Some(x_bin) = self.x_bin {
            map.insert("x_bin".into(), Value::from(x_bin));
        }
        if let Some(y_bin) = self.y_bin {
            map.insert("y_bin".into(), Value::from(y_bin));
        }
        if self.doc_x >= 0.0 {
            map.insert("doc_x".into(), Value::from(self.doc_x));
        }
        if self.doc_y >= 0.0 {
            map.insert("doc_y".into(), Value::from(self.doc_y));
        }
        if self.doc_w > 0 {
            map.insert("doc_w".into(), Value::from(self.doc_w));
        }
        if self.doc_h > 0 {
            map.insert("doc_h".into(), Value::from(self.doc_h));
        }
        if let Some(v) = self.scroll_top {
            map.insert("scroll_top".into(), Value::from(v));
        }
        if let Some(v) = self.scroll_height {
            map.insert("scroll_height".into(), Value::from(v));
        }
        if let Some(v) = self.viewport_height {
            map.insert("viewport_height".into(), Value::from(v));
        }
        if let Some(ref id) = self.event_id {
            map.insert("event_id".into(), Value::from(id.clone()));
        }
        if let Some(ref uid) = self.uid {
            map.insert("uid".into(), Value::from(uid.clone()));
        }
        if let Some(ref sid) = self.sid {
            map.insert("sid".into(), Value::from(sid.clone()));
        }
        if self.vp_w != 0 || self.vp_h != 0 || self.vp_dpr != 0.0 {
            map.insert(
                "vp".into(),
                serde_json::json!({ "w": self.vp_w, "h": self.vp_h, "dpr": self.vp_dpr }),
            );
        }
        Value::Object(map)
    }
}

fn non_empty(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn opt_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .map(string_like)
        .find(|s| !s.is_empty())
}
