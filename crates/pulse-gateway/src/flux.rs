//! Flux query builders for the analytics endpoints. All user-supplied
//! strings pass through [`escape`] before interpolation.

use pulse_core::{CLICK_MEASUREMENT, MEASUREMENT};

pub fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `true` for aggregate-window tokens of the form `<digits><s|m|h|d>`.
pub fn valid_window(token: &str) -> bool {
    let Some(unit) = token.chars().last() else {
        return false;
    };
    if !matches!(unit, 's' | 'm' | 'h' | 'd') {
        return false;
    }
    let digits = &token[..token.len() - 1];
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn site_filter(site: Option<&str>) -> String {
    match site {
        Some(site) if !site.is_empty() => {
            format!("  |> filter(fn: (r) => r[\"site\"] == \"{}\")\n", escape(site))
        }
        _ => String::new(),
    }
}

/// Total event count over the window.
pub fn summary(bucket: &str, hours: u32, site: Option<&str>) -> String {
    format!(
        "from(bucket: \"{bucket}\")\n\
         \x20 |> range(start: -{hours}h)\n\
         \x20 |> filter(fn: (r) => r._measurement == \"{MEASUREMENT}\" and r._field == \"count\")\n\
         {site}\
         \x20 |> group(columns: [])\n\
         \x20 |> sum()\n",
        bucket = escape(bucket),
        site = site_filter(site),
    )
}

/// Per-route pageview totals, highest first.
pub fn top_routes(bucket: &str, hours: u32, limit: u32, site: Option<&str>) -> String {
    format!(
        "from(bucket: \"{bucket}\")\n\
         \x20 |> range(start: -{hours}h)\n\
         \x20 |> filter(fn: (r) => r._measurement == \"{MEASUREMENT}\" and r._field == \"count\")\n\
         \x20 |> filter(fn: (r) => exists r.t and r.t == \"page\")\n\
         {site}\
         \x20 |> group(columns: [\"route\"])\n\
         \x20 |> sum(column: \"_value\")\n\
         \x20 |> sort(columns: [\"_value\"], desc: true)\n\
         \x20 |> limit(n: {limit})\n",
        bucket = escape(bucket),
        site = site_filter(site),
    )
}

/// Event counts bucketed into `window`-sized intervals.
pub fn series(bucket: &str, hours: u32, window: &str, site: Option<&str>) -> String {
    format!(
        "from(bucket: \"{bucket}\")\n\
         \x20 |> range(start: -{hours}h)\n\
         \x20 |> filter(fn: (r) => r._measurement == \"{MEASUREMENT}\" and r._field == \"count\")\n\
         {site}\
         \x20 |> aggregateWindow(every: {window}, fn: sum, createEmpty: false)\n\
         \x20 |> group(columns: [])\n",
        bucket = escape(bucket),
        site = site_filter(site),
    )
}

/// Facet filters for the click-heatmap query. `None` widens that facet.
#[derive(Debug, Clone, Default)]
pub struct HeatmapFilter {
    pub site: Option<String>,
    pub route_norm: Option<String>,
    pub snapshot: Option<String>,
    pub grid: Option<String>,
    pub vp: Option<String>,
    pub section: Option<String>,
}

/// Click aggregates pivoted to (x_bin, y_bin, count) rows.
pub fn click_heatmap(bucket: &str, hours: u32, filter: &HeatmapFilter) -> String {
    let mut filters = vec![format!(
        "  |> filter(fn: (r) => r[\"_measurement\"] == \"{CLICK_MEASUREMENT}\")"
    )];
    let tags = [
        ("site", filter.site.as_deref()),
        ("route_norm", filter.route_norm.as_deref()),
        ("snapshot", filter.snapshot.as_deref()),
        ("grid", filter.grid.as_deref()),
        ("vp", filter.vp.as_deref()),
        ("section", filter.section.as_deref()),
    ];
    for (tag, value) in tags {
        if let Some(value) = value {
            if !value.is_empty() {
                filters.push(format!(
                    "  |> filter(fn: (r) => r[\"{tag}\"] == \"{}\")",
                    escape(value)
                ));
            }
        }
    }
    format!(
        "from(bucket: \"{bucket}\")\n\
         \x20 |> range(start: -{hours}h)\n\
         {filters}\n\
         \x20 |> pivot(rowKey: [\"_time\", \"site\", \"route\", \"route_norm\", \"section\", \"snapshot\", \"grid\", \"vp\"], columnKey: [\"_field\"], valueColumn: \"_value\")\n\
         \x20 |> keep(columns: [\"_time\", \"site\", \"route\", \"route_norm\", \"section\", \"snapshot\", \"grid\", \"vp\", \"count\", \"x_bin\", \"y_bin\"])\n\
         \x20 |> group(columns: [\"x_bin\", \"y_bin\"])\n\
         \x20 |> sum(column: \"count\")\n",
        bucket = escape(bucket),
        filters = filters.join("\n"),
    )
}
