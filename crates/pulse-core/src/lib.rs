pub mod coerce;
pub mod event;
pub mod line;
pub mod route;

pub use event::{normalize_event, CanonicalEvent, EventOutcome};
pub use line::{FieldValue, Line};
pub use route::normalize_route;

/// Measurement name for generic interaction events.
pub const MEASUREMENT: &str = "pulse";

/// Measurement name for the click-aggregate statement.
pub const CLICK_MEASUREMENT: &str = "pulse_click";

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}
