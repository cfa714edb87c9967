//! Line-protocol statement builder.
//!
//! The encoded shape is `measurement,tag=v,... field=v,... timestamp_ms`
//! and must stay byte-compatible with the store's line ingestion format.

use crate::coerce::format_float;

/// Escape a tag value: backslash first (so the other escapes are not
/// double-escaped), then comma, space, and equals.
pub fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

/// Escape a text field value: backslash first, then double quote.
pub fn escape_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Typed field value. Integers carry the `i` suffix on the wire; floats are
/// rendered at a per-field precision with trailing zeros stripped (dpr uses
/// 3 decimals, document coordinates 6).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float { value: f64, precision: usize },
    Text(String),
}

impl FieldValue {
    fn encode(&self) -> String {
        match self {
            FieldValue::Integer(v) => format!("{v}i"),
            FieldValue::Float { value, precision } => format_float(*value, *precision),
            FieldValue::Text(v) => format!("\"{}\"", escape_field(v)),
        }
    }
}

/// A single line-protocol statement under construction.
#[derive(Debug, Clone)]
pub struct Line {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp_ms: i64,
}

impl Line {
    pub fn new(measurement: &str, timestamp_ms: i64) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp_ms,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Append a tag. Empty values are skipped: tags are presence-driven and
    /// an absent dimension is simply not written.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        if !value.is_empty() {
            self.tags.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn field(mut self, key: &str, value: FieldValue) -> Self {
        self.fields.push((key.to_string(), value));
        self
    }

    pub fn int_field(self, key: &str, value: i64) -> Self {
        self.field(key, FieldValue::Integer(value))
    }

    pub fn text_field(self, key: &str, value: &str) -> Self {
        self.field(key, FieldValue::Text(value.to_string()))
    }

    pub fn float_field(self, key: &str, value: f64, precision: usize) -> Self {
        self.field(key, FieldValue::Float { value, precision })
    }

    pub fn encode(&self) -> String {
        let mut head = escape_tag(&self.measurement);
        for (k, v) in &self.tags {
            head.push(',');
            head.push_str(k);
            head.push('=');
            head.push_str(&escape_tag(v));
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={}", v.encode()))
            .collect();
        format!("{head} {} {}", fields.join(","), self.timestamp_ms)
    }
}
