//! Parser for the store's annotated-CSV query responses.
//!
//! Annotation rows start with `#`. The header is the first row whose
//! leading columns are `result,table`; if none appears, the first
//! non-annotation row is taken as the header. Data rows whose column
//! count differs from the header are dropped.

use std::collections::HashMap;

pub fn parse_rows(text: &str) -> Vec<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut header: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for record in reader.records().flatten() {
        let first = record.get(0).unwrap_or("");
        if record.len() == 1 && first.is_empty() {
            // blank separator between result tables
            continue;
        }
        if first.starts_with('#') {
            continue;
        }
        if first == "result" && record.get(1) == Some("table") {
            header = record.iter().map(str::to_string).collect();
            continue;
        }
        if header.is_empty() {
            header = record.iter().map(str::to_string).collect();
            continue;
        }
        if record.len() != header.len() {
            continue;
        }
        rows.push(
            header
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect(),
        );
    }
    rows
}
