//! 2-D click-density aggregation.
//!
//! Input rows come from the time-series store as string→string maps with
//! `x_bin`, `y_bin`, and a count column. Accumulation is additive and
//! order-independent: the resulting grid depends only on the multiset of
//! rows fed in.

use std::collections::HashMap;

use serde::Serialize;

/// Grid dimensions parsed from a `"ColsxRows"` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSpec {
    pub cols: usize,
    pub rows: usize,
}

impl GridSpec {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }

    /// Parse a grid token such as `"12x8"`. Tolerates surrounding spaces
    /// and `*` as the separator; anything unparseable falls back to the
    /// supplied defaults.
    pub fn parse(token: Option<&str>, defaults: GridSpec) -> Self {
        let Some(token) = token else {
            return defaults;
        };
        let cleaned = token.to_lowercase().replace(' ', "").replace('*', "x");
        let mut parts = cleaned.split('x');
        let (Some(cols), Some(rows), None) = (parts.next(), parts.next(), parts.next()) else {
            return defaults;
        };
        match (cols.parse::<usize>(), rows.parse::<usize>()) {
            (Ok(c), Ok(r)) => GridSpec::new(c, r),
            _ => defaults,
        }
    }

    /// Canonical token form, e.g. `"12x8"`.
    pub fn id(&self) -> String {
        format!("{}x{}", self.cols, self.rows)
    }
}

/// One cell of the sparse flat representation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Cell {
    pub x: usize,
    pub y: usize,
    pub count: u64,
    pub alpha: f64,
}

/// A dense count grid with its derived maximum and total.
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapGrid {
    pub cols: usize,
    pub rows: usize,
    pub raw: Vec<Vec<u64>>,
    pub max_count: u64,
    pub total_count: u64,
}

impl HeatmapGrid {
    pub fn empty(spec: GridSpec) -> Self {
        Self {
            cols: spec.cols,
            rows: spec.rows,
            raw: vec![vec![0; spec.cols]; spec.rows],
            max_count: 0,
            total_count: 0,
        }
    }

    /// Accumulate tabular rows into a grid. Rows with unparseable bins or
    /// counts, or bins outside `[0,cols) × [0,rows)`, are dropped silently.
    /// The count column falls back to the store's `_value` column.
    pub fn accumulate<'a, I>(spec: GridSpec, entries: I) -> Self
    where
        I: IntoIterator<Item = &'a HashMap<String, String>>,
    {
        let mut grid = Self::empty(spec);
        for entry in entries {
            let Some(x) = parse_index(entry.get("x_bin")) else {
                continue;
            };
            let Some(y) = parse_index(entry.get("y_bin")) else {
                continue;
            };
            let count_col = entry.get("count").or_else(|| entry.get("_value"));
            let Some(count) = parse_count(count_col) else {
                continue;
            };
            if x >= grid.cols || y >= grid.rows {
                continue;
            }
            grid.raw[y][x] += count;
            grid.total_count += count;
            if grid.raw[y][x] > grid.max_count {
                grid.max_count = grid.raw[y][x];
            }
        }
        grid
    }

    /// Each cell divided by the maximum, or an all-zero grid of the same
    /// shape when the maximum is zero.
    pub fn normalized(&self) -> Vec<Vec<f64>> {
        if self.max_count == 0 {
            return vec![vec![0.0; self.cols]; self.rows];
        }
        let max = self.max_count as f64;
        self.raw
            .iter()
            .map(|row| row.iter().map(|&c| c as f64 / max).collect())
            .collect()
    }

    /// Flat `{x, y, count, alpha}` list for renderers that prefer a sparse
    /// representation. Alpha is rounded to 4 decimals.
    pub fn cells(&self) -> Vec<Cell> {
        let max = self.max_count as f64;
        let mut out = Vec::with_capacity(self.cols * self.rows);
        for y in 0..self.rows {
            for x in 0..self.cols {
                let count = self.raw[y][x];
                let alpha = if self.max_count == 0 {
                    0.0
                } else {
                    ((count as f64 / max) * 10_000.0).round() / 10_000.0
                };
                out.push(Cell { x, y, count, alpha });
            }
        }
        out
    }
}

fn parse_index(value: Option<&String>) -> Option<usize> {
    let parsed = value?.trim().parse::<f64>().ok()?;
    let idx = parsed as i64;
    if idx < 0 {
        return None;
    }
    Some(idx as usize)
}

fn parse_count(value: Option<&String>) -> Option<u64> {
    let parsed = value?.trim().parse::<f64>().ok()?;
    if parsed < 0.0 {
        return None;
    }
    Some(parsed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(x: &str, y: &str, count: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("x_bin".to_string(), x.to_string());
        map.insert("y_bin".to_string(), y.to_string());
        map.insert("count".to_string(), count.to_string());
        map
    }

    #[test]
    fn parses_grid_tokens() {
        let defaults = GridSpec::new(12, 8);
        assert_eq!(GridSpec::parse(Some("4x4"), defaults), GridSpec::new(4, 4));
        assert_eq!(GridSpec::parse(Some("16 x 9"), defaults), GridSpec::new(16, 9));
        assert_eq!(GridSpec::parse(Some("3*5"), defaults), GridSpec::new(3, 5));
        assert_eq!(GridSpec::parse(Some("junk"), defaults), defaults);
        assert_eq!(GridSpec::parse(Some("1x2x3"), defaults), defaults);
        assert_eq!(GridSpec::parse(None, defaults), defaults);
        assert_eq!(GridSpec::parse(Some("0x0"), defaults), GridSpec::new(1, 1));
        assert_eq!(GridSpec::new(12, 8).id(), "12x8");
    }

    #[test]
    fn accumulates_same_cell_additively() {
        let rows = vec![row("2", "1", "5"), row("2", "1", "3")];
        let grid = HeatmapGrid::accumulate(GridSpec::new(4, 4), &rows);
        assert_eq!(grid.raw[1][2], 8);
        assert_eq!(grid.max_count, 8);
        assert_eq!(grid.total_count, 8);
        let norm = grid.normalized();
        assert_eq!(norm[1][2], 1.0);
        let others: f64 = norm
            .iter()
            .flatten()
            .copied()
            .sum::<f64>();
        assert_eq!(others, 1.0);
    }

    #[test]
    fn drops_malformed_and_out_of_range_rows() {
        let rows = vec![
            row("nope", "1", "5"),
            row("2", "99", "5"),
            row("-1", "0", "5"),
            row("1", "1", "abc"),
            row("1", "1", "2"),
        ];
        let grid = HeatmapGrid::accumulate(GridSpec::new(4, 4), &rows);
        assert_eq!(grid.total_count, 2);
        assert_eq!(grid.raw[1][1], 2);
    }

    #[test]
    fn empty_input_yields_zero_grid_without_division_error() {
        let grid = HeatmapGrid::accumulate(GridSpec::new(3, 2), &[]);
        assert_eq!(grid.max_count, 0);
        assert_eq!(grid.normalized(), vec![vec![0.0; 3]; 2]);
        assert!(grid.cells().iter().all(|c| c.count == 0 && c.alpha == 0.0));
        assert_eq!(grid.cells().len(), 6);
    }

    #[test]
    fn order_independent() {
        let mut rows = vec![
            row("0", "0", "1"),
            row("3", "1", "4"),
            row("2", "2", "2"),
            row("3", "1", "1"),
        ];
        let forward = HeatmapGrid::accumulate(GridSpec::new(4, 4), &rows);
        rows.reverse();
        let backward = HeatmapGrid::accumulate(GridSpec::new(4, 4), &rows);
        assert_eq!(forward.raw, backward.raw);
        assert_eq!(forward.max_count, backward.max_count);
        assert_eq!(forward.total_count, backward.total_count);
    }

    #[test]
    fn normalized_mass_matches_raw_mass() {
        let rows = vec![row("0", "0", "3"), row("1", "0", "6"), row("2", "1", "9")];
        let grid = HeatmapGrid::accumulate(GridSpec::new(3, 2), &rows);
        let normalized_sum: f64 = grid.normalized().iter().flatten().sum();
        let raw_sum: u64 = grid.raw.iter().flatten().sum();
        assert!((normalized_sum * grid.max_count as f64 - raw_sum as f64).abs() < 1e-9);
    }

    #[test]
    fn float_bins_truncate() {
        let rows = vec![row("2.9", "1.1", "5.8")];
        let grid = HeatmapGrid::accumulate(GridSpec::new(4, 4), &rows);
        assert_eq!(grid.raw[1][2], 5);
    }
}
