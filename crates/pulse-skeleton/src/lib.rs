//! Low-fidelity wireframe rendering of serialized page layouts.
//!
//! Two input forms exist: a flat list of normalized boxes (primary, see
//! [`boxes`]) and a serialized DOM tree (secondary, see [`tree`]). Both
//! emit self-contained HTML with inline styling only, suitable for caching
//! as a static artifact and overlaying with a heatmap grid. No literal page
//! text is ever echoed into the output.

pub mod boxes;
pub mod tree;

pub use boxes::{render_boxes, BoxKind, SkeletonBox, Viewport, MAX_BOXES};
pub use tree::{render_tree, Budget, MAX_NODES};

/// Escape text for embedding into HTML attribute or body positions.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_metacharacters() {
        assert_eq!(
            escape_html(r#"<img src="x" onerror='y'> & more"#),
            "&lt;img src=&quot;x&quot; onerror=&#x27;y&#x27;&gt; &amp; more"
        );
    }
}
