//! Serialized-DOM tree walker (secondary input adapter).
//!
//! Walks a snapshot of typed nodes and emits structural markup only:
//! placeholders for embedded media, chips for inline elements, bars for
//! text runs. Literal page text never reaches the output — only structure
//! and approximate length — so cached skeletons cannot leak content.

use serde_json::Value;

use crate::escape_html;

/// Node budget for a single render. Past this point remaining content is
/// replaced by a single truncation placeholder.
pub const MAX_NODES: usize = 4000;

const NODE_DOCUMENT: i64 = 0;
const NODE_DOCTYPE: i64 = 1;
const NODE_ELEMENT: i64 = 2;
const NODE_TEXT: i64 = 3;

const PLACEHOLDER_TAGS: &[&str] = &["img", "iframe", "svg", "picture", "video", "audio", "canvas"];
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "meta", "link"];
const INLINE_TAGS: &[&str] = &[
    "a", "b", "code", "em", "i", "label", "small", "span", "strong", "sub", "sup",
];
const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];
const LABEL_ATTRS: &[&str] = &["data-section", "aria-label", "title", "alt"];

const STYLE: &str = "\
.wf-block{position:relative;background:rgba(148,163,184,0.12);border:1px solid rgba(148,163,184,0.28);\
border-radius:14px;padding:18px;min-height:28px;overflow:hidden;}\
.wf-inline{display:inline-flex;align-items:center;justify-content:center;padding:6px 10px;min-width:24px;\
min-height:18px;margin:4px 6px 0 0;background:rgba(148,163,184,0.18);border:1px solid rgba(148,163,184,0.35);\
border-radius:10px;}\
.wf-heading{border-color:rgba(239,68,68,0.45);background:rgba(239,68,68,0.12);}\
.wf-placeholder{display:flex;align-items:center;justify-content:center;background:rgba(59,130,246,0.15);\
border:1px dashed rgba(37,99,235,0.45);border-radius:16px;padding:18px;min-height:64px;\
text-transform:uppercase;letter-spacing:0.08em;font-size:0.68rem;color:rgba(148,163,184,0.9);}\
.wf-text{display:inline-block;height:10px;min-width:36px;border-radius:999px;\
background:rgba(148,163,184,0.35);margin:4px 8px 4px 0;}\
.wf-label{position:absolute;top:8px;right:12px;font-size:0.65rem;letter-spacing:0.12em;\
text-transform:uppercase;color:rgba(148,163,184,0.68);pointer-events:none;}";

/// Node-count accumulator threaded through the recursion. Once `used`
/// reaches `max`, rendering stops descending and siblings collapse into a
/// single truncation marker.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    used: usize,
    max: usize,
}

impl Budget {
    pub fn new(max: usize) -> Self {
        Self { used: 0, max }
    }

    fn exhausted(&self) -> bool {
        self.used >= self.max
    }

    fn charge(&mut self) {
        self.used += 1;
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// Render a serialized node tree into a self-contained HTML document.
/// The walk starts at the first `body` element found under `root`; a tree
/// without one renders an empty stage rather than failing.
pub fn render_tree(root: &Value, label: &str) -> String {
    let mut budget = Budget::new(MAX_NODES);
    let body_html = match find_element(root, "body") {
        Some(body) => render_children(children(body), &mut budget),
        None => String::new(),
    };

    let banner = if label.is_empty() {
        String::new()
    } else {
        let clipped: String = label.chars().take(48).collect();
        format!(
            "<div class=\"wf-inline\" style=\"align-self:flex-start;font-size:0.7rem;\">{}</div>",
            escape_html(&clipped)
        )
    };

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><style>{STYLE}\
body{{margin:0;padding:32px;background:radial-gradient(circle at top,#1f2937 2%,#0b1120 68%);\
color:#94a3b8;display:flex;flex-direction:column;gap:16px;font-family:system-ui,sans-serif;}}\
</style></head><body>{banner}{body_html}</body></html>"
    )
}

fn render_children(nodes: &[Value], budget: &mut Budget) -> String {
    let mut html = String::new();
    let mut truncated = false;
    for node in nodes {
        if budget.exhausted() {
            truncated = true;
            break;
        }
        html.push_str(&render_node(node, budget));
    }
    if truncated {
        html.push_str("<div class=\"wf-placeholder\">Snapshot truncated</div>");
    }
    html
}

fn render_node(node: &Value, budget: &mut Budget) -> String {
    match node.get("type").and_then(Value::as_i64) {
        Some(NODE_DOCUMENT) => render_children(children(node), budget),
        Some(NODE_DOCTYPE) => String::new(),
        Some(NODE_ELEMENT) => render_element(node, budget),
        Some(NODE_TEXT) => {
            let text = node
                .get("textContent")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            if text.is_empty() {
                return String::new();
            }
            budget.charge();
            let length = text.chars().count().min(60);
            format!("<span class=\"wf-text\" data-len=\"{length}\"></span>")
        }
        _ => String::new(),
    }
}

fn render_element(node: &Value, budget: &mut Budget) -> String {
    let tag = node
        .get("tagName")
        .and_then(Value::as_str)
        .unwrap_or("div")
        .to_lowercase();
    budget.charge();

    if SKIPPED_TAGS.contains(&tag.as_str()) {
        return String::new();
    }
    if PLACEHOLDER_TAGS.contains(&tag.as_str()) {
        let mut label = tag.to_uppercase();
        if let Some(attr) = first_label_attr(node) {
            let clipped: String = attr.chars().take(28).collect();
            label = format!("{label} · {clipped}");
        }
        return format!("<div class=\"wf-placeholder\">{}</div>", escape_html(&label));
    }

    let class = if INLINE_TAGS.contains(&tag.as_str()) {
        "wf-inline"
    } else if HEADING_TAGS.contains(&tag.as_str()) {
        "wf-block wf-heading"
    } else {
        "wf-block"
    };

    let label_html = match first_label_attr(node) {
        Some(attr) => {
            let clipped: String = attr.chars().take(48).collect();
            format!("<span class=\"wf-label\">{}</span>", escape_html(&clipped))
        }
        None => String::new(),
    };

    let inner = render_children(children(node), budget);
    format!(
        "<div class=\"{class}\" data-tag=\"{}\">{label_html}{inner}</div>",
        escape_html(&tag)
    )
}

fn children(node: &Value) -> &[Value] {
    node.get("childNodes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn first_label_attr(node: &Value) -> Option<&str> {
    let attrs = node.get("attributes")?.as_object()?;
    LABEL_ATTRS
        .iter()
        .find_map(|name| attrs.get(*name).and_then(Value::as_str))
}

fn find_element<'a>(node: &'a Value, tag: &str) -> Option<&'a Value> {
    let is_match = node.get("type").and_then(Value::as_i64) == Some(NODE_ELEMENT)
        && node
            .get("tagName")
            .and_then(Value::as_str)
            .is_some_and(|t| t.eq_ignore_ascii_case(tag));
    if is_match {
        return Some(node);
    }
    children(node).iter().find_map(|child| find_element(child, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(body_children: Value) -> Value {
        json!({
            "type": 0,
            "childNodes": [{
                "type": 2,
                "tagName": "html",
                "childNodes": [{
                    "type": 2,
                    "tagName": "body",
                    "childNodes": body_children,
                }],
            }],
        })
    }

    #[test]
    fn text_content_is_never_echoed() {
        let tree = doc(json!([
            { "type": 3, "textContent": "super secret account number 12345" }
        ]));
        let html = render_tree(&tree, "");
        assert!(!html.contains("secret"));
        assert!(!html.contains("12345"));
        assert!(html.contains("wf-text"));
    }

    #[test]
    fn media_renders_labeled_placeholder() {
        let tree = doc(json!([
            { "type": 2, "tagName": "img", "attributes": { "alt": "hero shot" } }
        ]));
        let html = render_tree(&tree, "");
        assert!(html.contains("wf-placeholder"));
        assert!(html.contains("IMG · hero shot"));
    }

    #[test]
    fn scripts_and_styles_are_dropped() {
        let tree = doc(json!([
            { "type": 2, "tagName": "script", "childNodes": [
                { "type": 3, "textContent": "alert(1)" }
            ]},
            { "type": 2, "tagName": "p", "childNodes": [] },
        ]));
        let html = render_tree(&tree, "");
        assert!(!html.contains("alert"));
        assert!(html.contains("data-tag=\"p\""));
    }

    #[test]
    fn headings_get_distinct_class() {
        let tree = doc(json!([{ "type": 2, "tagName": "H2", "childNodes": [] }]));
        let html = render_tree(&tree, "");
        assert!(html.contains("wf-heading"));
        assert!(html.contains("data-tag=\"h2\""));
    }

    #[test]
    fn inline_tags_render_as_chips() {
        let tree = doc(json!([{ "type": 2, "tagName": "span", "childNodes": [] }]));
        let html = render_tree(&tree, "");
        assert!(html.contains("wf-inline"));
    }

    #[test]
    fn budget_truncates_remaining_siblings() {
        let big: Vec<Value> = (0..(MAX_NODES + 50))
            .map(|_| json!({ "type": 2, "tagName": "div", "childNodes": [] }))
            .collect();
        let html = render_tree(&doc(Value::Array(big)), "");
        assert!(html.contains("Snapshot truncated"));
        // Exactly one truncation marker for the overflowing sibling run.
        assert_eq!(html.matches("Snapshot truncated").count(), 1);
    }

    #[test]
    fn labels_are_escaped() {
        let tree = doc(json!([
            { "type": 2, "tagName": "section",
              "attributes": { "aria-label": "<b>bold</b>" }, "childNodes": [] }
        ]));
        let html = render_tree(&tree, "");
        assert!(html.contains("&lt;b&gt;bold&lt;/b&gt;"));
    }

    #[test]
    fn missing_body_renders_empty_stage() {
        let html = render_tree(&json!({ "type": 0, "childNodes": [] }), "x");
        assert!(html.starts_with("<!DOCTYPE html>"));
    }
}
