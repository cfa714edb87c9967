//! Flat-box wireframe renderer.
//!
//! A skeleton snapshot is a list of normalized boxes, each positioned as a
//! fraction of the recorded viewport. Rendering sorts boxes by descending
//! area so small elements paint on top of the containers that enclose them.

use serde::Deserialize;

use crate::escape_html;

/// Upper bound on retained boxes per snapshot.
pub const MAX_BOXES: usize = 240;

/// Label text is clipped to this many characters before escaping.
const MAX_LABEL_LEN: usize = 48;

const DEFAULT_VIEWPORT: Viewport = Viewport { w: 1440, h: 900 };

/// Recorded viewport dimensions for the snapshot stage.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct Viewport {
    #[serde(default)]
    pub w: i64,
    #[serde(default)]
    pub h: i64,
}

/// Visual classification of a box. Unknown kinds fall back to `Panel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum BoxKind {
    Heading,
    Media,
    Button,
    Input,
    Nav,
    Header,
    Footer,
    List,
    Table,
    Text,
    Card,
    Section,
    Aside,
    Form,
    Main,
    #[default]
    Panel,
}

impl From<String> for BoxKind {
    fn from(token: String) -> Self {
        match token.trim().to_lowercase().as_str() {
            "heading" => BoxKind::Heading,
            "media" => BoxKind::Media,
            "button" => BoxKind::Button,
            "input" => BoxKind::Input,
            "nav" => BoxKind::Nav,
            "header" => BoxKind::Header,
            "footer" => BoxKind::Footer,
            "list" => BoxKind::List,
            "table" => BoxKind::Table,
            "text" => BoxKind::Text,
            "card" => BoxKind::Card,
            "section" => BoxKind::Section,
            "aside" => BoxKind::Aside,
            "form" => BoxKind::Form,
            "main" => BoxKind::Main,
            _ => BoxKind::Panel,
        }
    }
}

impl BoxKind {
    fn css(self) -> &'static str {
        match self {
            BoxKind::Heading => "background:rgba(239,68,68,0.14);border:1px solid rgba(239,68,68,0.45);",
            BoxKind::Media => "background:rgba(59,130,246,0.16);border:1px dashed rgba(37,99,235,0.5);",
            BoxKind::Button => "background:rgba(34,197,94,0.2);border:1px solid rgba(34,197,94,0.5);border-radius:8px;",
            BoxKind::Input => "background:rgba(148,163,184,0.1);border:1px solid rgba(148,163,184,0.55);border-radius:6px;",
            BoxKind::Nav | BoxKind::Header => "background:rgba(99,102,241,0.14);border:1px solid rgba(99,102,241,0.4);",
            BoxKind::Footer => "background:rgba(148,163,184,0.1);border:1px solid rgba(148,163,184,0.3);",
            BoxKind::List | BoxKind::Table => "background:rgba(148,163,184,0.08);border:1px solid rgba(148,163,184,0.35);",
            BoxKind::Text => "background:rgba(148,163,184,0.3);border:none;border-radius:999px;",
            BoxKind::Form | BoxKind::Aside => "background:rgba(148,163,184,0.1);border:1px dashed rgba(148,163,184,0.4);",
            BoxKind::Card | BoxKind::Section | BoxKind::Main | BoxKind::Panel => {
                "background:rgba(148,163,184,0.12);border:1px solid rgba(148,163,184,0.28);border-radius:10px;"
            }
        }
    }

    fn name(self) -> &'static str {
        match self {
            BoxKind::Heading => "heading",
            BoxKind::Media => "media",
            BoxKind::Button => "button",
            BoxKind::Input => "input",
            BoxKind::Nav => "nav",
            BoxKind::Header => "header",
            BoxKind::Footer => "footer",
            BoxKind::List => "list",
            BoxKind::Table => "table",
            BoxKind::Text => "text",
            BoxKind::Card => "card",
            BoxKind::Section => "section",
            BoxKind::Aside => "aside",
            BoxKind::Form => "form",
            BoxKind::Main => "main",
            BoxKind::Panel => "panel",
        }
    }
}

/// One normalized box: `x`, `y`, `w`, `h` are fractions of the viewport.
#[derive(Debug, Clone, Deserialize)]
pub struct SkeletonBox {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub w: f64,
    #[serde(default)]
    pub h: f64,
    #[serde(default)]
    pub kind: BoxKind,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub label: String,
}

impl SkeletonBox {
    fn clamped(&self) -> SkeletonBox {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        SkeletonBox {
            x: clamp(self.x),
            y: clamp(self.y),
            w: clamp(self.w),
            h: clamp(self.h),
            kind: self.kind,
            tag: self.tag.clone(),
            label: self.label.clone(),
        }
    }

    fn area(&self) -> f64 {
        self.w * self.h
    }
}

/// Drop degenerate boxes, clamp coordinates, sort by descending area, and
/// keep at most [`MAX_BOXES`].
pub fn prepare_boxes(boxes: &[SkeletonBox]) -> Vec<SkeletonBox> {
    let mut kept: Vec<SkeletonBox> = boxes
        .iter()
        .map(SkeletonBox::clamped)
        .filter(|b| b.w > 0.0 && b.h > 0.0)
        .collect();
    kept.sort_by(|a, b| {
        b.area()
            .partial_cmp(&a.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    kept.truncate(MAX_BOXES);
    kept
}

/// Render a flat-box snapshot into a self-contained HTML document.
pub fn render_boxes(boxes: &[SkeletonBox], viewport: Option<Viewport>, label: &str) -> String {
    let viewport = match viewport {
        Some(vp) if vp.w > 0 && vp.h > 0 => vp,
        _ => DEFAULT_VIEWPORT,
    };
    let kept = prepare_boxes(boxes);

    let mut body = String::new();
    if !label.is_empty() {
        let clipped: String = label.chars().take(MAX_LABEL_LEN).collect();
        body.push_str(&format!(
            "<div style=\"position:absolute;top:8px;left:12px;z-index:999;font-size:0.7rem;\
letter-spacing:0.08em;text-transform:uppercase;color:rgba(148,163,184,0.8);\">{}</div>",
            escape_html(&clipped)
        ));
    }
    for sk_box in &kept {
        let clipped: String = sk_box.label.chars().take(MAX_LABEL_LEN).collect();
        let label_html = if clipped.is_empty() {
            String::new()
        } else {
            format!(
                "<span style=\"position:absolute;top:2px;right:6px;font-size:0.6rem;\
text-transform:uppercase;letter-spacing:0.1em;color:rgba(148,163,184,0.7);\
overflow:hidden;white-space:nowrap;max-width:90%;\">{}</span>",
                escape_html(&clipped)
            )
        };
        body.push_str(&format!(
            "<div data-kind=\"{}\" data-tag=\"{}\" style=\"position:absolute;\
left:{:.3}%;top:{:.3}%;width:{:.3}%;height:{:.3}%;{}overflow:hidden;\">{}</div>",
            sk_box.kind.name(),
            escape_html(&sk_box.tag),
            sk_box.x * 100.0,
            sk_box.y * 100.0,
            sk_box.w * 100.0,
            sk_box.h * 100.0,
            sk_box.kind.css(),
            label_html
        ));
    }

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>\
<body style=\"margin:0;background:radial-gradient(circle at top,#1f2937 2%,#0b1120 68%);\">\
<div data-stage=\"skeleton\" style=\"position:relative;width:{w}px;height:{h}px;\
margin:0 auto;overflow:hidden;font-family:system-ui,sans-serif;\">{body}</div>\
</body></html>",
        w = viewport.w,
        h = viewport.h,
    )
}
