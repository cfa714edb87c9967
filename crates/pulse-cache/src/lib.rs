//! Snapshot cache: rendered skeletons and captured page images, stored in
//! a nested directory layout keyed by (snapshot_hash, route segments,
//! vp_bucket, grid_id, section), each entry with a `meta.json` sidecar.
//!
//! Key components are sanitized independently so the composite path can
//! never escape the cache root. Metadata writes are full overwrites and
//! reads are tolerant: a missing or corrupt sidecar reads as absent.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Maximum length of one sanitized key segment.
const MAX_SEGMENT_LEN: usize = 80;

/// Sanitize a single cache-key component. ASCII alphanumerics, hyphen,
/// underscore, and dot pass through; path separators become `__`; anything
/// else becomes `_`. Leading/trailing underscores are trimmed, an empty or
/// all-dot result becomes `"default"` (so `.` and `..` can never appear as
/// path components), and the segment is capped at 80 characters.
pub fn safe_segment(value: &str) -> String {
    let text = value.trim();
    let text = if text.is_empty() { "default" } else { text };
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else if ch == '/' || ch == '\\' {
            out.push_str("__");
        } else {
            out.push('_');
        }
    }
    let cleaned = out.trim_matches('_');
    let cleaned = if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        "default"
    } else {
        cleaned
    };
    cleaned.chars().take(MAX_SEGMENT_LEN).collect()
}

/// Composite key for one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotKey {
    pub route_norm: String,
    pub snapshot_hash: String,
    pub vp_bucket: String,
    pub grid_id: String,
    pub section: String,
}

impl SnapshotKey {
    /// Sanitized directory components in storage order: snapshot hash,
    /// one directory per route segment (`root` for `/`), then viewport
    /// bucket, grid id, and section.
    pub fn dir_parts(&self) -> Vec<String> {
        let mut route_parts: Vec<String> = self
            .route_norm
            .split('/')
            .filter(|part| !part.is_empty())
            .map(safe_segment)
            .collect();
        if route_parts.is_empty() {
            route_parts.push("root".to_string());
        }
        let mut parts = vec![safe_segment(&self.snapshot_hash)];
        parts.extend(route_parts);
        parts.push(safe_segment(&self.vp_bucket));
        parts.push(safe_segment(&self.grid_id));
        parts.push(safe_segment(&self.section));
        parts
    }
}

/// Sidecar metadata for one cache entry. Written as a full overwrite; all
/// capture-side fields are optional so skeleton-only entries stay valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMeta {
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub route_norm: String,
    #[serde(default)]
    pub snapshot_hash: String,
    #[serde(default)]
    pub vp_bucket: String,
    #[serde(default)]
    pub grid_id: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub site: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boxes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Resolved view of one entry's media artifact for serving.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub rel_path: String,
    pub available: bool,
    pub etag: Option<String>,
    pub size_bytes: u64,
    pub meta: Option<SnapshotMeta>,
}

/// Filesystem-backed snapshot cache rooted at a single directory.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    root: PathBuf,
}

impl SnapshotCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &SnapshotKey) -> PathBuf {
        let mut dir = self.root.clone();
        for part in key.dir_parts() {
            dir.push(part);
        }
        dir
    }

    /// Path of the rendered-skeleton artifact for this key.
    pub fn html_path(&self, key: &SnapshotKey) -> PathBuf {
        self.entry_dir(key).join("index.html")
    }

    /// Path of the captured-image artifact for this key.
    pub fn media_path(&self, key: &SnapshotKey, format: &str) -> PathBuf {
        self.entry_dir(key).join(media_file_name(format))
    }

    /// Cache-root-relative media path, with forward slashes, as handed to
    /// the capture worker and recorded in metadata.
    pub fn rel_media_path(&self, key: &SnapshotKey, format: &str) -> String {
        let mut parts = key.dir_parts();
        parts.push(media_file_name(format));
        parts.join("/")
    }

    /// Persist a rendered skeleton document for this key.
    pub fn write_html(&self, key: &SnapshotKey, html: &str) -> anyhow::Result<PathBuf> {
        let path = self.html_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, html)?;
        Ok(path)
    }

    /// Write the `meta.json` sidecar next to a content file. Full overwrite.
    pub fn write_meta(&self, content_path: &Path, meta: &SnapshotMeta) -> anyhow::Result<()> {
        let meta_path = content_path.with_file_name("meta.json");
        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&meta_path, serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    /// Read the sidecar next to a content file. Missing or corrupt
    /// metadata reads as `None` rather than an error.
    pub fn read_meta(&self, content_path: &Path) -> Option<SnapshotMeta> {
        let meta_path = content_path.with_file_name("meta.json");
        let content = fs::read_to_string(&meta_path).ok()?;
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(path = %meta_path.display(), %err, "unreadable snapshot metadata");
                None
            }
        }
    }

    /// Scan every `meta.json` under the cache root, optionally filtered by
    /// snapshot hash. Linear in the number of entries; cache sizes are
    /// expected in the hundreds to low thousands.
    pub fn list_meta(&self, snapshot_hash: Option<&str>) -> Vec<SnapshotMeta> {
        let mut entries = Vec::new();
        if self.root.exists() {
            collect_meta(&self.root, snapshot_hash, &mut entries);
        }
        entries
    }

    /// Resolve the media artifact for a key: prefers the captured image
    /// named by the metadata, falling back to the rendered skeleton HTML.
    pub fn media_info(&self, key: &SnapshotKey) -> MediaInfo {
        let html_path = self.html_path(key);
        // meta.json sits next to every content file in the entry dir
        let meta = self.read_meta(&html_path);
        let format = meta
            .as_ref()
            .and_then(|m| m.format.clone())
            .unwrap_or_else(|| "webp".to_string());

        let image_path = self.media_path(key, &format);
        let path = if image_path.exists() {
            image_path
        } else {
            html_path
        };
        let available = path.exists();
        let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let mut etag = meta.as_ref().and_then(|m| m.sha256.clone());
        if etag.is_none() && available {
            etag = fs::read(&path)
                .ok()
                .map(|bytes| hex::encode(Sha256::digest(&bytes)));
        }

        let rel_path = path
            .strip_prefix(&self.root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| path.to_string_lossy().to_string());

        MediaInfo {
            path,
            rel_path,
            available,
            etag,
            size_bytes,
            meta,
        }
    }
}

fn media_file_name(format: &str) -> String {
    let ext = format.trim().trim_matches('.').to_lowercase();
    let ext = if ext.is_empty() { "webp" } else { &ext };
    format!("snapshot.{ext}")
}

fn collect_meta(dir: &Path, snapshot_hash: Option<&str>, out: &mut Vec<SnapshotMeta>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_meta(&path, snapshot_hash, out);
        } else if path.file_name().is_some_and(|n| n == "meta.json") {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(meta) = serde_json::from_str::<SnapshotMeta>(&content) else {
                continue;
            };
            if let Some(wanted) = snapshot_hash {
                if meta.snapshot_hash != wanted {
                    continue;
                }
            }
            out.push(meta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(route: &str) -> SnapshotKey {
        SnapshotKey {
            route_norm: route.to_string(),
            snapshot_hash: "default".to_string(),
            vp_bucket: "any".to_string(),
            grid_id: "12x8".to_string(),
            section: "all".to_string(),
        }
    }

    #[test]
    fn sanitizes_traversal_attempts() {
        assert_eq!(safe_segment("../../etc/passwd"), "..__..__etc__passwd");
        assert!(!safe_segment("../../etc/passwd").contains('/'));
    }

    #[test]
    fn all_dot_segments_collapse_to_default() {
        assert_eq!(safe_segment("."), "default");
        assert_eq!(safe_segment(".."), "default");
        assert_eq!(safe_segment("..."), "default");
        assert_eq!(safe_segment("_.._"), "default");
        // Dots next to real characters stay as-is.
        assert_eq!(safe_segment("..a"), "..a");
    }

    #[test]
    fn dotdot_key_components_stay_under_the_root() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(tmp.path().join("cache"));
        let key = SnapshotKey {
            route_norm: "/pricing".to_string(),
            snapshot_hash: "..".to_string(),
            vp_bucket: "..".to_string(),
            grid_id: "12x8".to_string(),
            section: "..".to_string(),
        };
        assert!(key.dir_parts().iter().all(|part| part != ".." && part != "."));

        let path = cache.write_html(&key, "x").unwrap();
        let resolved = path.canonicalize().unwrap();
        let root = cache.root().canonicalize().unwrap();
        assert!(resolved.starts_with(&root));
    }

    #[test]
    fn sanitizes_unicode_and_specials() {
        let out = safe_segment("héllo wörld!");
        assert!(out
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
        assert_eq!(safe_segment(""), "default");
        assert_eq!(safe_segment("___"), "default");
        assert_eq!(safe_segment("ok-name_1.2"), "ok-name_1.2");
    }

    #[test]
    fn segments_cap_at_80_chars() {
        let long = "a".repeat(200);
        assert_eq!(safe_segment(&long).len(), 80);
    }

    #[test]
    fn key_layout_orders_components() {
        let parts = key("/user/:id/profile").dir_parts();
        assert_eq!(
            parts,
            vec!["default", "user", "id", "profile", "any", "12x8", "all"]
        );
    }

    #[test]
    fn root_route_maps_to_root_directory() {
        let parts = key("/").dir_parts();
        assert_eq!(parts[1], "root");
    }

    #[test]
    fn html_write_then_media_info_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(tmp.path());
        let key = key("/pricing");
        let path = cache.write_html(&key, "<html>stub</html>").unwrap();
        cache
            .write_meta(
                &path,
                &SnapshotMeta {
                    route: "/pricing".to_string(),
                    route_norm: "/pricing".to_string(),
                    snapshot_hash: "default".to_string(),
                    format: Some("html".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let info = cache.media_info(&key);
        assert!(info.available);
        assert!(info.path.ends_with("index.html"));
        assert_eq!(info.size_bytes, "<html>stub</html>".len() as u64);
        // No recorded sha: etag is computed from bytes.
        assert!(info.etag.is_some());
        assert!(info.rel_path.starts_with("default/pricing/"));
    }

    #[test]
    fn missing_entry_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(tmp.path());
        let info = cache.media_info(&key("/nowhere"));
        assert!(!info.available);
        assert_eq!(info.size_bytes, 0);
        assert!(info.meta.is_none());
    }

    #[test]
    fn corrupt_meta_reads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(tmp.path());
        let key = key("/a");
        let path = cache.write_html(&key, "x").unwrap();
        std::fs::write(path.with_file_name("meta.json"), "{not json").unwrap();
        assert!(cache.read_meta(&path).is_none());
    }

    #[test]
    fn list_meta_filters_by_snapshot_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(tmp.path());

        for (route, hash) in [("/a", "v1"), ("/b", "v1"), ("/c", "v2")] {
            let k = SnapshotKey {
                route_norm: route.to_string(),
                snapshot_hash: hash.to_string(),
                vp_bucket: "any".to_string(),
                grid_id: "12x8".to_string(),
                section: "all".to_string(),
            };
            let path = cache.write_html(&k, "x").unwrap();
            cache
                .write_meta(
                    &path,
                    &SnapshotMeta {
                        route_norm: route.to_string(),
                        snapshot_hash: hash.to_string(),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        assert_eq!(cache.list_meta(None).len(), 3);
        let v1 = cache.list_meta(Some("v1"));
        assert_eq!(v1.len(), 2);
        assert!(v1.iter().all(|m| m.snapshot_hash == "v1"));
    }

    #[test]
    fn media_extension_is_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(tmp.path());
        let k = key("/x");
        assert!(cache.media_path(&k, ".PNG").ends_with("snapshot.png"));
        assert!(cache.media_path(&k, "").ends_with("snapshot.webp"));
    }
}
