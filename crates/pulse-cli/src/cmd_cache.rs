use pulse_cache::SnapshotCache;
use pulse_serve::AppConfig;

pub fn ls(snapshot: Option<&str>) -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    let cache = SnapshotCache::new(&config.cache_dir);

    let mut entries = cache.list_meta(snapshot);
    if entries.is_empty() {
        println!("no cached snapshots under {}", config.cache_dir.display());
        return Ok(());
    }
    entries.sort_by_key(|entry| std::cmp::Reverse(entry.captured_at.unwrap_or(0)));

    for entry in &entries {
        let format = entry.format.as_deref().unwrap_or("webp");
        let size = entry.bytes.unwrap_or(0);
        println!(
            "{:<40} {:<16} vp={:<10} grid={:<8} section={:<12} {} {}B",
            entry.route_norm, entry.snapshot_hash, entry.vp_bucket, entry.grid_id, entry.section,
            format, size,
        );
    }
    println!("{} entries", entries.len());
    Ok(())
}
