//! Timestamp catalog: which snapshot instants exist for an archive, and the
//! ordered timeline the range merge consults.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::Config;
use crate::download::DownloadEngine;
use crate::errors::{Result, SnapshotError};

/// Canonical compact instant form `YYYYMMDDTHHMMSSZ`. Lexicographic order
/// equals chronological order.
pub fn is_timestamp(value: &str) -> bool {
    let b = value.as_bytes();
    b.len() == 16
        && b[8] == b'T'
        && b[15] == b'Z'
        && b[..8].iter().all(u8::is_ascii_digit)
        && b[9..15].iter().all(u8::is_ascii_digit)
}

pub fn catalog_path(root: &Path, archive: &str) -> PathBuf {
    root.join("by-timestamp").join(format!("{}.txt", archive))
}

/// Cached enumeration for an archive, deduplicated, descending.
pub fn read_catalog(root: &Path, archive: &str) -> Result<Vec<String>> {
    let path = catalog_path(root, archive);
    let content = std::fs::read_to_string(&path).map_err(|e| SnapshotError::CatalogUnavailable {
        archive: archive.to_string(),
        message: format!("{}: {}", path.display(), e),
    })?;

    Ok(dedup_descending(content.lines()))
}

pub fn write_catalog(root: &Path, archive: &str, timestamps: &[String]) -> Result<()> {
    let path = catalog_path(root, archive);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SnapshotError::store(parent, e))?;
    }
    let mut content = timestamps.join("\n");
    content.push('\n');
    std::fs::write(&path, content).map_err(|e| SnapshotError::store(&path, e))?;

    Ok(())
}

fn dedup_descending<'a, I: Iterator<Item = &'a str>>(lines: I) -> Vec<String> {
    let mut values: Vec<String> = lines
        .map(str::trim)
        .filter(|l| is_timestamp(l))
        .map(str::to_string)
        .collect();
    values.sort_unstable();
    values.dedup();
    values.reverse();

    values
}

/// Resolve a `begin:end` expression against the full enumeration. An empty
/// boundary means the earliest/latest known timestamp. Input and output are
/// descending.
pub fn select_range(all: &[String], expr: &str) -> Vec<String> {
    let (begin, end) = match expr.split_once(':') {
        Some(pair) => pair,
        None => (expr, expr),
    };
    let begin = if begin.is_empty() {
        all.last().map(String::as_str).unwrap_or("")
    } else {
        begin
    };
    let end = if end.is_empty() {
        all.first().map(String::as_str).unwrap_or("")
    } else {
        end
    };

    all.iter()
        .filter(|ts| begin <= ts.as_str() && ts.as_str() <= end)
        .cloned()
        .collect()
}

/// Enumerate the timestamps to mirror, in descending order. Sources in
/// priority order: explicit list, range expression against the cached
/// enumeration, remote catalog discovery (which refreshes the cache).
pub async fn enumerate(
    engine: &DownloadEngine,
    config: &Config,
    root: &Path,
    archive: &str,
    requested: &[String],
) -> Result<Vec<String>> {
    debug!("enumerating timestamps for {}", archive);
    if let Some(first) = requested.first() {
        if first.contains(':') {
            let all = read_catalog(root, archive)?;
            return Ok(select_range(&all, first));
        }
        return Ok(requested.to_vec());
    }
    let url = config.catalog_url.replace("{archive}", archive);
    match engine.fetch_text(&url).await {
        Ok(body) => {
            let timestamps = dedup_descending(body.lines());
            if timestamps.is_empty() {
                return Err(SnapshotError::CatalogUnavailable {
                    archive: archive.to_string(),
                    message: format!("{}: empty catalog", url),
                });
            }
            write_catalog(root, archive, &timestamps)?;
            info!("{}: {} timestamps enumerated", archive, timestamps.len());
            Ok(timestamps)
        }
        Err(e) => {
            debug!("catalog fetch failed, trying local cache: {}", e);
            read_catalog(root, archive)
        }
    }
}

/// The ordered timestamp list of one archive; gives the range merge its
/// notion of "immediately preceding/following timestamp".
pub struct Timeline {
    values: Vec<String>,
}

impl Timeline {
    pub fn new(mut values: Vec<String>) -> Timeline {
        values.sort_unstable();
        values.dedup();
        Timeline { values }
    }

    pub fn contains(&self, t: &str) -> bool {
        self.values.binary_search_by(|v| v.as_str().cmp(t)).is_ok()
    }

    /// The archive timestamp immediately before `t`, if any.
    pub fn prev(&self, t: &str) -> Option<&str> {
        let idx = self.values.partition_point(|v| v.as_str() < t);
        idx.checked_sub(1).map(|i| self.values[i].as_str())
    }

    /// The archive timestamp immediately after `t`, if any.
    pub fn next(&self, t: &str) -> Option<&str> {
        let idx = self.values.partition_point(|v| v.as_str() <= t);
        self.values.get(idx).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

#[test]
fn test_is_timestamp() {
    assert!(is_timestamp("20210101T000000Z"));
    assert!(!is_timestamp("20210101t000000Z"));
    assert!(!is_timestamp("20210101T000000"));
    assert!(!is_timestamp(""));
    assert!(!is_timestamp("2021-01-01T00:00:00Z"));
}

#[cfg(test)]
fn sample() -> Vec<String> {
    vec![
        "20210301T000000Z".to_string(),
        "20210201T000000Z".to_string(),
        "20210101T000000Z".to_string(),
    ]
}

#[test]
fn test_select_range_bounded() {
    let all = sample();
    assert_eq!(
        select_range(&all, "20210101T000000Z:20210201T000000Z"),
        vec!["20210201T000000Z", "20210101T000000Z"]
    );
}

#[test]
fn test_select_range_open_boundaries() {
    let all = sample();
    // ":T" returns exactly the timestamps <= T
    assert_eq!(
        select_range(&all, ":20210201T000000Z"),
        vec!["20210201T000000Z", "20210101T000000Z"]
    );
    // "T:" returns exactly the timestamps >= T
    assert_eq!(
        select_range(&all, "20210201T000000Z:"),
        vec!["20210301T000000Z", "20210201T000000Z"]
    );
    // ":" returns the full list
    assert_eq!(select_range(&all, ":"), all);
}

#[test]
fn test_timeline_neighbors() {
    let timeline = Timeline::new(sample());
    assert_eq!(timeline.prev("20210201T000000Z"), Some("20210101T000000Z"));
    assert_eq!(timeline.prev("20210101T000000Z"), None);
    assert_eq!(timeline.next("20210201T000000Z"), Some("20210301T000000Z"));
    assert_eq!(timeline.next("20210301T000000Z"), None);
    assert!(timeline.contains("20210101T000000Z"));
    assert!(!timeline.contains("20200101T000000Z"));
}

#[test]
fn test_catalog_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let unsorted = vec![
        "20210101T000000Z".to_string(),
        "20210301T000000Z".to_string(),
        "20210301T000000Z".to_string(),
    ];
    write_catalog(dir.path(), "debian", &unsorted).unwrap();
    let read = read_catalog(dir.path(), "debian").unwrap();
    assert_eq!(read, vec!["20210301T000000Z", "20210101T000000Z"]);
}

#[tokio::test]
async fn test_enumerate_remote_discovery_refreshes_cache() {
    use warp::Filter;

    let catalog = "20210101T000000Z\n20210301T000000Z\n20210201T000000Z\n20210301T000000Z\n";
    let route = warp::path!("api").map(move || catalog);
    let (addr, fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(fut);

    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        catalog_url: format!("http://{}/api?timestamps={{archive}}", addr),
        retry_backoff_secs: 0,
        ..Config::default()
    };
    let engine = DownloadEngine::new(&config).unwrap();
    let enumerated = enumerate(&engine, &config, dir.path(), "debian", &[])
        .await
        .unwrap();
    assert_eq!(
        enumerated,
        vec!["20210301T000000Z", "20210201T000000Z", "20210101T000000Z"]
    );
    // the enumeration is cached for later offline range expressions
    let cached = read_catalog(dir.path(), "debian").unwrap();
    assert_eq!(cached, enumerated);
    let range = enumerate(
        &engine,
        &config,
        dir.path(),
        "debian",
        &["20210201T000000Z:".to_string()],
    )
    .await
    .unwrap();
    assert_eq!(range, vec!["20210301T000000Z", "20210201T000000Z"]);
}

#[tokio::test]
async fn test_enumerate_missing_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        catalog_url: "http://127.0.0.1:1/api?timestamps={archive}".to_string(),
        retry_attempts: 1,
        retry_backoff_secs: 0,
        ..Config::default()
    };
    let engine = DownloadEngine::new(&config).unwrap();
    let err = enumerate(&engine, &config, dir.path(), "debian", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, SnapshotError::CatalogUnavailable { .. }));
}
