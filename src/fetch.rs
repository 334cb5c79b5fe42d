//! Artifact fetcher: drives the download engine over a record stream,
//! deduplicating by hash so every blob is fetched at most once per run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt};
use log::{debug, info};

use crate::config::Config;
use crate::download::DownloadEngine;
use crate::errors::{Result, SnapshotError};
use crate::parser::PackageRecord;
use crate::store::ObjectStore;

/// One unique blob to mirror, with every path-tree entry that references it.
#[derive(Debug)]
pub struct Artifact {
    pub sha256: String,
    pub size: u64,
    pub name: String,
    pub rel_paths: BTreeSet<String>,
}

pub fn rel_path(archive: &str, timestamp: &str, record: &PackageRecord) -> String {
    format!(
        "archive/{}/{}{}/{}",
        archive, timestamp, record.path, record.filename
    )
}

/// Deduplicate a record stream by hash. The result is name-sorted so fetch
/// order within a timestamp is stable.
pub fn plan(records: &[PackageRecord], archive: &str, timestamp: &str) -> Vec<Artifact> {
    let mut by_hash: BTreeMap<String, Artifact> = BTreeMap::new();
    for record in records {
        let rel = rel_path(archive, timestamp, record);
        by_hash
            .entry(record.sha256.clone())
            .or_insert_with(|| Artifact {
                sha256: record.sha256.clone(),
                size: record.size,
                name: record.filename.clone(),
                rel_paths: BTreeSet::new(),
            })
            .rel_paths
            .insert(rel);
    }
    let mut artifacts: Vec<Artifact> = by_hash.into_values().collect();
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));

    artifacts
}

/// Candidate URLs for an artifact, in preference order: the snapshot
/// service path, the live archive path, the content-addressed redirect.
pub fn candidate_urls(
    config: &Config,
    archive: &str,
    timestamp: &str,
    record: &PackageRecord,
) -> Vec<String> {
    vec![
        format!(
            "{}/archive/{}/{}{}/{}",
            config.snapshot_url, archive, timestamp, record.path, record.filename
        ),
        format!(
            "{}/{}{}/{}",
            config.ftp_url, archive, record.path, record.filename
        ),
        format!("{}/file/{}", config.snapshot_url, record.sha256),
    ]
}

/// `plan` plus the candidate URL list per artifact, ready for `fetch_all`.
pub fn plan_with_urls(
    records: &[PackageRecord],
    archive: &str,
    timestamp: &str,
    config: &Config,
) -> Vec<(Artifact, Vec<String>)> {
    let mut record_by_hash: BTreeMap<&str, &PackageRecord> = BTreeMap::new();
    for record in records {
        record_by_hash.entry(record.sha256.as_str()).or_insert(record);
    }

    plan(records, archive, timestamp)
        .into_iter()
        .map(|artifact| {
            let urls = record_by_hash
                .get(artifact.sha256.as_str())
                .map(|record| candidate_urls(config, archive, timestamp, record))
                .unwrap_or_default();
            (artifact, urls)
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub downloaded: usize,
    pub deduplicated: usize,
    pub cancelled: usize,
}

enum Outcome {
    Downloaded,
    Linked,
    Cancelled,
}

pub struct ArtifactFetcher<'a> {
    store: &'a ObjectStore,
    engine: &'a DownloadEngine,
    concurrency: usize,
    keep_parts: bool,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(
        store: &'a ObjectStore,
        engine: &'a DownloadEngine,
        config: &'a Config,
        keep_parts: bool,
    ) -> ArtifactFetcher<'a> {
        ArtifactFetcher {
            store,
            engine,
            concurrency: config.fetch_concurrency,
            keep_parts,
        }
    }

    /// Fetch every artifact through the bounded pool. Request order is not
    /// preserved; completion only ever inserts into the store. The first
    /// exhausted artifact surfaces after in-flight transfers finish.
    pub async fn fetch_all(
        &self,
        artifacts: &[(Artifact, Vec<String>)],
        cancel: &AtomicBool,
    ) -> Result<FetchSummary> {
        let results: Vec<Result<Outcome>> = stream::iter(
            artifacts
                .iter()
                .map(|(artifact, urls)| self.fetch_one(artifact, urls, cancel)),
        )
        .buffer_unordered(self.concurrency.max(1))
        .collect()
        .await;

        let mut summary = FetchSummary::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(Outcome::Downloaded) => summary.downloaded += 1,
                Ok(Outcome::Linked) => summary.deduplicated += 1,
                Ok(Outcome::Cancelled) => summary.cancelled += 1,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(
            "{} blobs downloaded, {} already present",
            summary.downloaded, summary.deduplicated
        );

        Ok(summary)
    }

    async fn fetch_one(
        &self,
        artifact: &Artifact,
        urls: &[String],
        cancel: &AtomicBool,
    ) -> Result<Outcome> {
        if cancel.load(Ordering::Relaxed) {
            return Ok(Outcome::Cancelled);
        }
        if self.store.has(&artifact.sha256) {
            for rel in &artifact.rel_paths {
                self.store.link(rel, &artifact.sha256)?;
            }
            return Ok(Outcome::Linked);
        }
        for url in urls {
            debug!("{}", url);
            let part = self.store.part_path(&artifact.sha256);
            let fetched = async {
                self.engine.fetch(url, &part, Some(artifact.size)).await?;
                self.store
                    .commit(part.clone(), Some(&artifact.sha256), self.keep_parts)
                    .await
            }
            .await;
            match fetched {
                Ok(_) => {
                    for rel in &artifact.rel_paths {
                        self.store.link(rel, &artifact.sha256)?;
                    }
                    return Ok(Outcome::Downloaded);
                }
                Err(e @ SnapshotError::Store { .. }) => return Err(e),
                Err(e) => debug!("retry with another URL ({})", e),
            }
        }

        Err(SnapshotError::FetchExhausted {
            sha256: artifact.sha256.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::testing;
    use crate::parser::{parse_index, PackageKind};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use warp::Filter;

    // sha256 of b"hello world"
    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn spawn_any_path_server(body: &'static [u8], status: u16) -> (SocketAddr, Arc<AtomicU32>) {
        let requests = Arc::new(AtomicU32::new(0));
        let counter = requests.clone();
        let route = warp::any().map(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            warp::http::Response::builder()
                .status(status)
                .body(warp::hyper::Body::from(body))
                .unwrap()
        });
        let (addr, fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(fut);
        (addr, requests)
    }

    fn records_with_hello_hash() -> Vec<PackageRecord> {
        let input = format!(
            "Package: foo\nVersion: 1.0\nArchitecture: amd64\n\
             Filename: pool/main/f/foo/foo_1.0_amd64.deb\nSize: 11\nSHA256: {}\n\n\
             Package: foo-bis\nVersion: 1.0\nArchitecture: amd64\n\
             Filename: pool/main/f/foo/foo-bis_1.0_amd64.deb\nSize: 11\nSHA256: {}\n",
            HELLO_SHA, HELLO_SHA
        );
        let (records, errors) = parse_index(PackageKind::Binary, &input, "test");
        assert_eq!(errors, 0);
        records
    }

    #[test]
    fn test_plan_dedups_by_hash() {
        let records = records_with_hello_hash();
        let artifacts = plan(&records, "debian", "20210101T000000Z");
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].rel_paths.len(), 2);
        assert_eq!(artifacts[0].size, 11);
    }

    #[test]
    fn test_candidate_urls() {
        let config = Config::default();
        let records = records_with_hello_hash();
        let urls = candidate_urls(&config, "debian", "20210101T000000Z", &records[0]);
        assert_eq!(urls.len(), 3);
        assert_eq!(
            urls[0],
            "http://snapshot.debian.org/archive/debian/20210101T000000Z\
             /pool/main/f/foo/foo_1.0_amd64.deb"
        );
        assert_eq!(
            urls[1],
            "https://ftp.debian.org/debian/pool/main/f/foo/foo_1.0_amd64.deb"
        );
        assert!(urls[2].ends_with(&format!("/file/{}", HELLO_SHA)));
    }

    #[tokio::test]
    async fn test_fetch_downloads_blob_once() {
        let (addr, requests) = spawn_any_path_server(b"hello world", 200);
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let config = testing::test_config();
        let engine = DownloadEngine::new(&config).unwrap();
        let fetcher = ArtifactFetcher::new(&store, &engine, &config, false);

        let records = records_with_hello_hash();
        let base = format!("http://{}", addr);
        let artifacts: Vec<(Artifact, Vec<String>)> = plan(&records, "debian", "20210101T000000Z")
            .into_iter()
            .map(|a| {
                let urls = vec![format!("{}/blob", base)];
                (a, urls)
            })
            .collect();
        let cancel = AtomicBool::new(false);
        let summary = fetcher.fetch_all(&artifacts, &cancel).await.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 1);
        // both path-tree entries resolve to the same verified blob
        for rel in [
            "archive/debian/20210101T000000Z/pool/main/f/foo/foo_1.0_amd64.deb",
            "archive/debian/20210101T000000Z/pool/main/f/foo/foo-bis_1.0_amd64.deb",
        ] {
            let content = std::fs::read(dir.path().join(rel)).unwrap();
            assert_eq!(crate::store::sha256sum(&content[..]).unwrap(), HELLO_SHA);
        }
        assert!(store.verify(HELLO_SHA).unwrap());

        // a second run only links
        let summary = fetcher.fetch_all(&artifacts, &cancel).await.unwrap();
        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.deduplicated, 1);
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_exhausts_candidates() {
        let (addr, _) = spawn_any_path_server(b"", 404);
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let config = testing::test_config();
        let engine = DownloadEngine::new(&config).unwrap();
        let fetcher = ArtifactFetcher::new(&store, &engine, &config, false);

        let records = records_with_hello_hash();
        let artifacts: Vec<(Artifact, Vec<String>)> = plan(&records, "debian", "20210101T000000Z")
            .into_iter()
            .map(|a| {
                let urls = vec![
                    format!("http://{}/one", addr),
                    format!("http://{}/two", addr),
                ];
                (a, urls)
            })
            .collect();
        let cancel = AtomicBool::new(false);
        let err = fetcher.fetch_all(&artifacts, &cancel).await.unwrap_err();
        assert!(matches!(err, SnapshotError::FetchExhausted { .. }));
    }

    #[tokio::test]
    async fn test_fetch_respects_cancel() {
        let (addr, requests) = spawn_any_path_server(b"hello world", 200);
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let config = testing::test_config();
        let engine = DownloadEngine::new(&config).unwrap();
        let fetcher = ArtifactFetcher::new(&store, &engine, &config, false);

        let records = records_with_hello_hash();
        let artifacts: Vec<(Artifact, Vec<String>)> = plan(&records, "debian", "20210101T000000Z")
            .into_iter()
            .map(|a| (a, vec![format!("http://{}/blob", addr)]))
            .collect();
        let cancel = AtomicBool::new(true);
        let summary = fetcher.fetch_all(&artifacts, &cancel).await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.downloaded, 0);
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
