//! Download engine: retrying single-shot fetches for small files and
//! resumable ranged fetches for large ones, both committing through the
//! object store's `.part` protocol.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use log::debug;
use reqwest::header::RANGE;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout};

use crate::config::Config;
use crate::errors::{Result, SnapshotError};

/// A single explicit retry policy per operation; transient errors are
/// re-attempted with a fixed backoff, everything else surfaces immediately.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    debug!(
                        "{}: retrying ({}/{}): {}",
                        what, attempt, self.max_attempts, e
                    );
                    sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct DownloadEngine {
    client: Client,
    small_retry: RetryPolicy,
    ranged_retry: RetryPolicy,
    direct_limit: u64,
    block_size: u64,
    head_timeout: Duration,
    read_timeout: Duration,
}

impl DownloadEngine {
    pub fn new(config: &Config) -> Result<DownloadEngine> {
        let client = Client::builder()
            .connect_timeout(config.head_timeout())
            .build()
            .map_err(|e| SnapshotError::TransientNetwork {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(DownloadEngine {
            client,
            small_retry: RetryPolicy {
                max_attempts: config.retry_attempts,
                backoff: Duration::from_secs(config.retry_backoff_secs),
            },
            ranged_retry: RetryPolicy {
                max_attempts: config.resume_retry_attempts,
                backoff: Duration::from_secs(config.resume_retry_backoff_secs),
            },
            direct_limit: config.direct_download_limit,
            block_size: config.range_block_size,
            head_timeout: config.head_timeout(),
            read_timeout: config.read_timeout(),
        })
    }

    /// HEAD probe; retried like any other request.
    pub async fn url_exists(&self, url: &str) -> Result<bool> {
        self.small_retry
            .run(url, || async {
                let resp = self
                    .client
                    .head(url)
                    .timeout(self.head_timeout)
                    .send()
                    .await
                    .map_err(|e| SnapshotError::from_reqwest(url, e))?;
                if resp.status().is_success() {
                    Ok(true)
                } else if resp.status().is_server_error() {
                    Err(SnapshotError::from_status(url, resp.status()))
                } else {
                    Ok(false)
                }
            })
            .await
    }

    /// Discover the size of a remote file via `Content-Length`.
    pub async fn content_length(&self, url: &str) -> Result<Option<u64>> {
        self.small_retry
            .run(url, || async {
                let resp = self
                    .client
                    .head(url)
                    .timeout(self.head_timeout)
                    .send()
                    .await
                    .map_err(|e| SnapshotError::from_reqwest(url, e))?;
                if !resp.status().is_success() {
                    return Err(SnapshotError::from_status(url, resp.status()));
                }
                Ok(resp.content_length())
            })
            .await
    }

    /// Fetch a small text resource (catalog files, directory listings).
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        self.small_retry
            .run(url, || async {
                let resp = self
                    .client
                    .get(url)
                    .timeout(self.read_timeout)
                    .send()
                    .await
                    .map_err(|e| SnapshotError::from_reqwest(url, e))?;
                if !resp.status().is_success() {
                    return Err(SnapshotError::from_status(url, resp.status()));
                }
                resp.text()
                    .await
                    .map_err(|e| SnapshotError::from_reqwest(url, e))
            })
            .await
    }

    /// Fetch a whole response body into `part` in one request.
    pub async fn fetch_small(&self, url: &str, part: &Path) -> Result<()> {
        self.small_retry
            .run(url, || self.fetch_small_once(url, part))
            .await
    }

    async fn fetch_small_once(&self, url: &str, part: &Path) -> Result<()> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SnapshotError::from_reqwest(url, e))?;
        if !resp.status().is_success() {
            return Err(SnapshotError::from_status(url, resp.status()));
        }
        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| SnapshotError::store(part, e))?;
        loop {
            let chunk = timeout(self.read_timeout, resp.chunk())
                .await
                .map_err(|_| SnapshotError::TransientNetwork {
                    url: url.to_string(),
                    message: "read timeout".to_string(),
                })?
                .map_err(|e| SnapshotError::from_reqwest(url, e))?;
            match chunk {
                Some(bytes) => file
                    .write_all(&bytes)
                    .await
                    .map_err(|e| SnapshotError::store(part, e))?,
                None => break,
            }
        }
        file.sync_all().await.map_err(|e| SnapshotError::store(part, e))?;

        Ok(())
    }

    /// Resumable chunked fetch. The partial file at `part` is preserved
    /// between attempts and resumed from its current length.
    pub async fn fetch_ranged(&self, url: &str, part: &Path, size: Option<u64>) -> Result<()> {
        self.ranged_retry
            .run(url, || self.fetch_ranged_once(url, part, size))
            .await
    }

    async fn fetch_ranged_once(&self, url: &str, part: &Path, size: Option<u64>) -> Result<()> {
        let size = match size {
            Some(size) => size,
            None => self
                .content_length(url)
                .await?
                .ok_or_else(|| SnapshotError::NotFound {
                    url: format!("{} (no Content-Length)", url),
                })?,
        };
        let mut first = match tokio::fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        debug!(
            "{}: starting download at {}B (total: {}B)",
            url, first, size
        );
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(part)
            .await
            .map_err(|e| SnapshotError::store(part, e))?;
        while first < size {
            let last = std::cmp::min(first + self.block_size, size) - 1;
            debug!("{}: downloading bytes range {} - {}", url, first, last);
            let mut resp = self
                .client
                .get(url)
                .header(RANGE, format!("bytes={}-{}", first, last))
                .send()
                .await
                .map_err(|e| SnapshotError::from_reqwest(url, e))?;
            if !resp.status().is_success() {
                return Err(SnapshotError::from_status(url, resp.status()));
            }
            let mut received = 0u64;
            loop {
                let chunk = timeout(self.read_timeout, resp.chunk())
                    .await
                    .map_err(|_| SnapshotError::TransientNetwork {
                        url: url.to_string(),
                        message: "read timeout".to_string(),
                    })?
                    .map_err(|e| SnapshotError::from_reqwest(url, e))?;
                match chunk {
                    Some(bytes) => {
                        file.write_all(&bytes)
                            .await
                            .map_err(|e| SnapshotError::store(part, e))?;
                        received += bytes.len() as u64;
                    }
                    None => break,
                }
            }
            if received != last - first + 1 {
                return Err(SnapshotError::TransientNetwork {
                    url: url.to_string(),
                    message: format!("short range read: {} of {}", received, last - first + 1),
                });
            }
            first = last + 1;
        }
        file.sync_all().await.map_err(|e| SnapshotError::store(part, e))?;

        Ok(())
    }

    /// Strategy dispatch: direct download below the size threshold,
    /// resumable ranged download above it or when the size is unknown.
    pub async fn fetch(&self, url: &str, part: &Path, size: Option<u64>) -> Result<()> {
        match size {
            Some(size) if size <= self.direct_limit => self.fetch_small(url, part).await,
            _ => self.fetch_ranged(url, part, size).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use warp::http::{Response, StatusCode};
    use warp::hyper::Body;
    use warp::Filter;

    use crate::config::Config;

    /// Serve `body` at `/blob` with `Range` support, failing the first
    /// `fail_first` range requests with a 500.
    pub fn spawn_blob_server(body: Vec<u8>, fail_first: u32) -> (SocketAddr, Arc<AtomicU32>) {
        let requests = Arc::new(AtomicU32::new(0));
        let counter = requests.clone();
        let route = warp::path("blob")
            .and(warp::header::optional::<String>("range"))
            .map(move |range: Option<String>| {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                if seen < fail_first {
                    return Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::empty())
                        .unwrap();
                }
                match range {
                    Some(spec) => {
                        let spec = spec.trim_start_matches("bytes=");
                        let (a, b) = spec.split_once('-').unwrap();
                        let a: usize = a.parse().unwrap();
                        let b: usize = b.parse().unwrap();
                        Response::builder()
                            .status(StatusCode::PARTIAL_CONTENT)
                            .body(Body::from(body[a..=b].to_vec()))
                            .unwrap()
                    }
                    None => Response::builder().body(Body::from(body.clone())).unwrap(),
                }
            });
        let (addr, fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(fut);
        (addr, requests)
    }

    pub fn test_config() -> Config {
        Config {
            range_block_size: 64,
            retry_backoff_secs: 0,
            resume_retry_backoff_secs: 0,
            retry_attempts: 3,
            resume_retry_attempts: 5,
            ..Config::default()
        }
    }
}

#[tokio::test]
async fn test_fetch_small() {
    let (addr, requests) = testing::spawn_blob_server(b"package bytes".to_vec(), 0);
    let engine = DownloadEngine::new(&testing::test_config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let part = dir.path().join("blob.part");
    engine
        .fetch_small(&format!("http://{}/blob", addr), &part)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&part).unwrap(), b"package bytes");
    assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fetch_small_retries_server_errors() {
    let (addr, requests) = testing::spawn_blob_server(b"eventually".to_vec(), 2);
    let engine = DownloadEngine::new(&testing::test_config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let part = dir.path().join("blob.part");
    engine
        .fetch_small(&format!("http://{}/blob", addr), &part)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&part).unwrap(), b"eventually");
    assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fetch_ranged_chunks() {
    let body: Vec<u8> = (0..=255u8).cycle().take(300).collect();
    let (addr, _) = testing::spawn_blob_server(body.clone(), 0);
    let engine = DownloadEngine::new(&testing::test_config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let part = dir.path().join("blob.part");
    engine
        .fetch_ranged(&format!("http://{}/blob", addr), &part, Some(300))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&part).unwrap(), body);
}

#[tokio::test]
async fn test_fetch_ranged_resumes_from_part() {
    let body: Vec<u8> = (1..=200u8).collect();
    // every chunk request fails once; the outer retry must pick the
    // transfer back up from the preserved .part offset
    let (addr, _) = testing::spawn_blob_server(body.clone(), 1);
    let engine = DownloadEngine::new(&testing::test_config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let part = dir.path().join("blob.part");
    tokio::fs::write(&part, &body[..100]).await.unwrap();
    engine
        .fetch_ranged(&format!("http://{}/blob", addr), &part, Some(200))
        .await
        .unwrap();
    assert_eq!(std::fs::read(&part).unwrap(), body);
}

#[tokio::test]
async fn test_ranged_fetch_commits_verified_blob() {
    // interrupted large transfer, resumed, then committed under the hash
    // the repository published
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = crate::store::sha256sum(&body[..]).unwrap();
    let (addr, _) = testing::spawn_blob_server(body.clone(), 1);
    let config = Config {
        range_block_size: 65_536,
        resume_retry_backoff_secs: 0,
        resume_retry_attempts: 10,
        ..Config::default()
    };
    let engine = DownloadEngine::new(&config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = crate::store::ObjectStore::open(dir.path()).unwrap();
    let part = store.part_path(&expected);
    // a previous run got halfway before dying
    tokio::fs::write(&part, &body[..100_000]).await.unwrap();
    engine
        .fetch_ranged(
            &format!("http://{}/blob", addr),
            &part,
            Some(body.len() as u64),
        )
        .await
        .unwrap();
    let committed = store.commit(part, Some(&expected), false).await.unwrap();
    assert_eq!(committed, expected);
    assert_eq!(std::fs::read(store.blob_path(&expected)).unwrap(), body);
}

#[tokio::test]
async fn test_retry_policy_gives_up_on_terminal_errors() {
    let policy = RetryPolicy {
        max_attempts: 10,
        backoff: Duration::from_secs(0),
    };
    let mut calls = 0;
    let result: Result<()> = policy
        .run("test", || {
            calls += 1;
            async move {
                Err(SnapshotError::NotFound {
                    url: "http://example.invalid".to_string(),
                })
            }
        })
        .await;
    assert!(result.unwrap_err().is_not_found());
    assert_eq!(calls, 1);
}
