//! Metadata fetcher: mirrors the per-(archive, timestamp, suite, component)
//! index files — Release, Packages/Sources, translations, dep11, installer
//! images — through the object store.

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, error};
use regex::Regex;

use crate::config::Config;
use crate::download::DownloadEngine;
use crate::errors::{Result, SnapshotError};
use crate::store::ObjectStore;

const DEP11_ICON_FILES: &[&str] = &[
    "icons-48x48.tar.gz",
    "icons-64x64.tar.gz",
    "icons-128x128.tar.gz",
    "icons-48x48@2.tar.gz",
    "icons-64x64@2.tar.gz",
    "icons-128x128@2.tar.gz",
];

pub struct MetadataFetcher<'a> {
    store: &'a ObjectStore,
    engine: &'a DownloadEngine,
    config: &'a Config,
    keep_parts: bool,
}

fn dists_base(archive: &str, timestamp: &str, suite: &str, component: &str) -> String {
    format!(
        "archive/{}/{}/dists/{}/{}",
        archive, timestamp, suite, component
    )
}

impl<'a> MetadataFetcher<'a> {
    pub fn new(
        store: &'a ObjectStore,
        engine: &'a DownloadEngine,
        config: &'a Config,
        keep_parts: bool,
    ) -> MetadataFetcher<'a> {
        MetadataFetcher {
            store,
            engine,
            config,
            keep_parts,
        }
    }

    fn snapshot_url(&self, rel_path: &str) -> String {
        format!("{}/{}", self.config.snapshot_url, rel_path)
    }

    /// Mirror one file into the store and its path-tree symlink. With a
    /// published hash the blob is deduplicated up front; without one the
    /// file is staged under a unique name and keyed by its computed hash.
    pub async fn mirror_file(
        &self,
        rel_path: &str,
        url: &str,
        expected: Option<&str>,
        size: Option<u64>,
    ) -> Result<()> {
        match expected {
            Some(hash) => {
                if !self.store.has(hash) {
                    let part = self.store.part_path(hash);
                    self.engine.fetch(url, &part, size).await?;
                    self.store.commit(part, Some(hash), self.keep_parts).await?;
                }
                self.store.link(rel_path, hash)
            }
            None => {
                if self.store.linked(rel_path) {
                    return Ok(());
                }
                let part = self.store.stage_path()?;
                self.engine.fetch(url, &part, size).await?;
                let hash = self.store.commit(part, None, false).await?;
                self.store.link(rel_path, &hash)
            }
        }
    }

    /// Like `mirror_file`, but a missing URL is logged and skipped: a suite
    /// may simply not exist at a given timestamp.
    async fn mirror_optional(
        &self,
        rel_path: &str,
        url: &str,
        expected: Option<&str>,
    ) -> Result<bool> {
        match self.mirror_file(rel_path, url, expected, None).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                error!("Cannot find {}", url);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Scrape the published hashes from a directory's by-hash listing page.
    /// Failures yield an empty map; the affected files are then fetched
    /// without verification and keyed by their computed hash.
    pub async fn hashes_from_page(&self, url: &str) -> HashMap<String, String> {
        let link_regex = Regex::new(
            r#"<a href=".+">(.+)</a> -&gt;\n[ \t]*<a href="by-hash/SHA256/.+">by-hash/SHA256/([0-9a-f]+)</a>"#,
        )
        .expect("hardcoded regex");
        match self.engine.fetch_text(url).await {
            Ok(page) => link_regex
                .captures_iter(&page)
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .collect(),
            Err(e) => {
                debug!("no by-hash page at {}: {}", url, e);
                HashMap::new()
            }
        }
    }

    /// Fetch the `Packages.gz`/`Sources.gz` index for one slice, plus the
    /// debian-installer companion index where it applies. Returns the local
    /// paths of the indices that exist; `None` when the primary index is
    /// missing entirely.
    pub async fn fetch_repodata(
        &self,
        archive: &str,
        timestamp: &str,
        suite: &str,
        component: &str,
        arch: &str,
    ) -> Result<Option<Vec<PathBuf>>> {
        let base = dists_base(archive, timestamp, suite, component);
        let index = if arch == "source" {
            "source/Sources.gz".to_string()
        } else {
            format!("binary-{}/Packages.gz", arch)
        };
        let rel = format!("{}/{}", base, index);
        let url = self.snapshot_url(&rel);
        debug!("{}", url);
        if !self.mirror_optional(&rel, &url, None).await? {
            return Ok(None);
        }
        let mut paths = vec![self.store.root().join(&rel)];
        if arch != "source" {
            for name in ["Packages.gz", "Release"] {
                let rel = format!("{}/debian-installer/binary-{}/{}", base, arch, name);
                let url = self.snapshot_url(&rel);
                if self.mirror_optional(&rel, &url, None).await? && name == "Packages.gz" {
                    paths.push(self.store.root().join(&rel));
                }
            }
        }

        Ok(Some(paths))
    }

    /// Fetch the Release/InRelease set acknowledging a mirrored slice. Done
    /// after the slice's artifacts so a visible Release marks completeness.
    pub async fn fetch_releases(
        &self,
        archive: &str,
        timestamp: &str,
        suite: &str,
        component: &str,
        arch: &str,
    ) -> Result<()> {
        let suite_base = format!("archive/{}/{}/dists/{}", archive, timestamp, suite);
        let arch_dir = if arch == "source" {
            "source".to_string()
        } else {
            format!("binary-{}", arch)
        };
        let files = [
            format!("{}/Release", suite_base),
            format!("{}/Release.gpg", suite_base),
            format!("{}/InRelease", suite_base),
            format!("{}/{}/{}/Release", suite_base, component, arch_dir),
        ];
        for rel in &files {
            let url = self.snapshot_url(rel);
            debug!("{}", url);
            self.mirror_optional(rel, &url, None).await?;
        }

        Ok(())
    }

    pub async fn fetch_translation(
        &self,
        archive: &str,
        timestamp: &str,
        suite: &str,
        component: &str,
    ) -> Result<()> {
        let base = format!(
            "{}/i18n",
            dists_base(archive, timestamp, suite, component)
        );
        let hashes = self.hashes_from_page(&self.snapshot_url(&base)).await;
        for name in ["Translation-en.bz2"] {
            let rel = format!("{}/{}", base, name);
            let url = self.snapshot_url(&rel);
            debug!("{}", url);
            self.mirror_optional(&rel, &url, hashes.get(name).map(String::as_str))
                .await?;
        }

        Ok(())
    }

    pub async fn fetch_dep11(
        &self,
        archive: &str,
        timestamp: &str,
        suite: &str,
        component: &str,
        arches: &[String],
    ) -> Result<()> {
        let base = format!(
            "{}/dep11",
            dists_base(archive, timestamp, suite, component)
        );
        let mut files: Vec<String> = DEP11_ICON_FILES.iter().map(|s| s.to_string()).collect();
        for arch in arches {
            if arch != "source" && arch != "all" {
                files.push(format!("CID-Index-{}.json.gz", arch));
                files.push(format!("Components-{}.yml.gz", arch));
            }
        }
        let hashes = self.hashes_from_page(&self.snapshot_url(&base)).await;
        for name in &files {
            let rel = format!("{}/{}", base, name);
            let url = self.snapshot_url(&rel);
            debug!("{}", url);
            self.mirror_optional(&rel, &url, hashes.get(name).map(String::as_str))
                .await?;
        }

        Ok(())
    }

    /// Mirror the installer image tree for one architecture: fetch
    /// `SHA256SUMS`, then every image it lists. Image blobs dedup across
    /// architectures through the store.
    pub async fn fetch_installer(
        &self,
        archive: &str,
        timestamp: &str,
        suite: &str,
        component: &str,
        arch: &str,
    ) -> Result<()> {
        if arch == "source" || arch == "all" {
            return Ok(());
        }
        let base = format!(
            "{}/installer-{}/current/images",
            dists_base(archive, timestamp, suite, component),
            arch
        );
        let sums_rel = format!("{}/SHA256SUMS", base);
        let sums_url = self.snapshot_url(&sums_rel);
        if !self.engine.url_exists(&sums_url).await? {
            error!("Cannot find {}", sums_url);
            return Ok(());
        }
        if !self.mirror_optional(&sums_rel, &sums_url, None).await? {
            return Ok(());
        }
        let sums_path = self.store.root().join(&sums_rel);
        let content = std::fs::read_to_string(&sums_path)
            .map_err(|e| SnapshotError::store(&sums_path, e))?;
        let mut images: HashMap<String, Vec<String>> = HashMap::new();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(hash), Some(name)) = (parts.next(), parts.next()) {
                let name = name.trim_start_matches("./").to_string();
                images.entry(hash.to_string()).or_default().push(name);
            }
        }
        for (sha256, names) in images {
            for name in names {
                let rel = format!("{}/{}", base, name);
                if self.store.linked(&rel) {
                    continue;
                }
                let urls = [
                    format!(
                        "{}/{}/dists/{}/{}/installer-{}/current/images/{}",
                        self.config.ftp_url, archive, suite, component, arch, name
                    ),
                    self.snapshot_url(&rel),
                ];
                let mut fetched = false;
                for url in &urls {
                    debug!("{}", url);
                    let size = match self.engine.content_length(url).await {
                        Ok(size) => size,
                        Err(e) => {
                            debug!("retry with another URL ({})", e);
                            continue;
                        }
                    };
                    match self.mirror_file(&rel, url, Some(&sha256), size).await {
                        Ok(()) => {
                            fetched = true;
                            break;
                        }
                        Err(e) => debug!("retry with another URL ({})", e),
                    }
                }
                if !fetched {
                    error!("Cannot find {}", rel);
                }
            }
        }

        Ok(())
    }
}

#[test]
fn test_dists_base() {
    assert_eq!(
        dists_base("debian", "20210101T000000Z", "unstable", "main"),
        "archive/debian/20210101T000000Z/dists/unstable/main"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::testing;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use warp::hyper::Body;
    use warp::Filter;

    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn spawn_tree_server(
        files: HashMap<String, Vec<u8>>,
    ) -> (SocketAddr, Arc<AtomicU32>) {
        let files = Arc::new(files);
        let requests = Arc::new(AtomicU32::new(0));
        let counter = requests.clone();
        let route = warp::path::full().and(warp::method()).map(
            move |path: warp::path::FullPath, method: warp::http::Method| {
                if method == warp::http::Method::GET {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                match files.get(path.as_str()) {
                    Some(data) => warp::http::Response::builder()
                        .body(Body::from(data.clone()))
                        .unwrap(),
                    None => warp::http::Response::builder()
                        .status(warp::http::StatusCode::NOT_FOUND)
                        .body(Body::empty())
                        .unwrap(),
                }
            },
        );
        let (addr, fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(fut);
        (addr, requests)
    }

    fn test_setup(
        addr: SocketAddr,
    ) -> (tempfile::TempDir, ObjectStore, DownloadEngine, Config) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let config = Config {
            snapshot_url: format!("http://{}", addr),
            ftp_url: format!("http://{}/ftp", addr),
            // the fixture server answers Range requests with full bodies
            range_block_size: 1_000_000,
            ..testing::test_config()
        };
        let engine = DownloadEngine::new(&config).unwrap();
        (dir, store, engine, config)
    }

    #[tokio::test]
    async fn test_mirror_file_dedups_known_hash() {
        let mut files = HashMap::new();
        files.insert("/data/blob".to_string(), b"hello world".to_vec());
        let (addr, requests) = spawn_tree_server(files);
        let (_dir, store, engine, config) = test_setup(addr);
        let fetcher = MetadataFetcher::new(&store, &engine, &config, false);

        let url = format!("http://{}/data/blob", addr);
        fetcher
            .mirror_file("mirror/a/blob", &url, Some(HELLO_SHA), Some(11))
            .await
            .unwrap();
        // the second logical path reuses the committed blob
        fetcher
            .mirror_file("mirror/b/blob", &url, Some(HELLO_SHA), Some(11))
            .await
            .unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert!(store.linked("mirror/a/blob"));
        assert!(store.linked("mirror/b/blob"));
    }

    #[tokio::test]
    async fn test_mirror_file_unhashed_keys_by_computed_hash() {
        let mut files = HashMap::new();
        files.insert("/dists/Release".to_string(), b"hello world".to_vec());
        let (addr, _) = spawn_tree_server(files);
        let (_dir, store, engine, config) = test_setup(addr);
        let fetcher = MetadataFetcher::new(&store, &engine, &config, false);

        let url = format!("http://{}/dists/Release", addr);
        fetcher
            .mirror_file("mirror/dists/Release", &url, None, None)
            .await
            .unwrap();
        assert!(store.has(HELLO_SHA));
        assert!(store.linked("mirror/dists/Release"));
    }

    #[tokio::test]
    async fn test_fetch_installer_images() {
        let sums = format!("{}  ./netboot/mini.iso\n{}  ./cdrom/mini.iso\n", HELLO_SHA, HELLO_SHA);
        let base = "/archive/debian/20210101T000000Z/dists/unstable/main\
                    /installer-amd64/current/images";
        let mut files = HashMap::new();
        files.insert(format!("{}/SHA256SUMS", base), sums.into_bytes());
        files.insert(
            format!("{}/netboot/mini.iso", base),
            b"hello world".to_vec(),
        );
        files.insert(format!("{}/cdrom/mini.iso", base), b"hello world".to_vec());
        let (addr, _) = spawn_tree_server(files);
        let (dir, store, engine, config) = test_setup(addr);
        let fetcher = MetadataFetcher::new(&store, &engine, &config, false);

        fetcher
            .fetch_installer("debian", "20210101T000000Z", "unstable", "main", "amd64")
            .await
            .unwrap();
        // two logical images share one deduplicated blob
        assert!(store.has(HELLO_SHA));
        for rel in ["netboot/mini.iso", "cdrom/mini.iso"] {
            let link = dir.path().join(format!(
                "archive/debian/20210101T000000Z/dists/unstable/main\
                 /installer-amd64/current/images/{}",
                rel
            ));
            assert_eq!(std::fs::read(&link).unwrap(), b"hello world");
        }
    }

    #[tokio::test]
    async fn test_fetch_repodata_missing_combination() {
        let (addr, _) = spawn_tree_server(HashMap::new());
        let (_dir, store, engine, config) = test_setup(addr);
        let fetcher = MetadataFetcher::new(&store, &engine, &config, false);

        let paths = fetcher
            .fetch_repodata("debian", "20210101T000000Z", "nonexistent", "main", "amd64")
            .await
            .unwrap();
        assert!(paths.is_none());
    }
}

#[test]
fn test_by_hash_page_regex() {
    let link_regex = Regex::new(
        r#"<a href=".+">(.+)</a> -&gt;\n[ \t]*<a href="by-hash/SHA256/.+">by-hash/SHA256/([0-9a-f]+)</a>"#,
    )
    .unwrap();
    let page = "<a href=\"Translation-en.bz2\">Translation-en.bz2</a> -&gt;\n\
                \t<a href=\"by-hash/SHA256/abc123\">by-hash/SHA256/abc123</a>\n";
    let caps = link_regex.captures(page).unwrap();
    assert_eq!(&caps[1], "Translation-en.bz2");
    assert_eq!(&caps[2], "abc123");
}
