//! Ingest driver: iterates archives and timestamps, mirrors metadata and
//! artifacts, then folds the observations into the temporal index.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use log::{debug, error, info};
use rayon::prelude::*;
use sqlx::PgPool;
use tokio::task::block_in_place;

use crate::config::Config;
use crate::download::DownloadEngine;
use crate::errors::{Result, SnapshotError};
use crate::fetch::{plan_with_urls, ArtifactFetcher};
use crate::index::{self, Observations};
use crate::metadata::MetadataFetcher;
use crate::parser::{self, PackageKind, PackageRecord};
use crate::store::ObjectStore;
use crate::timestamps;

/// One mirroring run over a set of archives.
#[derive(Debug, Clone)]
pub struct MirrorJob {
    pub archives: Vec<String>,
    pub suites: Vec<String>,
    pub components: Vec<String>,
    pub architectures: Vec<String>,
    pub timestamps: Vec<String>,
    pub check_only: bool,
    pub provision_db: bool,
    pub provision_db_only: bool,
    pub ignore_provisioned: bool,
    pub keep_parts: bool,
    pub skip_installer: bool,
}

impl From<&crate::cli::MirrorArgs> for MirrorJob {
    fn from(args: &crate::cli::MirrorArgs) -> MirrorJob {
        MirrorJob {
            archives: args.archive.clone(),
            suites: args.suite.clone(),
            components: args.component.clone(),
            architectures: args.arch.clone(),
            timestamps: args.timestamp.clone(),
            check_only: args.check_only,
            provision_db: args.provision_db,
            provision_db_only: args.provision_db_only,
            ignore_provisioned: args.ignore_provisioned,
            keep_parts: args.no_clean_part_file,
            skip_installer: args.skip_installer_files,
        }
    }
}

/// Run the snapshot mirroring on all the archives, timestamps, suites,
/// components and architectures. One archive at a time; timestamps are
/// mirrored newest-first and folded oldest-first.
pub async fn run(
    config: &Config,
    store: &ObjectStore,
    job: &MirrorJob,
    pool: Option<&PgPool>,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let engine = DownloadEngine::new(config)?;
    let mut first_failure = None;
    for archive in &job.archives {
        let enumerated =
            timestamps::enumerate(&engine, config, store.root(), archive, &job.timestamps).await;
        let timestamps = match enumerated {
            Ok(timestamps) => timestamps,
            Err(e) => {
                error!("{}", e);
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
                continue;
            }
        };
        info!("{}: {} timestamps to process", archive, timestamps.len());
        if !job.provision_db_only {
            for timestamp in &timestamps {
                if cancel.load(Ordering::Relaxed) {
                    info!("cancelled, stopping before {}", timestamp);
                    break;
                }
                if let Err(e) =
                    mirror_timestamp(config, store, &engine, job, archive, timestamp, &cancel)
                        .await
                {
                    match e {
                        SnapshotError::Store { .. } => return Err(e),
                        e => error!("{}: {}", timestamp, e),
                    }
                }
            }
        }
        if job.provision_db || job.provision_db_only {
            let pool = match pool {
                Some(pool) => pool,
                None => {
                    return Err(SnapshotError::Index {
                        scope: archive.clone(),
                        message: "no database connection".to_string(),
                    })
                }
            };
            // the range merge needs the archive's full enumerated catalog,
            // not just the timestamps selected for this run: a gap left by
            // folding T1 then T3 must stay open while T2 exists upstream
            let mut enumerated = timestamps.clone();
            if let Ok(catalog) = timestamps::read_catalog(store.root(), archive) {
                enumerated.extend(catalog);
            }
            let timeline = match index::register_timestamps(pool, archive, &enumerated).await {
                Ok(timeline) => timeline,
                Err(e) => {
                    error!("{}", e);
                    continue;
                }
            };
            // fold past to present so the range merge sees history grow
            for timestamp in timestamps.iter().rev() {
                if cancel.load(Ordering::Relaxed) {
                    info!("cancelled, no marker written for {}", timestamp);
                    break;
                }
                if let Err(e) =
                    provision_slot(pool, store, job, archive, timestamp, &timeline).await
                {
                    error!("{}: {}", timestamp, e);
                }
            }
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Mirror the metadata and artifacts of one archive timestamp. Release
/// files are fetched last, acknowledging a fully mirrored timestamp.
pub(crate) async fn mirror_timestamp(
    config: &Config,
    store: &ObjectStore,
    engine: &DownloadEngine,
    job: &MirrorJob,
    archive: &str,
    timestamp: &str,
    cancel: &AtomicBool,
) -> Result<()> {
    info!("mirroring {}/{}", archive, timestamp);
    let metadata = MetadataFetcher::new(store, engine, config, job.keep_parts);
    let mut records: Vec<PackageRecord> = Vec::new();
    for suite in &job.suites {
        for component in &job.components {
            metadata
                .fetch_translation(archive, timestamp, suite, component)
                .await?;
            metadata
                .fetch_dep11(archive, timestamp, suite, component, &job.architectures)
                .await?;
            for arch in &job.architectures {
                if cancel.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let paths = match metadata
                    .fetch_repodata(archive, timestamp, suite, component, arch)
                    .await?
                {
                    Some(paths) => paths,
                    None => continue,
                };
                if !job.skip_installer && !job.check_only {
                    metadata
                        .fetch_installer(archive, timestamp, suite, component, arch)
                        .await?;
                }
                let kind = if arch == "source" {
                    PackageKind::Source
                } else {
                    PackageKind::Binary
                };
                for path in paths {
                    let (parsed, errors) = parser::load_index(&path, kind)?;
                    if errors > 0 {
                        error!("{}: {} unparseable paragraphs", path.display(), errors);
                    }
                    records.extend(parsed);
                }
            }
        }
    }
    if job.check_only {
        block_in_place(|| check_blobs(store, &records))?;
        return Ok(());
    }
    let artifacts = plan_with_urls(&records, archive, timestamp, config);
    let fetcher = ArtifactFetcher::new(store, engine, config, job.keep_parts);
    fetcher.fetch_all(&artifacts, cancel).await?;
    for suite in &job.suites {
        for component in &job.components {
            for arch in &job.architectures {
                metadata
                    .fetch_releases(archive, timestamp, suite, component, arch)
                    .await?;
            }
        }
    }
    // interrupted runs keep their .part files so the next run can resume
    if !job.keep_parts && !cancel.load(Ordering::Relaxed) {
        let removed = store.clean_parts()?;
        if removed > 0 {
            debug!("removed {} stale part files", removed);
        }
    }

    Ok(())
}

/// Verify mirrored blobs against the record stream: a missing blob is
/// reported, a corrupt one aborts the run.
pub(crate) fn check_blobs(store: &ObjectStore, records: &[PackageRecord]) -> Result<()> {
    let hashes: BTreeSet<&str> = records.iter().map(|r| r.sha256.as_str()).collect();
    let corrupt: SegQueue<String> = SegQueue::new();
    hashes.par_iter().for_each(|sha256| {
        if !store.has(sha256) {
            info!("MISSING: {}", sha256);
            return;
        }
        match store.verify(sha256) {
            Ok(true) => (),
            Ok(false) => corrupt.push(sha256.to_string()),
            Err(e) => {
                error!("{}", e);
                corrupt.push(sha256.to_string());
            }
        }
    });
    if let Some(sha256) = corrupt.pop() {
        return Err(SnapshotError::Store {
            path: store.blob_path(&sha256).display().to_string(),
            message: "blob does not hash to its key".to_string(),
        });
    }

    Ok(())
}

/// Fold one timestamp into the index, skipping slices that already carry an
/// ingestion marker.
pub(crate) async fn provision_slot(
    pool: &PgPool,
    store: &ObjectStore,
    job: &MirrorJob,
    archive: &str,
    timestamp: &str,
    timeline: &timestamps::Timeline,
) -> Result<()> {
    let mut obs = Observations::default();
    for suite in &job.suites {
        for component in &job.components {
            for arch in &job.architectures {
                let rel = index::repodata_path(archive, timestamp, suite, component, arch);
                let id = index::repodata_id(&rel);
                if !job.ignore_provisioned && index::is_provisioned(pool, &id).await? {
                    debug!("already provisioned: {}", rel);
                    continue;
                }
                let local = store.root().join(&rel);
                if !local.exists() {
                    error!("Cannot find {}", local.display());
                    continue;
                }
                let kind = if arch == "source" {
                    PackageKind::Source
                } else {
                    PackageKind::Binary
                };
                match parser::load_index(&local, kind) {
                    Ok((records, errors)) => {
                        if errors > 0 {
                            error!("{}: {} unparseable paragraphs", local.display(), errors);
                        }
                        obs.add_records(&records, suite, component);
                        obs.markers.insert(id);
                    }
                    Err(e) => error!("{}", e),
                }
            }
        }
    }
    if obs.markers.is_empty() {
        debug!("{}/{}: nothing to provision", archive, timestamp);
        return Ok(());
    }

    index::provision_timestamp(
        pool,
        archive,
        timestamp,
        timeline,
        &job.suites,
        &job.components,
        &job.architectures,
        &obs,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::io::Write;
    use std::net::SocketAddr;
    use warp::hyper::Body;
    use warp::Filter;

    const HELLO_SHA: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn spawn_tree_server(files: HashMap<String, Vec<u8>>) -> SocketAddr {
        let files = std::sync::Arc::new(files);
        let route = warp::path::full().map(move |path: warp::path::FullPath| {
            match files.get(path.as_str()) {
                Some(data) => warp::http::Response::builder()
                    .body(Body::from(data.clone()))
                    .unwrap(),
                None => warp::http::Response::builder()
                    .status(warp::http::StatusCode::NOT_FOUND)
                    .body(Body::empty())
                    .unwrap(),
            }
        });
        let (addr, fut) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(fut);
        addr
    }

    fn test_job() -> MirrorJob {
        MirrorJob {
            archives: vec!["debian".to_string()],
            suites: vec!["unstable".to_string()],
            components: vec!["main".to_string()],
            architectures: vec!["amd64".to_string()],
            timestamps: vec!["20210101T000000Z".to_string()],
            check_only: false,
            provision_db: false,
            provision_db_only: false,
            ignore_provisioned: false,
            keep_parts: false,
            skip_installer: true,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mirror_single_timestamp() {
        let packages = format!(
            "Package: hello\nVersion: 1.0-1\nArchitecture: amd64\n\
             Filename: pool/main/h/hello/hello_1.0-1_amd64.deb\nSize: 11\nSHA256: {}\n",
            HELLO_SHA
        );
        let mut files = HashMap::new();
        files.insert(
            "/archive/debian/20210101T000000Z/dists/unstable/main/binary-amd64/Packages.gz"
                .to_string(),
            gz(packages.as_bytes()),
        );
        files.insert(
            "/archive/debian/20210101T000000Z/pool/main/h/hello/hello_1.0-1_amd64.deb"
                .to_string(),
            b"hello world".to_vec(),
        );
        let addr = spawn_tree_server(files);

        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let config = Config {
            snapshot_url: format!("http://{}", addr),
            ftp_url: format!("http://{}/ftp", addr),
            retry_attempts: 2,
            retry_backoff_secs: 0,
            resume_retry_attempts: 2,
            resume_retry_backoff_secs: 0,
            ..Config::default()
        };
        let engine = DownloadEngine::new(&config).unwrap();
        let job = test_job();
        let cancel = AtomicBool::new(false);
        mirror_timestamp(
            &config,
            &store,
            &engine,
            &job,
            "debian",
            "20210101T000000Z",
            &cancel,
        )
        .await
        .unwrap();

        // the index file and the artifact are mirrored, content-addressed
        assert!(store.has(HELLO_SHA));
        let deb = dir
            .path()
            .join("archive/debian/20210101T000000Z/pool/main/h/hello/hello_1.0-1_amd64.deb");
        assert_eq!(std::fs::read(&deb).unwrap(), b"hello world");
        let index = dir
            .path()
            .join("archive/debian/20210101T000000Z/dists/unstable/main/binary-amd64/Packages.gz");
        assert!(index.exists());
        let (records, errors) =
            parser::load_index(&index, PackageKind::Binary).unwrap();
        assert_eq!(errors, 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sha256, HELLO_SHA);
        // the check pass accepts the mirrored state
        check_blobs(&store, &records).unwrap();
    }

    #[test]
    fn test_check_blobs_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        std::fs::write(store.blob_path(HELLO_SHA), b"tampered").unwrap();
        let input = format!(
            "Package: hello\nVersion: 1.0-1\nArchitecture: amd64\n\
             Filename: pool/main/h/hello/hello_1.0-1_amd64.deb\nSize: 11\nSHA256: {}\n",
            HELLO_SHA
        );
        let (records, _) = parser::parse_index(PackageKind::Binary, &input, "test");
        let err = check_blobs(&store, &records).unwrap_err();
        assert!(matches!(err, SnapshotError::Store { .. }));
    }

    #[test]
    fn test_check_blobs_missing_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let input = "Package: hello\nVersion: 1.0-1\nArchitecture: amd64\n\
                     Filename: pool/main/h/hello/hello_1.0-1_amd64.deb\nSize: 11\nSHA256: ffff\n";
        let (records, _) = parser::parse_index(PackageKind::Binary, input, "test");
        check_blobs(&store, &records).unwrap();
    }
}
