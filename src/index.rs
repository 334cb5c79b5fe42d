//! Temporal indexer: folds the observations of one archive timestamp into
//! the relational index, maintaining per-(hash, location) timestamp ranges.

use std::collections::BTreeSet;

use faster_hex::hex_string;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sqlx::PgPool;

use crate::errors::{Result, SnapshotError};
use crate::parser::{PackageKind, PackageRecord};
use crate::timestamps::Timeline;

/// Inclusive `[begin, end]` presence interval over an archive's enumerated
/// timestamps. Stored as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct TsRange {
    pub begin: String,
    pub end: String,
}

impl TsRange {
    pub fn point(t: &str) -> TsRange {
        TsRange {
            begin: t.to_string(),
            end: t.to_string(),
        }
    }

    pub fn covers(&self, t: &str) -> bool {
        self.begin.as_str() <= t && t <= self.end.as_str()
    }
}

impl From<(String, String)> for TsRange {
    fn from((begin, end): (String, String)) -> Self {
        TsRange { begin, end }
    }
}

impl From<TsRange> for (String, String) {
    fn from(r: TsRange) -> Self {
        (r.begin, r.end)
    }
}

pub fn ranges_from_json(value: &serde_json::Value) -> Result<Vec<TsRange>> {
    serde_json::from_value(value.clone())
        .map_err(|e| SnapshotError::parse("timestamp_ranges", e))
}

pub fn ranges_to_json(ranges: &[TsRange]) -> serde_json::Value {
    serde_json::to_value(ranges).unwrap_or_else(|_| serde_json::Value::Array(Vec::new()))
}

/// Fold a new observation timestamp into a canonical range sequence.
///
/// The result stays canonical: strictly increasing, non-overlapping, with no
/// two adjacent ranges contiguous on the archive timeline. Folding the same
/// set of timestamps in any order yields the same final sequence.
pub fn merge_ranges(ranges: &[TsRange], t: &str, timeline: &Timeline) -> Vec<TsRange> {
    let mut out: Vec<TsRange> = ranges.to_vec();
    let prev = timeline.prev(t);
    let mut placed = false;
    let mut i = 0;
    while i < out.len() {
        if out[i].covers(t) {
            // already covered
            placed = true;
            break;
        }
        if prev == Some(out[i].end.as_str()) {
            // extend this range up to the new timestamp; collapse with the
            // following range when the extension meets it
            out[i].end = t.to_string();
            if i + 1 < out.len() && out[i + 1].begin == t {
                out[i].end = out[i + 1].end.clone();
                out.remove(i + 1);
            }
            placed = true;
            break;
        }
        if t < out[i].begin.as_str() {
            out.insert(i, TsRange::point(t));
            placed = true;
            break;
        }
        i += 1;
    }
    if !placed {
        out.push(TsRange::point(t));
    }
    // A filler ingestion can close a gap between two existing ranges; merge
    // neighbors that became archive-contiguous.
    let mut i = 0;
    while i + 1 < out.len() {
        if timeline.next(out[i].end.as_str()) == Some(out[i + 1].begin.as_str()) {
            out[i].end = out[i + 1].end.clone();
            out.remove(i + 1);
        } else {
            i += 1;
        }
    }

    out
}

/// All archive timestamps covered by a range sequence.
pub fn coverage(ranges: &[TsRange], timeline: &Timeline) -> BTreeSet<String> {
    timeline
        .values()
        .iter()
        .filter(|t| ranges.iter().any(|r| r.covers(t)))
        .cloned()
        .collect()
}

/// Metadata path whose SHA-1 marks one fully folded index file.
pub fn repodata_path(
    archive: &str,
    timestamp: &str,
    suite: &str,
    component: &str,
    arch: &str,
) -> String {
    let index = if arch == "source" {
        "source/Sources.gz".to_string()
    } else {
        format!("binary-{}/Packages.gz", arch)
    };

    format!(
        "archive/{}/{}/dists/{}/{}/{}",
        archive, timestamp, suite, component, index
    )
}

pub fn repodata_id(path: &str) -> String {
    hex_string(&Sha1::digest(path.as_bytes()))
}

/// Collected observations of one timestamp, keyed for idempotent upserts.
#[derive(Debug, Default)]
pub struct Observations {
    pub hashes: BTreeSet<String>,
    /// (sha256, name, size, path)
    pub files: BTreeSet<(String, String, i64, String)>,
    /// (sha256, suite, component)
    pub locations: BTreeSet<(String, String, String)>,
    /// (name, version, sha256)
    pub srcpkgs: BTreeSet<(String, String, String)>,
    /// (name, version, sha256, architecture)
    pub binpkgs: BTreeSet<(String, String, String, String)>,
    pub architectures: BTreeSet<String>,
    /// repodata ids of the index files folded into this timestamp
    pub markers: BTreeSet<String>,
}

impl Observations {
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty() && self.markers.is_empty()
    }

    pub fn add_records(&mut self, records: &[PackageRecord], suite: &str, component: &str) {
        for record in records {
            self.hashes.insert(record.sha256.clone());
            self.files.insert((
                record.sha256.clone(),
                record.filename.clone(),
                record.size as i64,
                record.path.clone(),
            ));
            self.locations.insert((
                record.sha256.clone(),
                suite.to_string(),
                component.to_string(),
            ));
            match record.kind {
                PackageKind::Source => {
                    self.srcpkgs.insert((
                        record.name.clone(),
                        record.version.clone(),
                        record.sha256.clone(),
                    ));
                }
                PackageKind::Binary => {
                    self.architectures.insert(record.architecture.clone());
                    self.binpkgs.insert((
                        record.name.clone(),
                        record.version.clone(),
                        record.sha256.clone(),
                        record.architecture.clone(),
                    ));
                }
            }
        }
    }
}

pub async fn is_provisioned(pool: &PgPool, id: &str) -> Result<bool> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM repodata WHERE id = $1)")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|e| SnapshotError::index("repodata", e))
}

/// Persist the archive's enumerated catalog and return the timeline the
/// range merge consults. `prev(T)`/`next(T)` are defined against every
/// timestamp ever enumerated for the archive, not only the folded ones, so
/// folding T1 then T3 while T2 exists upstream leaves the gap open until T2
/// itself is folded.
pub async fn register_timestamps(
    pool: &PgPool,
    archive: &str,
    enumerated: &[String],
) -> Result<Timeline> {
    let dbe = |e: sqlx::Error| SnapshotError::Index {
        scope: archive.to_string(),
        message: e.to_string(),
    };
    let mut tx = pool.begin().await.map_err(dbe)?;
    sqlx::query("INSERT INTO archives (name) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(archive)
        .execute(&mut *tx)
        .await
        .map_err(dbe)?;
    for timestamp in enumerated {
        sqlx::query("INSERT INTO timestamps (value) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
        sqlx::query(
            "INSERT INTO archives_timestamps (archive_name, timestamp_value) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(archive)
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .map_err(dbe)?;
    }
    // prior runs may have enumerated timestamps this one did not
    let known: Vec<String> = sqlx::query_scalar(
        "SELECT timestamp_value FROM archives_timestamps WHERE archive_name = $1",
    )
    .bind(archive)
    .fetch_all(&mut *tx)
    .await
    .map_err(dbe)?;
    tx.commit().await.map_err(dbe)?;

    Ok(Timeline::new(known))
}

/// Fold one timestamp's observations into the index as a single
/// transaction. Reference dimensions first, then hashes and files, then
/// package associations, then the per-location range merge, and finally the
/// ingestion markers. `timeline` is the archive's enumerated catalog from
/// `register_timestamps` and must contain `timestamp`.
pub async fn provision_timestamp(
    pool: &PgPool,
    archive: &str,
    timestamp: &str,
    timeline: &Timeline,
    suites: &[String],
    components: &[String],
    arches: &[String],
    obs: &Observations,
) -> Result<()> {
    let scope = format!("{}/{}", archive, timestamp);
    let dbe = |e: sqlx::Error| SnapshotError::Index {
        scope: scope.clone(),
        message: e.to_string(),
    };
    info!("provisioning index for timestamp: {}", timestamp);
    let mut tx = pool.begin().await.map_err(dbe)?;

    sqlx::query("INSERT INTO archives (name) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(archive)
        .execute(&mut *tx)
        .await
        .map_err(dbe)?;
    sqlx::query("INSERT INTO timestamps (value) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .map_err(dbe)?;
    sqlx::query(
        "INSERT INTO archives_timestamps (archive_name, timestamp_value) VALUES ($1, $2)
         ON CONFLICT DO NOTHING",
    )
    .bind(archive)
    .bind(timestamp)
    .execute(&mut *tx)
    .await
    .map_err(dbe)?;
    for suite in suites {
        sqlx::query("INSERT INTO suites (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(suite)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
    }
    for component in components {
        sqlx::query("INSERT INTO components (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(component)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
    }
    // "all" shows up inside non-all Packages indices, register it always
    let mut all_arches: BTreeSet<String> = arches.iter().cloned().collect();
    all_arches.extend(obs.architectures.iter().cloned());
    all_arches.insert("all".to_string());
    for arch in &all_arches {
        sqlx::query("INSERT INTO architectures (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(arch)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
    }

    debug!("{}: committing {} hashes", scope, obs.hashes.len());
    for sha256 in &obs.hashes {
        sqlx::query("INSERT INTO hashes (sha256) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(sha256)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
    }
    debug!("{}: committing {} files", scope, obs.files.len());
    for (sha256, name, size, path) in &obs.files {
        sqlx::query(
            "INSERT INTO files (sha256, name, size, path) VALUES ($1, $2, $3, $4)
             ON CONFLICT DO NOTHING",
        )
        .bind(sha256)
        .bind(name)
        .bind(size)
        .bind(path)
        .execute(&mut *tx)
        .await
        .map_err(dbe)?;
    }

    for (name, version, sha256) in &obs.srcpkgs {
        sqlx::query("INSERT INTO srcpkg (name, version) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(name)
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
        sqlx::query(
            "INSERT INTO srcpkg_files (srcpkg_name, srcpkg_version, sha256)
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(name)
        .bind(version)
        .bind(sha256)
        .execute(&mut *tx)
        .await
        .map_err(dbe)?;
    }
    for (name, version, sha256, arch) in &obs.binpkgs {
        sqlx::query("INSERT INTO binpkg (name, version) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(name)
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
        sqlx::query(
            "INSERT INTO binpkg_files (binpkg_name, binpkg_version, sha256, architecture)
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
        )
        .bind(name)
        .bind(version)
        .bind(sha256)
        .bind(arch)
        .execute(&mut *tx)
        .await
        .map_err(dbe)?;
    }

    debug!("{}: merging {} hash locations", scope, obs.locations.len());
    for (sha256, suite, component) in &obs.locations {
        let existing: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT timestamp_ranges FROM hashes_locations
             WHERE sha256 = $1 AND archive_name = $2 AND suite_name = $3 AND component_name = $4
             FOR UPDATE",
        )
        .bind(sha256)
        .bind(archive)
        .bind(suite)
        .bind(component)
        .fetch_optional(&mut *tx)
        .await
        .map_err(dbe)?;
        match existing {
            None => {
                let ranges = ranges_to_json(&[TsRange::point(timestamp)]);
                sqlx::query(
                    "INSERT INTO hashes_locations
                     (sha256, archive_name, suite_name, component_name, timestamp_ranges)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(sha256)
                .bind(archive)
                .bind(suite)
                .bind(component)
                .bind(ranges)
                .execute(&mut *tx)
                .await
                .map_err(dbe)?;
            }
            Some(value) => {
                let current = ranges_from_json(&value)?;
                let merged = merge_ranges(&current, timestamp, timeline);
                if merged != current {
                    sqlx::query(
                        "UPDATE hashes_locations SET timestamp_ranges = $5
                         WHERE sha256 = $1 AND archive_name = $2
                           AND suite_name = $3 AND component_name = $4",
                    )
                    .bind(sha256)
                    .bind(archive)
                    .bind(suite)
                    .bind(component)
                    .bind(ranges_to_json(&merged))
                    .execute(&mut *tx)
                    .await
                    .map_err(dbe)?;
                }
            }
        }
    }

    for marker in &obs.markers {
        sqlx::query("INSERT INTO repodata (id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(marker)
            .execute(&mut *tx)
            .await
            .map_err(dbe)?;
    }
    tx.commit().await.map_err(dbe)?;

    Ok(())
}

#[cfg(test)]
fn timeline4() -> Timeline {
    Timeline::new(vec![
        "20210101T000000Z".to_string(),
        "20210201T000000Z".to_string(),
        "20210301T000000Z".to_string(),
        "20210401T000000Z".to_string(),
    ])
}

#[cfg(test)]
fn rg(begin: &str, end: &str) -> TsRange {
    TsRange {
        begin: begin.to_string(),
        end: end.to_string(),
    }
}

#[test]
fn test_merge_first_observation() {
    let timeline = timeline4();
    let merged = merge_ranges(&[], "20210101T000000Z", &timeline);
    assert_eq!(merged, vec![rg("20210101T000000Z", "20210101T000000Z")]);
}

#[test]
fn test_merge_contiguous_extend() {
    let timeline = timeline4();
    let start = vec![rg("20210101T000000Z", "20210101T000000Z")];
    let merged = merge_ranges(&start, "20210201T000000Z", &timeline);
    assert_eq!(merged, vec![rg("20210101T000000Z", "20210201T000000Z")]);
}

#[test]
fn test_merge_gap_then_fill() {
    let timeline = timeline4();
    let mut ranges = merge_ranges(&[], "20210101T000000Z", &timeline);
    ranges = merge_ranges(&ranges, "20210301T000000Z", &timeline);
    assert_eq!(
        ranges,
        vec![
            rg("20210101T000000Z", "20210101T000000Z"),
            rg("20210301T000000Z", "20210301T000000Z"),
        ]
    );
    ranges = merge_ranges(&ranges, "20210201T000000Z", &timeline);
    assert_eq!(ranges, vec![rg("20210101T000000Z", "20210301T000000Z")]);
}

#[test]
fn test_merge_already_covered() {
    let timeline = timeline4();
    let start = vec![rg("20210101T000000Z", "20210301T000000Z")];
    let merged = merge_ranges(&start, "20210201T000000Z", &timeline);
    assert_eq!(merged, start);
}

#[test]
fn test_merge_insert_before() {
    let timeline = timeline4();
    let start = vec![rg("20210301T000000Z", "20210401T000000Z")];
    let merged = merge_ranges(&start, "20210101T000000Z", &timeline);
    assert_eq!(
        merged,
        vec![
            rg("20210101T000000Z", "20210101T000000Z"),
            rg("20210301T000000Z", "20210401T000000Z"),
        ]
    );
}

#[test]
fn test_merge_backfill_joins_following_range() {
    let timeline = timeline4();
    let start = vec![rg("20210301T000000Z", "20210401T000000Z")];
    let merged = merge_ranges(&start, "20210201T000000Z", &timeline);
    assert_eq!(merged, vec![rg("20210201T000000Z", "20210401T000000Z")]);
}

#[test]
fn test_merge_adjacency_is_relative_to_enumerated_timeline() {
    let t1 = "20210101T000000Z";
    let t3 = "20210301T000000Z";
    // when the archive only ever enumerated T1 and T3 they are adjacent
    // and folding both yields one range
    let sparse = Timeline::new(vec![t1.to_string(), t3.to_string()]);
    let mut ranges = merge_ranges(&[], t1, &sparse);
    ranges = merge_ranges(&ranges, t3, &sparse);
    assert_eq!(ranges, vec![rg(t1, t3)]);
    // with T2 enumerated upstream (even if never folded), the same folds
    // must leave the gap open or T2 would be reported as covered
    let full = timeline4();
    let mut ranges = merge_ranges(&[], t1, &full);
    ranges = merge_ranges(&ranges, t3, &full);
    assert_eq!(ranges, vec![rg(t1, t1), rg(t3, t3)]);
}

#[test]
fn test_merge_idempotent() {
    let timeline = timeline4();
    let once = merge_ranges(&[], "20210201T000000Z", &timeline);
    let twice = merge_ranges(&once, "20210201T000000Z", &timeline);
    assert_eq!(once, twice);
}

#[test]
fn test_merge_order_independent() {
    let timeline = timeline4();
    let t1 = "20210101T000000Z";
    let t2 = "20210201T000000Z";
    let t4 = "20210401T000000Z";
    let orders = [
        [t1, t2, t4],
        [t1, t4, t2],
        [t2, t1, t4],
        [t2, t4, t1],
        [t4, t1, t2],
        [t4, t2, t1],
    ];
    let mut results = Vec::new();
    for order in &orders {
        let mut ranges = Vec::new();
        for t in order {
            ranges = merge_ranges(&ranges, t, &timeline);
        }
        results.push(ranges);
    }
    let expected = vec![rg(t1, t2), rg(t4, t4)];
    for result in &results {
        assert_eq!(result, &expected);
    }
}

#[test]
fn test_coverage_matches_observations() {
    let timeline = timeline4();
    let mut ranges = Vec::new();
    for t in ["20210101T000000Z", "20210201T000000Z", "20210401T000000Z"] {
        ranges = merge_ranges(&ranges, t, &timeline);
    }
    let covered = coverage(&ranges, &timeline);
    assert!(covered.contains("20210101T000000Z"));
    assert!(covered.contains("20210201T000000Z"));
    assert!(!covered.contains("20210301T000000Z"));
    assert!(covered.contains("20210401T000000Z"));
}

#[test]
fn test_ranges_json_roundtrip() {
    let ranges = vec![rg("20210101T000000Z", "20210201T000000Z")];
    let value = ranges_to_json(&ranges);
    assert_eq!(
        value,
        serde_json::json!([["20210101T000000Z", "20210201T000000Z"]])
    );
    assert_eq!(ranges_from_json(&value).unwrap(), ranges);
}

#[test]
fn test_repodata_id_stable() {
    let path = repodata_path("debian", "20210101T000000Z", "unstable", "main", "amd64");
    assert_eq!(
        path,
        "archive/debian/20210101T000000Z/dists/unstable/main/binary-amd64/Packages.gz"
    );
    assert_eq!(repodata_id(&path).len(), 40);
    assert_eq!(repodata_id(&path), repodata_id(&path));
    let source = repodata_path("debian", "20210101T000000Z", "unstable", "main", "source");
    assert!(source.ends_with("source/Sources.gz"));
}

#[test]
fn test_collect_observations() {
    use crate::parser::{parse_index, PackageKind};

    let input = "Package: foo\nVersion: 1.0-1\nArchitecture: amd64\n\
                 Filename: pool/main/f/foo/foo_1.0-1_amd64.deb\nSize: 10\nSHA256: aaaa\n\n\
                 Package: bar\nVersion: 2.0\nArchitecture: amd64\n\
                 Filename: pool/main/b/bar/bar_2.0_amd64.deb\nSize: 20\nSHA256: aaaa\n";
    let (records, _) = parse_index(PackageKind::Binary, input, "test");
    let mut obs = Observations::default();
    obs.add_records(&records, "unstable", "main");
    // same hash served under two names: one hash, two files, one location
    assert_eq!(obs.hashes.len(), 1);
    assert_eq!(obs.files.len(), 2);
    assert_eq!(obs.locations.len(), 1);
    assert_eq!(obs.binpkgs.len(), 2);
    assert!(obs.architectures.contains("amd64"));
}
