//! Read-only query engine over the temporal index, including the
//! build-reproducibility interval-cover computation.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use sqlx::PgPool;

use crate::db::{BinaryFileRow, BinaryLocationRow, FileRow, LocationRow};
use crate::errors::{Result, SnapshotError};
use crate::index::{ranges_from_json, TsRange};
use crate::parser::{blocks, Paragraph};

/// One location a file was seen at, with its presence ranges.
#[derive(Debug, Serialize)]
pub struct FileLocation {
    pub name: String,
    pub path: String,
    pub size: i64,
    pub archive_name: String,
    pub suite_name: String,
    pub component_name: String,
    pub timestamp_ranges: Vec<(String, String)>,
}

#[derive(Debug, Serialize)]
pub struct LocationCover {
    pub archive_name: String,
    pub suite_name: String,
    pub component_name: String,
    pub architecture: String,
    pub timestamps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildDep {
    pub name: String,
    pub version: String,
    pub architecture: Option<String>,
}

#[derive(Debug)]
pub enum BuildinfoOutcome {
    /// Packages with no usable row; reported with a 404.
    NotFound(Vec<String>),
    /// Per location, the representative endpoints at which every requested
    /// package was simultaneously present.
    Covers(Vec<LocationCover>),
}

pub struct QueryEngine {
    pool: PgPool,
}

fn dbe(e: sqlx::Error) -> SnapshotError {
    SnapshotError::index("query", e)
}

impl QueryEngine {
    pub fn new(pool: PgPool) -> QueryEngine {
        QueryEngine { pool }
    }

    /// Sorted timestamps enumerated for an archive.
    pub async fn archive_timestamps(&self, archive: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT timestamp_value FROM archives_timestamps
             WHERE archive_name = $1 ORDER BY timestamp_value",
        )
        .bind(archive)
        .fetch_all(&self.pool)
        .await
        .map_err(dbe)
    }

    pub async fn file_names(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT name FROM files ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(dbe)
    }

    /// Locations of one hash, dressed with the first file record sharing it.
    pub async fn file_info(&self, sha256: &str) -> Result<Vec<FileLocation>> {
        let file: Option<FileRow> = sqlx::query_as(
            "SELECT sha256, size, name, path FROM files WHERE sha256 = $1 ORDER BY id LIMIT 1",
        )
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await
        .map_err(dbe)?;
        let file = match file {
            Some(file) => file,
            None => return Ok(Vec::new()),
        };
        let locations: Vec<LocationRow> = sqlx::query_as(
            "SELECT archive_name, suite_name, component_name, timestamp_ranges
             FROM hashes_locations WHERE sha256 = $1
             ORDER BY archive_name, suite_name, component_name",
        )
        .bind(sha256)
        .fetch_all(&self.pool)
        .await
        .map_err(dbe)?;
        let mut result = Vec::new();
        for location in locations {
            let ranges = ranges_from_json(&location.timestamp_ranges)?;
            result.push(FileLocation {
                name: file.name.clone(),
                path: file.path.clone(),
                size: file.size,
                archive_name: location.archive_name,
                suite_name: location.suite_name,
                component_name: location.component_name,
                timestamp_ranges: ranges.into_iter().map(Into::into).collect(),
            });
        }

        Ok(result)
    }

    pub async fn file_infos(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<FileLocation>>> {
        let mut result = HashMap::new();
        for sha256 in hashes {
            result.insert(sha256.clone(), self.file_info(sha256).await?);
        }

        Ok(result)
    }

    pub async fn source_package_names(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT name FROM srcpkg ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(dbe)
    }

    pub async fn source_package_versions(&self, name: &str) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT version FROM srcpkg WHERE name = $1 ORDER BY version")
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .map_err(dbe)
    }

    pub async fn source_files(&self, name: &str, version: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT sha256 FROM srcpkg_files
             WHERE srcpkg_name = $1 AND srcpkg_version = $2 ORDER BY sha256",
        )
        .bind(name)
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(dbe)
    }

    pub async fn binary_versions(&self, name: &str) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT version FROM binpkg WHERE name = $1 ORDER BY version")
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .map_err(dbe)
    }

    pub async fn binary_files(&self, name: &str, version: &str) -> Result<Vec<BinaryFileRow>> {
        sqlx::query_as(
            "SELECT DISTINCT sha256, architecture FROM binpkg_files
             WHERE binpkg_name = $1 AND binpkg_version = $2 ORDER BY sha256",
        )
        .bind(name)
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(dbe)
    }

    /// Build-reproducibility query: per location, the maximal sets of
    /// timestamps at which every requested package was present, reduced to
    /// one representative endpoint per covered interval.
    pub async fn buildinfo(
        &self,
        deps: &[BuildDep],
        build_arch: &str,
        suite_filter: Option<&str>,
    ) -> Result<BuildinfoOutcome> {
        let mut first_ranges: BTreeMap<(String, String, String, String), Vec<TsRange>> =
            BTreeMap::new();
        let mut not_found = Vec::new();
        for dep in deps {
            let arch = dep.architecture.as_deref().unwrap_or(build_arch);
            let rows: Vec<BinaryLocationRow> = sqlx::query_as(
                "SELECT b.architecture, l.archive_name, l.suite_name, l.component_name,
                        l.timestamp_ranges
                 FROM binpkg_files b
                 JOIN hashes_locations l ON b.sha256 = l.sha256
                 WHERE b.binpkg_name = $1 AND b.binpkg_version = $2",
            )
            .bind(&dep.name)
            .bind(&dep.version)
            .fetch_all(&self.pool)
            .await
            .map_err(dbe)?;
            if rows.is_empty() {
                not_found.push(format!("{}:{}={}", dep.name, arch, dep.version));
                continue;
            }
            for row in rows {
                if row.architecture != "all" && row.architecture != arch {
                    not_found.push(format!("{}:{}={}", dep.name, arch, dep.version));
                    break;
                }
                if let Some(filter) = suite_filter {
                    if row.suite_name != filter {
                        continue;
                    }
                }
                let ranges = ranges_from_json(&row.timestamp_ranges)?;
                if let Some(first) = ranges.into_iter().next() {
                    first_ranges
                        .entry((
                            row.archive_name,
                            row.suite_name,
                            row.component_name,
                            arch.to_string(),
                        ))
                        .or_default()
                        .push(first);
                }
            }
        }
        if !not_found.is_empty() {
            not_found.sort();
            not_found.dedup();
            return Ok(BuildinfoOutcome::NotFound(not_found));
        }
        let mut covers = Vec::new();
        for ((archive_name, suite_name, component_name, architecture), mut ranges) in first_ranges
        {
            covers.push(LocationCover {
                archive_name,
                suite_name,
                component_name,
                architecture,
                timestamps: interval_endpoints(&mut ranges),
            });
        }

        Ok(BuildinfoOutcome::Covers(covers))
    }
}

/// Greedy interval-endpoint selection (interval scheduling): sort by
/// endpoint, then emit each endpoint whose range starts after the last
/// emitted one. Every emitted timestamp lies in all of the input ranges
/// that cover its interval.
pub fn interval_endpoints(ranges: &mut [TsRange]) -> Vec<String> {
    ranges.sort_by(|a, b| a.end.cmp(&b.end));
    let mut endpoints = Vec::new();
    let mut last = "19700101T000000Z".to_string();
    for range in ranges.iter() {
        if last.as_str() >= range.begin.as_str() {
            continue;
        }
        last = range.end.clone();
        endpoints.push(last.clone());
    }

    endpoints
}

/// Extract the installed build dependencies and the build architecture from
/// an uploaded buildinfo manifest.
pub fn parse_buildinfo(text: &str) -> Result<(Vec<BuildDep>, String)> {
    const ORIGIN: &str = "buildinfo";
    for block in blocks(text) {
        let paragraph = match Paragraph::parse(block) {
            Ok(p) => p,
            Err(e) => return Err(SnapshotError::parse(ORIGIN, e)),
        };
        let installed = match paragraph.get("Installed-Build-Depends") {
            Some(installed) => installed,
            None => continue,
        };
        let build_arch = paragraph.required("Build-Architecture", ORIGIN)?.to_string();
        let mut deps = Vec::new();
        for entry in installed.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            deps.push(parse_dep(entry)?);
        }
        return Ok((deps, build_arch));
    }

    Err(SnapshotError::parse(
        ORIGIN,
        "no Installed-Build-Depends paragraph",
    ))
}

/// One relation entry: `name (= version)` or `name:arch (= version)`.
fn parse_dep(entry: &str) -> Result<BuildDep> {
    const ORIGIN: &str = "buildinfo";
    let (name_part, version_part) = entry
        .split_once(char::is_whitespace)
        .ok_or_else(|| SnapshotError::parse(ORIGIN, format!("missing version in `{}`", entry)))?;
    let version = version_part
        .trim()
        .strip_prefix("(=")
        .and_then(|v| v.strip_suffix(')'))
        .map(str::trim)
        .ok_or_else(|| {
            SnapshotError::parse(ORIGIN, format!("malformed version relation in `{}`", entry))
        })?;
    let (name, architecture) = match name_part.split_once(':') {
        Some((name, arch)) => (name, Some(arch.to_string())),
        None => (name_part, None),
    };

    Ok(BuildDep {
        name: name.to_string(),
        version: version.to_string(),
        architecture,
    })
}

#[cfg(test)]
fn rg(begin: &str, end: &str) -> TsRange {
    TsRange {
        begin: begin.to_string(),
        end: end.to_string(),
    }
}

#[test]
fn test_interval_endpoints_shared_coverage() {
    // a present over [T1,T3], b over [T2,T4]: T3 is the earliest endpoint
    // inside both coverages
    let mut ranges = vec![
        rg("20210101T000000Z", "20210301T000000Z"),
        rg("20210201T000000Z", "20210401T000000Z"),
    ];
    assert_eq!(interval_endpoints(&mut ranges), vec!["20210301T000000Z"]);
}

#[test]
fn test_interval_endpoints_disjoint() {
    let mut ranges = vec![
        rg("20210301T000000Z", "20210401T000000Z"),
        rg("20210101T000000Z", "20210101T000000Z"),
    ];
    assert_eq!(
        interval_endpoints(&mut ranges),
        vec!["20210101T000000Z", "20210401T000000Z"]
    );
}

#[test]
fn test_interval_endpoints_empty() {
    let mut ranges = Vec::new();
    assert!(interval_endpoints(&mut ranges).is_empty());
}

#[test]
fn test_parse_buildinfo() {
    let text = "Format: 1.0\nBuild-Architecture: amd64\n\
                Installed-Build-Depends:\n autoconf (= 2.69-14),\n \
                gcc:amd64 (= 4:10.2.1-1),\n make (= 4.3-4.1)\n";
    let (deps, arch) = parse_buildinfo(text).unwrap();
    assert_eq!(arch, "amd64");
    assert_eq!(deps.len(), 3);
    assert_eq!(deps[0].name, "autoconf");
    assert_eq!(deps[0].version, "2.69-14");
    assert_eq!(deps[0].architecture, None);
    assert_eq!(deps[1].name, "gcc");
    assert_eq!(deps[1].architecture.as_deref(), Some("amd64"));
    assert_eq!(deps[1].version, "4:10.2.1-1");
}

#[test]
fn test_parse_buildinfo_rejects_missing_paragraph() {
    let err = parse_buildinfo("Format: 1.0\n").unwrap_err();
    assert!(matches!(err, SnapshotError::Parse { .. }));
}
