//! Paragraph parser for APT index files (`Packages`, `Sources`, buildinfo
//! manifests) producing typed package records.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use log::warn;
use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char, one_of, space0},
    combinator::all_consuming,
    multi::{many0, many1},
    sequence::{preceded, terminated},
    IResult,
};

use crate::errors::{Result, SnapshotError};

#[inline]
fn field_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ':' && c != '\n' && !c.is_whitespace())(input)
}

#[inline]
fn separator(input: &str) -> IResult<&str, ()> {
    let (input, _) = char(':')(input)?;
    let (input, _) = space0(input)?;

    Ok((input, ()))
}

#[inline]
fn line_rest(input: &str) -> IResult<&str, &str> {
    terminated(take_while(|c| c != '\n'), char('\n'))(input)
}

/// A value line folded onto the previous field (starts with a space or tab).
#[inline]
fn continuation(input: &str) -> IResult<&str, &str> {
    preceded(one_of(" \t"), line_rest)(input)
}

fn field(input: &str) -> IResult<&str, (&str, String)> {
    let (input, name) = field_name(input)?;
    let (input, _) = separator(input)?;
    let (input, first) = line_rest(input)?;
    let (input, more) = many0(continuation)(input)?;
    let mut value = first.trim_end().to_string();
    for cont in more {
        if !value.is_empty() {
            value.push('\n');
        }
        value.push_str(cont.trim());
    }

    Ok((input, (name, value)))
}

fn fields(input: &str) -> IResult<&str, Vec<(&str, String)>> {
    all_consuming(many1(field))(input)
}

/// One parsed control paragraph.
#[derive(Debug, Default)]
pub struct Paragraph {
    fields: HashMap<String, String>,
}

impl Paragraph {
    pub fn parse(block: &str) -> std::result::Result<Paragraph, String> {
        let mut normalized = block.trim_matches('\n').to_string();
        normalized.push('\n');
        let (_, parsed) = fields(&normalized).map_err(|e| e.to_string())?;
        let mut map = HashMap::new();
        for (name, value) in parsed {
            map.insert(name.to_string(), value);
        }

        Ok(Paragraph { fields: map })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn required(&self, name: &str, origin: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| SnapshotError::parse(origin, format!("missing `{}` field", name)))
    }
}

/// Split an index file into paragraph blocks (separated by blank lines).
pub fn blocks(input: &str) -> impl Iterator<Item = &str> {
    input.split("\n\n").map(str::trim).filter(|b| !b.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageKind {
    Source,
    Binary,
}

/// One (file, package) observation from an index paragraph.
#[derive(Debug, Clone)]
pub struct PackageRecord {
    pub kind: PackageKind,
    pub name: String,
    pub version: String,
    pub architecture: String,
    /// Upstream directory, with a leading slash.
    pub path: String,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
}

fn parse_size(value: &str, origin: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|e| SnapshotError::parse(origin, format!("bad size `{}`: {}", value, e)))
}

/// Records of a `Sources` paragraph: one per `Checksums-Sha256` entry.
pub fn source_records(paragraph: &Paragraph, origin: &str) -> Result<Vec<PackageRecord>> {
    let name = paragraph.required("Package", origin)?;
    let version = paragraph.required("Version", origin)?;
    let directory = paragraph.required("Directory", origin)?;
    let checksums = paragraph.required("Checksums-Sha256", origin)?;
    let mut records = Vec::new();
    for entry in checksums.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = entry.split_whitespace();
        let (sha256, size, filename) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(s), Some(f)) => (h, s, f),
            _ => {
                return Err(SnapshotError::parse(
                    origin,
                    format!("malformed Checksums-Sha256 entry `{}`", entry),
                ))
            }
        };
        records.push(PackageRecord {
            kind: PackageKind::Source,
            name: name.to_string(),
            version: version.to_string(),
            architecture: "source".to_string(),
            path: format!("/{}", directory),
            filename: filename.to_string(),
            size: parse_size(size, origin)?,
            sha256: sha256.to_string(),
        });
    }

    Ok(records)
}

/// Record of a `Packages` paragraph.
pub fn binary_record(paragraph: &Paragraph, origin: &str) -> Result<PackageRecord> {
    let name = paragraph.required("Package", origin)?;
    let version = paragraph.required("Version", origin)?;
    let architecture = paragraph.required("Architecture", origin)?;
    let filename = paragraph.required("Filename", origin)?;
    let size = parse_size(paragraph.required("Size", origin)?, origin)?;
    let sha256 = paragraph.required("SHA256", origin)?;
    let (path, basename) = match filename.rsplit_once('/') {
        Some((dir, base)) => (format!("/{}", dir), base),
        None => ("/".to_string(), filename),
    };

    Ok(PackageRecord {
        kind: PackageKind::Binary,
        name: name.to_string(),
        version: version.to_string(),
        architecture: architecture.to_string(),
        path,
        filename: basename.to_string(),
        size,
        sha256: sha256.to_string(),
    })
}

/// Parse a whole index text. Unparseable paragraphs are logged and skipped;
/// the error count is reported back but never aborts ingest.
pub fn parse_index(kind: PackageKind, input: &str, origin: &str) -> (Vec<PackageRecord>, usize) {
    let mut records = Vec::new();
    let mut errors = 0;
    for block in blocks(input) {
        let paragraph = match Paragraph::parse(block) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: skipping malformed paragraph: {}", origin, e);
                errors += 1;
                continue;
            }
        };
        let result = match kind {
            PackageKind::Source => source_records(&paragraph, origin),
            PackageKind::Binary => binary_record(&paragraph, origin).map(|r| vec![r]),
        };
        match result {
            Ok(mut recs) => records.append(&mut recs),
            Err(e) => {
                warn!("skipping paragraph: {}", e);
                errors += 1;
            }
        }
    }

    (records, errors)
}

/// Read a gzip-compressed index file into text.
pub fn read_gz<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let f = std::fs::File::open(path.as_ref())?;
    let mut decoder = GzDecoder::new(f);
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Load and parse an on-disk `Packages.gz`/`Sources.gz` file.
pub fn load_index<P: AsRef<Path>>(
    path: P,
    kind: PackageKind,
) -> Result<(Vec<PackageRecord>, usize)> {
    let origin = path.as_ref().display().to_string();
    let text = read_gz(path.as_ref()).map_err(|e| SnapshotError::parse(&origin, e))?;

    Ok(parse_index(kind, &text, &origin))
}

#[test]
fn test_single_field() {
    let (rest, (name, value)) = field("Package: zsync\nVersion: 1\n").unwrap();
    assert_eq!(name, "Package");
    assert_eq!(value, "zsync");
    assert_eq!(rest, "Version: 1\n");
}

#[test]
fn test_continuation_field() {
    let input = "Checksums-Sha256:\n aaaa 12 foo_1.0.orig.tar.gz\n bbbb 4 foo_1.0-1.dsc\n";
    let (rest, (name, value)) = field(input).unwrap();
    assert_eq!(name, "Checksums-Sha256");
    assert_eq!(value, "aaaa 12 foo_1.0.orig.tar.gz\nbbbb 4 foo_1.0-1.dsc");
    assert!(rest.is_empty());
}

#[test]
fn test_paragraph() {
    let p = Paragraph::parse("Package: zsync\nVersion: 0.6.2-1\nArchitecture: amd64").unwrap();
    assert_eq!(p.get("Package"), Some("zsync"));
    assert_eq!(p.get("Version"), Some("0.6.2-1"));
    assert_eq!(p.get("Missing"), None);
}

#[test]
fn test_binary_record() {
    let p = Paragraph::parse(
        "Package: zsync\nVersion: 0.6.2-1\nArchitecture: amd64\n\
         Filename: pool/main/z/zsync/zsync_0.6.2-1_amd64.deb\nSize: 256\nSHA256: cafe",
    )
    .unwrap();
    let r = binary_record(&p, "test").unwrap();
    assert_eq!(r.kind, PackageKind::Binary);
    assert_eq!(r.name, "zsync");
    assert_eq!(r.path, "/pool/main/z/zsync");
    assert_eq!(r.filename, "zsync_0.6.2-1_amd64.deb");
    assert_eq!(r.size, 256);
    assert_eq!(r.sha256, "cafe");
}

#[test]
fn test_source_records() {
    let p = Paragraph::parse(
        "Package: foo\nVersion: 1.0-1\nDirectory: pool/main/f/foo\n\
         Checksums-Sha256:\n aaaa 12 foo_1.0.orig.tar.gz\n bbbb 4 foo_1.0-1.dsc",
    )
    .unwrap();
    let records = source_records(&p, "test").unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].architecture, "source");
    assert_eq!(records[0].path, "/pool/main/f/foo");
    assert_eq!(records[0].filename, "foo_1.0.orig.tar.gz");
    assert_eq!(records[0].size, 12);
    assert_eq!(records[0].sha256, "aaaa");
    assert_eq!(records[1].filename, "foo_1.0-1.dsc");
}

#[test]
fn test_parse_index_skips_bad_paragraphs() {
    let input = "Package: good\nVersion: 1\nArchitecture: amd64\n\
                 Filename: pool/main/g/good/good_1_amd64.deb\nSize: 1\nSHA256: aa\n\n\
                 Version: no-package-name\n\n\
                 Package: alsogood\nVersion: 2\nArchitecture: all\n\
                 Filename: pool/main/a/alsogood/alsogood_2_all.deb\nSize: 2\nSHA256: bb\n";
    let (records, errors) = parse_index(PackageKind::Binary, input, "test");
    assert_eq!(records.len(), 2);
    assert_eq!(errors, 1);
    assert_eq!(records[0].name, "good");
    assert_eq!(records[1].name, "alsogood");
}

#[test]
fn test_missing_required_field() {
    let p = Paragraph::parse("Package: foo\nVersion: 1.0-1").unwrap();
    let err = p.required("Directory", "test").unwrap_err();
    assert!(matches!(err, SnapshotError::Parse { .. }));
}
