//! Content-addressed object store: `by-hash/SHA256/<hex>` blobs plus a
//! path tree of relative symlinks mirroring the upstream layout.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use faster_hex::hex_string;
use log::debug;
use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;

use crate::errors::{Result, SnapshotError};

const BY_HASH: &str = "by-hash/SHA256";

/// Calculate the SHA256 checksum of the given stream
pub fn sha256sum<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)?;

    Ok(hex_string(&hasher.finalize()))
}

pub fn sha256sum_path<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let f = File::open(path.as_ref())?;
    sha256sum(f)
}

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open the store rooted at `root`, creating the blob namespace.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<ObjectStore> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            return Err(SnapshotError::Store {
                path: root.display().to_string(),
                message: "mirror root does not exist".to_string(),
            });
        }
        std::fs::create_dir_all(root.join(BY_HASH)).map_err(|e| SnapshotError::store(&root, e))?;

        Ok(ObjectStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical location of a blob.
    pub fn blob_path(&self, sha256: &str) -> PathBuf {
        self.root.join(BY_HASH).join(sha256)
    }

    pub fn has(&self, sha256: &str) -> bool {
        self.blob_path(sha256).exists()
    }

    /// The deterministic `.part` sibling used by resumable downloads.
    pub fn part_path(&self, sha256: &str) -> PathBuf {
        self.root.join(BY_HASH).join(format!("{}.part", sha256))
    }

    /// A unique temp sibling inside the blob namespace, for downloads whose
    /// hash is not known in advance. The file stays on disk; `commit`
    /// renames it away once the hash is computed.
    pub fn stage_path(&self) -> Result<PathBuf> {
        let dir = self.root.join(BY_HASH);
        let temp = tempfile::Builder::new()
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|e| SnapshotError::store(&dir, e))?;
        temp.into_temp_path().keep().map_err(|e| SnapshotError::Store {
            path: dir.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Verify and commit a finished `.part` file: hash it, compare against
    /// `expected` when given, fsync, and atomically rename into `by-hash`.
    /// Returns the blob's hash. The part file is removed on mismatch unless
    /// `keep_part` is set.
    pub async fn commit(
        &self,
        part: PathBuf,
        expected: Option<&str>,
        keep_part: bool,
    ) -> Result<String> {
        let hashed = part.clone();
        let computed = spawn_blocking(move || -> std::io::Result<String> {
            let f = File::open(&hashed)?;
            let sum = sha256sum(&f)?;
            f.sync_all()?;
            Ok(sum)
        })
        .await
        .map_err(|e| SnapshotError::Store {
            path: part.display().to_string(),
            message: e.to_string(),
        })?
        .map_err(|e| SnapshotError::store(&part, e))?;
        if let Some(expected) = expected {
            if computed != expected {
                if !keep_part {
                    tokio::fs::remove_file(&part)
                        .await
                        .map_err(|e| SnapshotError::store(&part, e))?;
                }
                return Err(SnapshotError::HashMismatch {
                    url: part.display().to_string(),
                    computed,
                    expected: expected.to_string(),
                });
            }
        }
        let target = self.blob_path(&computed);
        if target.exists() {
            // concurrent writer won the race; the bytes are identical
            tokio::fs::remove_file(&part).await.ok();
            return Ok(computed);
        }
        tokio::fs::rename(&part, &target)
            .await
            .map_err(|e| SnapshotError::store(&target, e))?;
        debug!("committed blob {}", computed);

        Ok(computed)
    }

    /// Idempotently create the path-tree symlink `rel_path` -> blob. An
    /// existing link pointing elsewhere is replaced.
    pub fn link(&self, rel_path: &str, sha256: &str) -> Result<()> {
        let link = self.root.join(rel_path.trim_start_matches('/'));
        let target = self.blob_path(sha256);
        let parent = match link.parent() {
            Some(p) => p.to_path_buf(),
            None => self.root.clone(),
        };
        let rel_target = relative_to(&parent, &target);
        match std::fs::read_link(&link) {
            Ok(existing) if existing == rel_target => return Ok(()),
            Ok(_) => {
                std::fs::remove_file(&link).map_err(|e| SnapshotError::store(&link, e))?;
            }
            Err(_) => (),
        }
        std::fs::create_dir_all(&parent).map_err(|e| SnapshotError::store(&parent, e))?;
        std::os::unix::fs::symlink(&rel_target, &link).map_err(|e| SnapshotError::store(&link, e))?;

        Ok(())
    }

    /// Whether the path-tree entry for `rel_path` already resolves to an
    /// existing blob.
    pub fn linked(&self, rel_path: &str) -> bool {
        let link = self.root.join(rel_path.trim_start_matches('/'));
        link.exists()
    }

    /// Re-hash a blob and compare against its key (content integrity check).
    pub fn verify(&self, sha256: &str) -> Result<bool> {
        let path = self.blob_path(sha256);
        let sum = sha256sum_path(&path).map_err(|e| SnapshotError::store(&path, e))?;

        Ok(sum == sha256)
    }

    /// Remove leftover `.part` staging files from interrupted transfers.
    pub fn clean_parts(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in walkdir::WalkDir::new(self.root.join(BY_HASH))
            .min_depth(1)
            .max_depth(1)
        {
            let entry = entry.map_err(|e| SnapshotError::Store {
                path: self.root.join(BY_HASH).display().to_string(),
                message: e.to_string(),
            })?;
            if entry.file_name().to_string_lossy().ends_with(".part") {
                std::fs::remove_file(entry.path())
                    .map_err(|e| SnapshotError::store(entry.path(), e))?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Relative path from directory `from` to `target`, both under the same
/// root. Used so the path tree stays valid when the mirror is relocated.
fn relative_to(from: &Path, target: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let target: Vec<Component> = target.components().collect();
    let mut common = 0;
    while common < from.len() && common < target.len() && from[common] == target[common] {
        common += 1;
    }
    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for c in &target[common..] {
        rel.push(c);
    }

    rel
}

#[cfg(test)]
fn test_store() -> (tempfile::TempDir, ObjectStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path()).unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_commit_and_link() {
    let (dir, store) = test_store();
    let part = store.stage_path().unwrap();
    tokio::fs::write(&part, b"hello world").await.unwrap();
    let hash = store.commit(part, None, false).await.unwrap();
    assert_eq!(
        hash,
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
    assert!(store.has(&hash));

    store
        .link("archive/debian/20210101T000000Z/pool/main/h/hello.txt", &hash)
        .unwrap();
    let link = dir
        .path()
        .join("archive/debian/20210101T000000Z/pool/main/h/hello.txt");
    let content = std::fs::read(&link).unwrap();
    assert_eq!(content, b"hello world");
    let target = std::fs::read_link(&link).unwrap();
    assert!(target.is_relative());
    // idempotent
    store
        .link("archive/debian/20210101T000000Z/pool/main/h/hello.txt", &hash)
        .unwrap();
    assert!(store.verify(&hash).unwrap());
}

#[tokio::test]
async fn test_commit_mismatch() {
    let (_dir, store) = test_store();
    let part = store.stage_path().unwrap();
    tokio::fs::write(&part, b"corrupted").await.unwrap();
    let err = store
        .commit(part.clone(), Some("00000000"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SnapshotError::HashMismatch { .. }));
    assert!(!part.exists());
}

#[tokio::test]
async fn test_commit_mismatch_keeps_part() {
    let (_dir, store) = test_store();
    let part = store.part_path("deadbeef");
    tokio::fs::write(&part, b"corrupted").await.unwrap();
    let err = store
        .commit(part.clone(), Some("00000000"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, SnapshotError::HashMismatch { .. }));
    assert!(part.exists());
}

#[tokio::test]
async fn test_clean_parts() {
    let (_dir, store) = test_store();
    let part = store.part_path("deadbeef");
    tokio::fs::write(&part, b"partial").await.unwrap();
    let blob = store.stage_path().unwrap();
    tokio::fs::write(&blob, b"hello world").await.unwrap();
    let hash = store.commit(blob, None, false).await.unwrap();
    assert_eq!(store.clean_parts().unwrap(), 1);
    assert!(!part.exists());
    assert!(store.has(&hash));
}

#[test]
fn test_relative_to() {
    assert_eq!(
        relative_to(
            Path::new("/m/archive/debian/ts/pool"),
            Path::new("/m/by-hash/SHA256/aa")
        ),
        Path::new("../../../../by-hash/SHA256/aa")
    );
    assert_eq!(
        relative_to(Path::new("/m"), Path::new("/m/by-hash/SHA256/aa")),
        Path::new("by-hash/SHA256/aa")
    );
}
