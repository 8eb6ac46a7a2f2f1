//! Content-addressed blob storage for deployment assets: one file per MD5
//! under the broker's `files/` directory. Concurrent writers of the same
//! digest write identical bytes, so nothing locks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use conduit_structs::ConduitError;
use sqlx::SqlitePool;

use crate::{mailboxes, storage_err};

/// Anything older than this is collected regardless of references.
const MAX_ASSET_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
pub struct AssetStore {
    root: PathBuf,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StoreStats {
    pub file_count: i64,
    pub byte_size: i64,
}

/// Guard for using an untrusted digest as a file name.
pub fn is_valid_md5(md5: &str) -> bool {
    md5.len() == 32 && md5.chars().all(|c| c.is_ascii_hexdigit())
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, md5: &str) -> PathBuf {
        self.root.join(md5)
    }

    pub async fn ensure_root(&self) -> Result<(), ConduitError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(storage_err)
    }

    pub async fn exists(&self, md5: &str) -> bool {
        is_valid_md5(md5) && tokio::fs::try_exists(self.path_for(md5)).await.unwrap_or(false)
    }

    /// Store a blob under its claimed digest, then re-hash from disk. A
    /// mismatch removes the file and fails with the integrity kind.
    pub async fn put(&self, md5: &str, data: &[u8]) -> Result<(), ConduitError> {
        if !is_valid_md5(md5) {
            return Err(ConduitError::Parse);
        }
        self.ensure_root().await?;
        let path = self.path_for(md5);
        tokio::fs::write(&path, data).await.map_err(storage_err)?;
        self.verify(md5).await
    }

    /// Re-hash the stored file against its name, removing it on mismatch.
    pub async fn verify(&self, md5: &str) -> Result<(), ConduitError> {
        let path = self.path_for(md5);
        let hash_path = path.clone();
        let computed = tokio::task::spawn_blocking(move || {
            conduit_crypt::content::file_md5(&hash_path)
        })
        .await
        .map_err(storage_err)?
        .map_err(storage_err)?;
        if computed != md5 {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::warn!(error = %err, path = %path.display(), "failed to remove bad upload");
            }
            return Err(ConduitError::Integrity {
                expected: md5.to_string(),
                computed,
            });
        }
        Ok(())
    }

    /// Open a stored blob for reading.
    pub async fn open(&self, md5: &str) -> Result<tokio::fs::File, ConduitError> {
        if !is_valid_md5(md5) {
            return Err(ConduitError::not_found(format!("asset '{md5}'")));
        }
        match tokio::fs::File::open(self.path_for(md5)).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ConduitError::not_found(format!("asset '{md5}'")))
            }
            Err(err) => Err(storage_err(err)),
        }
    }

    pub async fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return stats;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    stats.file_count += 1;
                    stats.byte_size += meta.len() as i64;
                }
            }
        }
        stats
    }

    /// Collect every blob no undeleted message references, plus anything
    /// older than [`MAX_ASSET_AGE`] outright. Returns how many were removed.
    pub async fn gc(&self, pool: &SqlitePool) -> Result<usize, ConduitError> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(storage_err(err)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(storage_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let expired = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified
                    .elapsed()
                    .map(|age| age > MAX_ASSET_AGE)
                    .unwrap_or(false),
                Err(_) => false,
            };
            let pending = mailboxes::asset_pending(pool, &name).await?;
            if pending && !expired {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(asset = %name, expired, "asset collected");
                }
                Err(err) => {
                    tracing::warn!(error = %err, asset = %name, "failed to collect asset");
                }
            }
        }
        Ok(removed)
    }

    /// Run [`Self::gc`] hourly for the life of the process.
    pub fn spawn_janitor(&self, pool: SqlitePool) {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(GC_INTERVAL).await;
                if let Err(err) = store.gc(&pool).await {
                    tracing::error!(error = %err, "asset janitor error");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, deploys};

    #[tokio::test]
    async fn put_verifies_the_claimed_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path().join("files"));
        let md5 = conduit_crypt::content::md5_hex(b"payload");
        store.put(&md5, b"payload").await.expect("put");
        assert!(store.exists(&md5).await);
    }

    #[tokio::test]
    async fn integrity_mismatch_removes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path().join("files"));
        let wrong = conduit_crypt::content::md5_hex(b"something else");
        let err = store.put(&wrong, b"payload").await.unwrap_err();
        assert!(matches!(err, ConduitError::Integrity { .. }));
        assert!(!store.exists(&wrong).await);
    }

    #[tokio::test]
    async fn open_missing_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path().join("files"));
        let err = store
            .open("d41d8cd98f00b204e9800998ecf8427e")
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::NotFound(_)));
    }

    #[tokio::test]
    async fn rejects_digests_that_are_not_hex() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path().join("files"));
        assert!(!store.exists("../../etc/passwd").await);
        assert!(store.put("not-a-digest", b"x").await.is_err());
    }

    #[tokio::test]
    async fn gc_keeps_referenced_assets_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path().join("files"));
        let pool = db::open_memory().await.expect("db");
        crate::mailboxes::create(&pool, "alpha").await.expect("mailbox");

        let live = conduit_crypt::content::md5_hex(b"live");
        let orphan = conduit_crypt::content::md5_hex(b"orphan");
        store.put(&live, b"live").await.expect("put");
        store.put(&orphan, b"orphan").await.expect("put");

        let dep = deploys::create(&pool, "run()", &live, "", "ops").await.expect("dep");
        crate::mailboxes::enqueue(&pool, "alpha", &dep).await.expect("enqueue");

        let removed = store.gc(&pool).await.expect("gc");
        assert_eq!(removed, 1);
        assert!(store.exists(&live).await);
        assert!(!store.exists(&orphan).await);
    }

    #[tokio::test]
    async fn store_stats_count_files_and_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AssetStore::new(dir.path().join("files"));
        let md5 = conduit_crypt::content::md5_hex(b"12345");
        store.put(&md5, b"12345").await.expect("put");
        let stats = store.stats().await;
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.byte_size, 5);
    }
}
