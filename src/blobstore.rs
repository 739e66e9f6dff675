//! Content-addressed blob store for uploaded documents and OCR artifacts.
//!
//! The blob id is the SHA-256 of the bytes, so a repeated upload of the
//! same document lands on the same id and `put` is naturally idempotent.
//! Layout: `blobs/<first two hex chars>/<full hash>` with a `.meta`
//! sidecar holding media type and receipt time. Local filesystem only.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical::hex_encode;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("stored bytes do not match id {0}")]
    Corrupt(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Meta(String),
}

/// Media types the pipeline knows how to route.
const ACCEPTED_MEDIA: &[&str] = &[
    "application/xml",
    "text/xml",
    "application/pdf",
    "text/csv",
    "text/plain",
    "image/png",
    "image/jpeg",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    pub media_type: String,
    pub received_at: String,
    pub size: u64,
}

/// File-backed content-addressed store.
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: PathBuf) -> Result<Self, BlobError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store bytes, returning the content hash. Re-storing identical
    /// bytes returns the same id without rewriting.
    pub fn put(&self, bytes: &[u8], media_type: &str) -> Result<String, BlobError> {
        if !ACCEPTED_MEDIA.contains(&media_type) {
            return Err(BlobError::UnsupportedMedia(media_type.to_string()));
        }

        let id = hex_encode(&Sha256::digest(bytes));
        let path = self.blob_path(&id);

        if !path.exists() {
            fs::create_dir_all(path.parent().expect("blob path has parent"))?;
            // Write-then-rename so a crash never leaves a truncated blob
            // under its final name.
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;

            let meta = BlobMeta {
                media_type: media_type.to_string(),
                received_at: chrono::Utc::now().to_rfc3339(),
                size: bytes.len() as u64,
            };
            let meta_json =
                serde_json::to_string(&meta).map_err(|e| BlobError::Meta(e.to_string()))?;
            fs::write(self.meta_path(&id), meta_json)?;

            tracing::debug!(blob_id = %id, size = bytes.len(), "Blob stored");
        }

        Ok(id)
    }

    /// Retrieve bytes and media type, verifying integrity on every read.
    pub fn get(&self, id: &str) -> Result<(Vec<u8>, BlobMeta), BlobError> {
        let path = self.blob_path(id);
        if !path.exists() {
            return Err(BlobError::NotFound(id.to_string()));
        }

        let bytes = fs::read(&path)?;
        let actual = hex_encode(&Sha256::digest(&bytes));
        if actual != id {
            return Err(BlobError::Corrupt(id.to_string()));
        }

        let meta_raw = fs::read_to_string(self.meta_path(id))
            .map_err(|_| BlobError::Meta(format!("missing sidecar for {id}")))?;
        let meta: BlobMeta =
            serde_json::from_str(&meta_raw).map_err(|e| BlobError::Meta(e.to_string()))?;

        Ok((bytes, meta))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.blob_path(id).exists()
    }

    /// Remove blobs received before `cutoff` unless their id appears in
    /// `referenced`. Returns the number of blobs removed.
    pub fn gc(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        referenced: &std::collections::HashSet<String>,
    ) -> Result<usize, BlobError> {
        let mut removed = 0;

        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.path().is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".meta") || name.ends_with(".tmp") {
                    continue;
                }
                if referenced.contains(&name) {
                    continue;
                }
                let meta_raw = match fs::read_to_string(self.meta_path(&name)) {
                    Ok(raw) => raw,
                    Err(_) => continue,
                };
                let meta: BlobMeta = match serde_json::from_str(&meta_raw) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let received = match chrono::DateTime::parse_from_rfc3339(&meta.received_at) {
                    Ok(t) => t.with_timezone(&chrono::Utc),
                    Err(_) => continue,
                };
                if received < cutoff {
                    fs::remove_file(entry.path())?;
                    let _ = fs::remove_file(self.meta_path(&name));
                    removed += 1;
                    tracing::info!(blob_id = %name, "Blob removed by retention policy");
                }
            }
        }

        Ok(removed)
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        let shard = &id[..2.min(id.len())];
        self.root.join(shard).join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        let mut p = self.blob_path(id);
        p.set_extension("meta");
        p
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = store();
        let id = store.put(b"<Invoice/>", "application/xml").unwrap();
        let (bytes, meta) = store.get(&id).unwrap();
        assert_eq!(bytes, b"<Invoice/>");
        assert_eq!(meta.media_type, "application/xml");
        assert_eq!(meta.size, 10);
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put(b"same bytes", "text/plain").unwrap();
        let b = store.put(b"same bytes", "text/plain").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn id_is_content_hash() {
        let (_dir, store) = store();
        let id = store.put(b"abc", "text/plain").unwrap();
        assert_eq!(
            id,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store.get("00deadbeef").unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[test]
    fn tampered_blob_detected_as_corrupt() {
        let (_dir, store) = store();
        let id = store.put(b"original content", "text/plain").unwrap();

        let path = store.blob_path(&id);
        fs::write(&path, b"tampered content").unwrap();

        let err = store.get(&id).unwrap_err();
        assert!(matches!(err, BlobError::Corrupt(_)));
    }

    #[test]
    fn unsupported_media_rejected() {
        let (_dir, store) = store();
        let err = store.put(b"GIF89a", "image/gif").unwrap_err();
        assert!(matches!(err, BlobError::UnsupportedMedia(_)));
    }

    #[test]
    fn gc_spares_referenced_and_recent() {
        let (_dir, store) = store();
        let referenced = store.put(b"keep: referenced", "text/plain").unwrap();
        let recent = store.put(b"keep: recent", "text/plain").unwrap();
        let old = store.put(b"drop: old and unreferenced", "text/plain").unwrap();

        // Backdate the doomed blob's sidecar.
        let meta = BlobMeta {
            media_type: "text/plain".into(),
            received_at: "2020-01-01T00:00:00+00:00".into(),
            size: 26,
        };
        fs::write(store.meta_path(&old), serde_json::to_string(&meta).unwrap()).unwrap();
        // Backdate the referenced one too; the reference must protect it.
        fs::write(
            store.meta_path(&referenced),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();

        let mut refs = std::collections::HashSet::new();
        refs.insert(referenced.clone());

        let cutoff = chrono::Utc::now() - chrono::Duration::days(365);
        let removed = store.gc(cutoff, &refs).unwrap();

        assert_eq!(removed, 1);
        assert!(store.exists(&referenced));
        assert!(store.exists(&recent));
        assert!(!store.exists(&old));
    }
}
