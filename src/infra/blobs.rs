//! Filesystem-backed content store.
//!
//! Layout under the bucket root:
//!
//! ```text
//! objects/<id[..2]>/<id>-<hash>  payload owned by one id
//! refs/<id[..2]>/<id>.json        ContentRecord pointing at its object
//! tmp/                            staging for atomic renames
//! ```
//!
//! A write stages the payload, renames it into `objects/`, then stages and
//! renames the ref, and finally drops the object the old ref pointed at.
//! Readers only ever follow a complete ref to a complete object.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use time::OffsetDateTime;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::warn;
use uuid::Uuid;

use crate::application::repos::{BlobReader, ByteStream, ContentStore, StoreError, StoredBlob};
use crate::cache::{CacheId, ContentDigest};
use crate::domain::entities::ContentRecord;

const STORE: &str = "blobs";
const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        for directory in ["objects", "refs", "tmp"] {
            std::fs::create_dir_all(root.join(directory))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &CacheId, content_hash: &str) -> Result<PathBuf, StoreError> {
        let relative = format!("objects/{}/{id}-{content_hash}", id.shard());
        self.resolve(&relative)
    }

    fn ref_path(&self, id: &CacheId) -> Result<PathBuf, StoreError> {
        let relative = format!("refs/{}/{id}.json", id.shard());
        self.resolve(&relative)
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join("tmp").join(Uuid::new_v4().to_string())
    }

    /// Resolve a store-relative path, rejecting anything that escapes the root.
    fn resolve(&self, stored_path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(stored_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(StoreError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }

    async fn read_record(&self, id: &CacheId) -> Result<Option<ContentRecord>, StoreError> {
        let path = self.ref_path(id)?;
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| StoreError::corrupt(STORE, format!("ref {id}: {err}")))
    }

    /// Move a staged file into place, creating its parent directory.
    async fn publish(&self, staged: &Path, target: &Path) -> Result<(), StoreError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(err) = fs::rename(staged, target).await {
            let _ = fs::remove_file(staged).await;
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    /// Remove an object no ref points at any more. Failures only leave garbage.
    async fn discard_object(&self, id: &CacheId, content_hash: &str) {
        let Ok(object) = self.object_path(id, content_hash) else {
            return;
        };
        match fs::remove_file(&object).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                store = STORE,
                id = %id,
                object = %object.display(),
                error = %err,
                "failed to remove replaced object"
            ),
        }
    }

    /// Stream `payload` into a staging file, returning its digest and size.
    async fn stage_payload(
        &self,
        staged: &Path,
        mut payload: ByteStream,
    ) -> Result<(String, u64), StoreError> {
        let mut file = fs::File::create(staged).await?;
        let mut digest = ContentDigest::new();
        let mut total_bytes: u64 = 0;

        while let Some(chunk) = payload.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or_else(|| StoreError::write_failure(STORE, "payload size overflow"))?;
            file.write_all(&chunk).await?;
            digest.update(&chunk);
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok((digest.finalize(), total_bytes))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    fn name(&self) -> &'static str {
        STORE
    }

    async fn stat(&self, id: &CacheId) -> Result<Option<ContentRecord>, StoreError> {
        self.read_record(id).await
    }

    async fn open_read(&self, id: &CacheId) -> Result<Option<BlobReader>, StoreError> {
        let Some(record) = self.read_record(id).await? else {
            return Ok(None);
        };

        let object = self.object_path(id, &record.content_hash)?;
        let file = match fs::File::open(&object).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        };

        Ok(Some(BlobReader {
            record,
            stream: file_stream(file),
        }))
    }

    async fn write(
        &self,
        id: &CacheId,
        key: &str,
        content_type: &str,
        payload: ByteStream,
    ) -> Result<StoredBlob, StoreError> {
        let staged_object = self.staging_path();
        let (content_hash, size_bytes) = match self.stage_payload(&staged_object, payload).await {
            Ok(staged) => staged,
            Err(err) => {
                let _ = fs::remove_file(&staged_object).await;
                return Err(err);
            }
        };

        let object = self.object_path(id, &content_hash)?;
        self.publish(&staged_object, &object).await?;
        let previous = self.read_record(id).await.ok().flatten();

        let uploaded_at = OffsetDateTime::now_utc();
        let record = ContentRecord {
            id: id.clone(),
            filename: key.to_owned(),
            uploaded_at,
            content_type: content_type.to_owned(),
            content_hash: content_hash.clone(),
            size_bytes,
        };
        let encoded = serde_json::to_vec(&record)
            .map_err(|err| StoreError::write_failure(STORE, format!("encode ref: {err}")))?;

        let staged_ref = self.staging_path();
        if let Err(err) = write_synced(&staged_ref, &encoded).await {
            let _ = fs::remove_file(&staged_ref).await;
            return Err(StoreError::Io(err));
        }
        self.publish(&staged_ref, &self.ref_path(id)?).await?;

        if let Some(previous) = previous.filter(|record| record.content_hash != content_hash) {
            self.discard_object(id, &previous.content_hash).await;
        }

        Ok(StoredBlob {
            content_hash,
            uploaded_at,
            size_bytes,
        })
    }
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

fn file_stream(file: fs::File) -> ByteStream {
    stream::try_unfold(file, read_chunk).boxed()
}

async fn read_chunk(mut file: fs::File) -> Result<Option<(Bytes, fs::File)>, StoreError> {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_BYTES);
    let read = file
        .read_buf(&mut buffer)
        .await
        .map_err(StoreError::stream)?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some((buffer.freeze(), file)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsContentStore::new(dir.path().to_path_buf()).expect("store");
        assert!(matches!(
            store.resolve("../outside"),
            Err(StoreError::InvalidPath)
        ));
        assert!(matches!(
            store.resolve("/etc/passwd"),
            Err(StoreError::InvalidPath)
        ));
        assert!(store.resolve("objects/ab/abc").is_ok());
    }

    #[test]
    fn layout_shards_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsContentStore::new(dir.path().to_path_buf()).expect("store");
        let id = CacheId::derive("http://a");
        let path = store.ref_path(&id).expect("ref path");
        assert!(path.ends_with(format!("refs/{}/{id}.json", id.shard())));
    }

    #[tokio::test]
    async fn synced_write_persists_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ref.json");
        write_synced(&path, b"{\"id\":\"x\"}").await.expect("write");
        assert_eq!(std::fs::read(&path).expect("read"), b"{\"id\":\"x\"}");
    }

    #[tokio::test]
    async fn ref_points_at_an_object_owned_by_its_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsContentStore::new(dir.path().to_path_buf()).expect("store");
        let id = CacheId::derive("http://a");
        let payload = stream::iter(vec![Ok::<_, StoreError>(Bytes::from_static(b"page"))]).boxed();

        let stored = store
            .write(&id, "http://a", "text/html", payload)
            .await
            .expect("write");

        let object = store.object_path(&id, &stored.content_hash).expect("object path");
        assert!(object.ends_with(format!("objects/{}/{id}-{}", id.shard(), stored.content_hash)));
        assert_eq!(std::fs::read(object).expect("object"), b"page");
    }
}
