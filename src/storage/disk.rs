//! Local disk storage backend
//!
//! Stores one file as a data file plus a `.hashes` sidecar holding one
//! fixed-size slot per block. An all-zero slot means the hash is unknown.
//! On start the sidecar is loaded and every block with a known hash is
//! re-verified, so a restarted node resumes where it stopped.

use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

use super::{check_range, verify_block, Availability, BlockStorage, ReadCache, ReaderId};
use crate::error::{EngineError, ProtocolErrorKind, Result, StorageErrorKind};
use crate::types::{hash_block, BlockNr, FileLayout};

/// Blocks prefetched per reader at most
const MAX_PREFETCH_PER_READER: usize = 32;

/// Disk-backed storage for one file
#[derive(Clone)]
pub struct FileStorage {
    inner: Arc<FileInner>,
}

struct FileInner {
    path: PathBuf,
    hash_path: PathBuf,
    layout: FileLayout,
    data: TokioMutex<Option<File>>,
    hashes_file: TokioMutex<Option<File>>,
    hashes: RwLock<Vec<Option<Bytes>>>,
    availability: RwLock<Availability>,
    in_flight: AtomicUsize,
    cache: ReadCache,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>, layout: FileLayout) -> Self {
        let path = path.into();
        let mut hash_name = path.file_name().unwrap_or_default().to_os_string();
        hash_name.push(".hashes");
        let hash_path = path.with_file_name(hash_name);
        let nr_blocks = layout.nr_blocks();

        Self {
            inner: Arc::new(FileInner {
                path,
                hash_path,
                layout,
                data: TokioMutex::new(None),
                hashes_file: TokioMutex::new(None),
                hashes: RwLock::new(vec![None; nr_blocks as usize]),
                availability: RwLock::new(Availability::empty(nr_blocks)),
                in_flight: AtomicUsize::new(0),
                cache: ReadCache::new(MAX_PREFETCH_PER_READER),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Reject paths that escape the storage root
    pub fn validate_relative_path(path: &Path) -> Result<()> {
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    return Err(EngineError::invalid_input(
                        "path",
                        "file path contains parent directory reference (..)",
                    ))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::invalid_input(
                        "path",
                        "file path contains absolute path",
                    ))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn unavailable(path: &Path) -> EngineError {
    EngineError::storage(
        StorageErrorKind::Unavailable,
        format!("{} is not open", path.display()),
    )
}

impl FileInner {
    async fn read_at(&self, block: BlockNr) -> Result<Bytes> {
        let range = self.layout.block_range(block);
        let mut guard = self.data.lock().await;
        let file = guard.as_mut().ok_or_else(|| unavailable(&self.path))?;
        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn load_hashes(&self) -> Result<()> {
        let hash_size = self.layout.default_block.hash_size as usize;
        let nr_blocks = self.layout.nr_blocks() as usize;
        let mut raw = vec![0u8; hash_size * nr_blocks];
        {
            let mut guard = self.hashes_file.lock().await;
            let file = guard.as_mut().ok_or_else(|| unavailable(&self.hash_path))?;
            file.seek(SeekFrom::Start(0)).await?;
            file.read_exact(&mut raw).await?;
        }

        let mut hashes = self.hashes.write();
        let mut availability = self.availability.write();
        for (block, slot) in raw.chunks(hash_size.max(1)).enumerate().take(nr_blocks) {
            if slot.iter().any(|b| *b != 0) {
                hashes[block] = Some(Bytes::copy_from_slice(slot));
                availability.set_hash(block as BlockNr, true);
            }
        }
        Ok(())
    }

    async fn verify_existing(&self) -> Result<u32> {
        let mut valid = 0;
        for block in 0..self.layout.nr_blocks() {
            let expected = self.hashes.read()[block as usize].clone();
            let Some(expected) = expected else {
                continue;
            };
            let data = self.read_at(block).await?;
            if hash_block(&data) == expected {
                self.availability.write().set_block(block, true);
                valid += 1;
            }
        }
        Ok(valid)
    }

    async fn prefetch(self: Arc<Self>, reader: ReaderId, blocks: Vec<BlockNr>) {
        for block in blocks {
            if !self.availability.read().has_block(block) {
                continue;
            }
            match self.read_at(block).await {
                Ok(data) => self.cache.insert(reader, block, data),
                Err(e) => {
                    tracing::debug!("Prefetch of block {} failed: {}", block, e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlockStorage for FileStorage {
    fn layout(&self) -> FileLayout {
        self.inner.layout
    }

    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if let Some(parent) = inner.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&inner.path)
            .await?;
        if data.metadata().await?.len() < inner.layout.length {
            data.set_len(inner.layout.length).await?;
        }

        let hash_len = inner.layout.nr_blocks() as u64 * inner.layout.default_block.hash_size as u64;
        let hashes = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&inner.hash_path)
            .await?;
        if hashes.metadata().await?.len() < hash_len {
            hashes.set_len(hash_len).await?;
        }

        *inner.data.lock().await = Some(data);
        *inner.hashes_file.lock().await = Some(hashes);

        inner.load_hashes().await?;
        let valid = inner.verify_existing().await?;

        tracing::debug!(
            "Opened {} ({} of {} blocks present)",
            inner.path.display(),
            valid,
            inner.layout.nr_blocks()
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.inner.data.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        if let Some(mut file) = self.inner.hashes_file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) == 0
    }

    fn next_missing_blocks(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        self.inner
            .availability
            .read()
            .missing_blocks(batch_size, excluding)
    }

    fn next_missing_hashes(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        self.inner
            .availability
            .read()
            .missing_hashes(batch_size, excluding)
    }

    fn has_block(&self, block: BlockNr) -> bool {
        self.inner.availability.read().has_block(block)
    }

    fn has_hash(&self, block: BlockNr) -> bool {
        self.inner.availability.read().has_hash(block)
    }

    async fn read_hash(&self, block: BlockNr) -> Result<Bytes> {
        check_range(&self.inner.layout, block)?;
        self.inner.hashes.read()[block as usize]
            .clone()
            .ok_or_else(|| {
                EngineError::storage(StorageErrorKind::NotFound, format!("No hash for block {}", block))
            })
    }

    async fn read_block(&self, block: BlockNr) -> Result<Bytes> {
        let _guard = InFlight::enter(&self.inner.in_flight);
        check_range(&self.inner.layout, block)?;
        if !self.has_block(block) {
            return Err(EngineError::storage(
                StorageErrorKind::NotFound,
                format!("No data for block {}", block),
            ));
        }
        if let Some(data) = self.inner.cache.get(block) {
            return Ok(data);
        }
        self.inner.read_at(block).await
    }

    async fn write_hash(&self, block: BlockNr, hash: Bytes) -> Result<()> {
        let _guard = InFlight::enter(&self.inner.in_flight);
        let inner = &self.inner;
        check_range(&inner.layout, block)?;
        let hash_size = inner.layout.default_block.hash_size as usize;
        if hash.len() != hash_size {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("Hash for block {} has {} bytes", block, hash.len()),
            ));
        }

        {
            let mut guard = inner.hashes_file.lock().await;
            let file = guard.as_mut().ok_or_else(|| unavailable(&inner.hash_path))?;
            file.seek(SeekFrom::Start(block as u64 * hash_size as u64)).await?;
            file.write_all(&hash).await?;
        }

        inner.hashes.write()[block as usize] = Some(hash);
        inner.availability.write().set_hash(block, true);
        Ok(())
    }

    async fn write_block(&self, block: BlockNr, data: Bytes) -> Result<()> {
        let _guard = InFlight::enter(&self.inner.in_flight);
        let inner = &self.inner;
        check_range(&inner.layout, block)?;
        let expected = inner.hashes.read()[block as usize].clone();
        verify_block(&inner.layout, block, &data, expected.as_ref())?;

        {
            let mut guard = inner.data.lock().await;
            let file = guard.as_mut().ok_or_else(|| unavailable(&inner.path))?;
            file.seek(SeekFrom::Start(inner.layout.block_range(block).start))
                .await?;
            file.write_all(&data).await?;
        }

        inner.availability.write().set_block(block, true);
        tracing::trace!("Wrote block {} to {}", block, inner.path.display());
        Ok(())
    }

    fn set_future_reads(&self, reader: ReaderId, hint: BTreeSet<BlockNr>) {
        let to_fetch = self.inner.cache.set_hint(reader, hint);
        if to_fetch.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(Arc::clone(&self.inner).prefetch(reader, to_fetch));
        }
    }

    fn clean(&self, reader: ReaderId) {
        self.inner.cache.clean(reader);
    }

    fn is_complete(&self) -> bool {
        self.inner.availability.read().is_complete()
    }

    fn file_pos(&self) -> u32 {
        self.inner.availability.read().blocks_stored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockDetails;
    use tempfile::tempdir;

    fn layout() -> FileLayout {
        FileLayout::new(3 * 512 + 10, BlockDetails::new(512))
    }

    fn content() -> Vec<u8> {
        (0..(3 * 512 + 10)).map(|i| (i % 253) as u8).collect()
    }

    async fn fill(storage: &FileStorage) {
        let layout = storage.layout();
        let content = content();
        for block in 0..layout.nr_blocks() {
            let range = layout.block_range(block);
            let data = Bytes::copy_from_slice(&content[range.start as usize..range.end as usize]);
            storage.write_hash(block, hash_block(&data)).await.unwrap();
            storage.write_block(block, data).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("file.bin"), layout());
        storage.start().await.unwrap();
        fill(&storage).await;

        assert!(storage.is_complete());
        let last = storage.read_block(3).await.unwrap();
        assert_eq!(last.len(), 10);
        assert_eq!(hash_block(&last), storage.read_hash(3).await.unwrap());
        storage.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/file.bin");
        {
            let storage = FileStorage::new(&path, layout());
            storage.start().await.unwrap();
            fill(&storage).await;
            storage.close().await.unwrap();
        }

        let storage = FileStorage::new(&path, layout());
        assert!(!storage.is_complete());
        storage.start().await.unwrap();
        assert!(storage.is_complete());
        assert_eq!(storage.file_pos(), 4);
    }

    #[tokio::test]
    async fn test_rejects_unverified_block() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("file.bin"), layout());
        storage.start().await.unwrap();
        let err = storage
            .write_block(0, Bytes::from(vec![1u8; 512]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!storage.has_block(0));
    }

    #[tokio::test]
    async fn test_closed_storage_is_unavailable() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("file.bin"), layout());
        let err = storage
            .write_hash(0, Bytes::from(vec![1u8; 20]))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_path_validation() {
        assert!(FileStorage::validate_relative_path(Path::new("a/b.bin")).is_ok());
        assert!(FileStorage::validate_relative_path(Path::new("../etc/passwd")).is_err());
        assert!(FileStorage::validate_relative_path(Path::new("/etc/passwd")).is_err());
    }
}
