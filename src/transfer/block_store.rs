//! Per-file block tracking
//!
//! [`IncompleteFile`] decides what to request next and validates what
//! arrives; [`CompleteFile`] is the read-only view used to serve peers.
//!
//! Each block number is in exactly one of: stored, `ongoing` (handed out and
//! awaiting its data or write result), `next` (candidate not yet handed out)
//! or not yet discovered. `next` is refilled from storage in batches so the
//! working set stays bounded regardless of file size.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::BlockStoreConfig;
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::storage::{BlockStorage, ReaderId};
use crate::types::{BlockDetails, BlockNr, FileId, FileLayout, TransferReport};

/// Result of handing one block to [`IncompleteFile::block`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Verified and persisted
    Stored,
    /// Write failed transiently; the block is back in `next`
    Requeued,
    /// The block was not ongoing (late or duplicate delivery)
    Ignored,
}

#[derive(Debug, Default)]
struct Tracking {
    next_blocks: BTreeSet<BlockNr>,
    ongoing_blocks: BTreeSet<BlockNr>,
    next_hashes: BTreeSet<BlockNr>,
    ongoing_hashes: BTreeSet<BlockNr>,
    /// Hashes received and being persisted
    writing_hashes: BTreeSet<BlockNr>,
    /// Ongoing blocks whose data is being persisted
    writing_blocks: BTreeSet<BlockNr>,
}

/// Write view of a file still being downloaded
pub struct IncompleteFile {
    file: FileId,
    layout: FileLayout,
    storage: Arc<dyn BlockStorage>,
    config: BlockStoreConfig,
    tracking: Mutex<Tracking>,
    writes_in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight write count when the write resolves or is dropped
struct WriteGuard<'a>(&'a IncompleteFile);

impl<'a> WriteGuard<'a> {
    fn enter(store: &'a IncompleteFile) -> Self {
        store.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        Self(store)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.0.writes_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl IncompleteFile {
    pub fn new(file: FileId, storage: Arc<dyn BlockStorage>, config: BlockStoreConfig) -> Self {
        Self {
            file,
            layout: storage.layout(),
            storage,
            config,
            tracking: Mutex::new(Tracking::default()),
            writes_in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn layout(&self) -> FileLayout {
        self.layout
    }

    pub fn storage(&self) -> Arc<dyn BlockStorage> {
        Arc::clone(&self.storage)
    }

    pub async fn start(&self) -> Result<()> {
        self.storage.start().await
    }

    pub async fn close(&self) -> Result<()> {
        self.wait_idle().await;
        self.storage.close().await
    }

    /// No write is in flight here or in the backend
    pub fn is_idle(&self) -> bool {
        self.writes_in_flight.load(Ordering::SeqCst) == 0 && self.storage.is_idle()
    }

    /// Wait until every write started so far has resolved
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.writes_in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Whether a block can be handed out, refilling `next` when it ran dry
    pub fn has_blocks(&self) -> bool {
        let mut tracking = self.tracking.lock();
        if tracking.next_blocks.is_empty() {
            tracking.next_blocks = self
                .storage
                .next_missing_blocks(self.config.next_batch_size, &tracking.ongoing_blocks);
            if !tracking.next_blocks.is_empty() {
                tracing::trace!(
                    "{}: refilled {} block candidates",
                    self.file,
                    tracking.next_blocks.len()
                );
            }
        }
        !tracking.next_blocks.is_empty()
    }

    /// Whether a hash can be handed out, refilling `next` when it ran dry
    pub fn has_hashes(&self) -> bool {
        let mut tracking = self.tracking.lock();
        if tracking.next_hashes.is_empty() {
            let excluding: BTreeSet<BlockNr> = tracking
                .ongoing_hashes
                .union(&tracking.writing_hashes)
                .copied()
                .collect();
            tracking.next_hashes = self
                .storage
                .next_missing_hashes(self.config.next_batch_size, &excluding);
        }
        !tracking.next_hashes.is_empty()
    }

    /// Hand out up to one batch of hashes
    pub fn request_hashes(&self) -> BTreeSet<BlockNr> {
        let mut tracking = self.tracking.lock();
        let mut batch = BTreeSet::new();
        while batch.len() < self.config.hash_batch_size {
            let Some(nr) = tracking.next_hashes.pop_first() else {
                break;
            };
            tracking.ongoing_hashes.insert(nr);
            batch.insert(nr);
        }
        batch
    }

    /// Resolve a hash request: persist `received`, requeue `missing`
    ///
    /// Hashes that fail to persist transiently are requeued. A fatal storage
    /// failure is returned after every hash has been resolved.
    pub async fn hashes(
        &self,
        received: BTreeMap<BlockNr, Bytes>,
        missing: BTreeSet<BlockNr>,
    ) -> Result<()> {
        let mut to_write = Vec::with_capacity(received.len());
        {
            let mut tracking = self.tracking.lock();
            for nr in missing {
                tracking.ongoing_hashes.remove(&nr);
                if !self.storage.has_hash(nr) && !tracking.writing_hashes.contains(&nr) {
                    tracking.next_hashes.insert(nr);
                }
            }
            for (nr, hash) in received {
                tracking.ongoing_hashes.remove(&nr);
                tracking.next_hashes.remove(&nr);
                if nr >= self.layout.nr_blocks() || self.storage.has_hash(nr) {
                    continue;
                }
                if tracking.writing_hashes.insert(nr) {
                    to_write.push((nr, hash));
                }
            }
        }

        let mut fatal = None;
        for (nr, hash) in to_write {
            let result = if hash.len() != self.layout.default_block.hash_size as usize {
                Err(EngineError::protocol(
                    ProtocolErrorKind::HashMismatch,
                    format!("Hash for block {} has {} bytes", nr, hash.len()),
                ))
            } else {
                let _guard = WriteGuard::enter(self);
                self.storage.write_hash(nr, hash).await
            };

            let mut tracking = self.tracking.lock();
            tracking.writing_hashes.remove(&nr);
            if let Err(e) = result {
                tracking.next_hashes.insert(nr);
                if e.is_fatal() {
                    tracing::error!("{}: hash {} write failed: {}", self.file, nr, e);
                    fatal.get_or_insert(e);
                } else {
                    tracing::warn!("{}: hash {} requeued: {}", self.file, nr, e);
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand out the lowest candidate block, with its shape if irregular
    pub fn request_block(&self) -> Option<(BlockNr, Option<BlockDetails>)> {
        let mut tracking = self.tracking.lock();
        let nr = tracking.next_blocks.pop_first()?;
        tracking.ongoing_blocks.insert(nr);
        Some((nr, self.layout.irregular_details(nr)))
    }

    /// Verify and persist an ongoing block
    ///
    /// The buffer is owned by the write and dropped once it resolves. A
    /// hash mismatch or I/O error puts the block back into `next`. Only one
    /// write per block runs at a time; a second delivery is ignored.
    pub async fn block(&self, nr: BlockNr, data: Bytes) -> Result<BlockOutcome> {
        {
            let mut tracking = self.tracking.lock();
            if !tracking.ongoing_blocks.contains(&nr) {
                tracing::debug!("{}: ignoring block {} that is not ongoing", self.file, nr);
                return Ok(BlockOutcome::Ignored);
            }
            if !tracking.writing_blocks.insert(nr) {
                tracing::debug!("{}: block {} is already being written", self.file, nr);
                return Ok(BlockOutcome::Ignored);
            }
        }

        let result = {
            let _guard = WriteGuard::enter(self);
            self.storage.write_block(nr, data).await
        };

        let mut tracking = self.tracking.lock();
        tracking.writing_blocks.remove(&nr);
        tracking.ongoing_blocks.remove(&nr);
        match result {
            Ok(()) => {
                tracking.next_blocks.remove(&nr);
                tracing::trace!("{}: stored block {}", self.file, nr);
                Ok(BlockOutcome::Stored)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("{}: block {} requeued: {}", self.file, nr, e);
                tracking.next_blocks.insert(nr);
                Ok(BlockOutcome::Requeued)
            }
            Err(e) => {
                tracing::error!("{}: block {} write failed: {}", self.file, nr, e);
                tracking.next_blocks.insert(nr);
                Err(e)
            }
        }
    }

    /// Move an ongoing block back to `next`
    ///
    /// A block being written stays ongoing; the write resolves it.
    pub fn reset_block(&self, nr: BlockNr) {
        let mut tracking = self.tracking.lock();
        if tracking.writing_blocks.contains(&nr) {
            return;
        }
        if tracking.ongoing_blocks.remove(&nr) && !self.storage.has_block(nr) {
            tracking.next_blocks.insert(nr);
        }
    }

    /// Move an ongoing hash back to `next`
    pub fn reset_hash(&self, nr: BlockNr) {
        let mut tracking = self.tracking.lock();
        if tracking.ongoing_hashes.remove(&nr) && !self.storage.has_hash(nr) {
            tracking.next_hashes.insert(nr);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.storage.is_complete()
    }

    /// Switch to the read-only view, discarding the tracking sets
    pub fn complete(&self) -> Result<CompleteFile> {
        if !self.is_complete() {
            return Err(EngineError::invalid_state("complete", "blocks missing"));
        }
        *self.tracking.lock() = Tracking::default();
        Ok(self.reader())
    }

    /// Read view over what is stored so far
    pub fn reader(&self) -> CompleteFile {
        CompleteFile::new(self.file, Arc::clone(&self.storage), self.config.read_ahead_blocks)
    }

    pub fn report(&self) -> TransferReport {
        progress(&self.layout, self.storage.as_ref())
    }

    pub fn next_blocks(&self) -> BTreeSet<BlockNr> {
        self.tracking.lock().next_blocks.clone()
    }

    pub fn ongoing_blocks(&self) -> BTreeSet<BlockNr> {
        self.tracking.lock().ongoing_blocks.clone()
    }

    pub fn next_hashes(&self) -> BTreeSet<BlockNr> {
        self.tracking.lock().next_hashes.clone()
    }

    pub fn ongoing_hashes(&self) -> BTreeSet<BlockNr> {
        self.tracking.lock().ongoing_hashes.clone()
    }
}

/// Bytes stored so far. Only the last block can be short.
pub(crate) fn progress(layout: &FileLayout, storage: &dyn BlockStorage) -> TransferReport {
    let block_size = layout.default_block.block_size as u64;
    let mut current_size = storage.file_pos() as u64 * block_size;
    if let Some(last) = layout.last_block() {
        if storage.has_block(last) {
            current_size = current_size
                .saturating_sub(block_size.saturating_sub(layout.block_len(last) as u64));
        }
    }
    TransferReport {
        total_size: layout.length,
        current_size: current_size.min(layout.length),
    }
}

/// Read view of a file
pub struct CompleteFile {
    file: FileId,
    layout: FileLayout,
    storage: Arc<dyn BlockStorage>,
    read_ahead: u32,
}

impl CompleteFile {
    pub fn new(file: FileId, storage: Arc<dyn BlockStorage>, read_ahead: u32) -> Self {
        Self {
            file,
            layout: storage.layout(),
            storage,
            read_ahead,
        }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn layout(&self) -> FileLayout {
        self.layout
    }

    pub fn storage(&self) -> Arc<dyn BlockStorage> {
        Arc::clone(&self.storage)
    }

    pub async fn start(&self) -> Result<()> {
        self.storage.start().await
    }

    pub async fn close(&self) -> Result<()> {
        self.storage.close().await
    }

    pub fn is_idle(&self) -> bool {
        self.storage.is_idle()
    }

    pub fn is_complete(&self) -> bool {
        self.storage.is_complete()
    }

    pub fn has_block(&self, nr: BlockNr) -> bool {
        self.storage.has_block(nr)
    }

    pub fn has_hash(&self, nr: BlockNr) -> bool {
        self.storage.has_hash(nr)
    }

    pub async fn read_hash(&self, nr: BlockNr) -> Result<Bytes> {
        self.storage.read_hash(nr).await
    }

    pub async fn read_block(&self, nr: BlockNr) -> Result<Bytes> {
        self.storage.read_block(nr).await
    }

    /// Announce upcoming reads; each hinted block pulls in the blocks
    /// following it. Returns the expanded hint.
    pub fn set_cache_hint(&self, reader: ReaderId, hint: &BTreeSet<BlockNr>) -> BTreeSet<BlockNr> {
        let nr_blocks = self.layout.nr_blocks();
        let expanded: BTreeSet<BlockNr> = hint
            .iter()
            .flat_map(|&nr| nr..nr.saturating_add(self.read_ahead + 1).min(nr_blocks))
            .filter(|&nr| self.storage.has_block(nr))
            .collect();
        self.storage.set_future_reads(reader, expanded.clone());
        expanded
    }

    pub fn clean(&self, reader: ReaderId) {
        self.storage.clean(reader);
    }

    pub fn report(&self) -> TransferReport {
        progress(&self.layout, self.storage.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, WriteFault};
    use crate::types::{hash_block, TorrentId};
    use std::time::Duration;

    fn file_id() -> FileId {
        FileId::new(TorrentId::from_name("block-store"), 0)
    }

    /// 101 blocks of 1024 bytes, the last one 100 bytes
    fn layout_101() -> FileLayout {
        FileLayout::new(100 * 1024 + 100, BlockDetails::new(1024))
    }

    fn content(layout: &FileLayout) -> Vec<u8> {
        (0..layout.length).map(|i| (i % 251) as u8).collect()
    }

    fn block_of(content: &[u8], layout: &FileLayout, nr: BlockNr) -> Bytes {
        let range = layout.block_range(nr);
        Bytes::copy_from_slice(&content[range.start as usize..range.end as usize])
    }

    fn store(storage: Arc<MemoryStorage>) -> IncompleteFile {
        IncompleteFile::new(file_id(), storage, BlockStoreConfig::default())
    }

    fn assert_disjoint(store: &IncompleteFile) {
        assert!(store.next_blocks().is_disjoint(&store.ongoing_blocks()));
        assert!(store.next_hashes().is_disjoint(&store.ongoing_hashes()));
    }

    #[test]
    fn test_batches_advance_window() {
        let store = store(Arc::new(MemoryStorage::new(layout_101())));

        for _ in 0..5 {
            assert!(store.has_blocks());
            while store.next_blocks().len() > 0 {
                store.request_block().unwrap();
                assert_disjoint(&store);
            }
        }
        assert_eq!(store.ongoing_blocks().len(), 100);
        assert!(store.next_blocks().is_empty());

        assert!(store.has_blocks());
        assert_eq!(store.next_blocks(), [100].into_iter().collect());

        let (nr, details) = store.request_block().unwrap();
        assert_eq!(nr, 100);
        assert_eq!(details.unwrap().block_size, 100);
    }

    #[test]
    fn test_regular_blocks_have_no_details() {
        let store = store(Arc::new(MemoryStorage::new(layout_101())));
        assert!(store.has_blocks());
        assert_eq!(store.request_block(), Some((0, None)));
    }

    #[tokio::test]
    async fn test_hashes_requeue_missing() {
        let layout = layout_101();
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::seeded(layout, &content));
        for nr in [5, 6] {
            storage.remove_block(nr);
            storage.remove_hash(nr);
        }
        let store = store(storage.clone());

        assert!(store.has_hashes());
        assert_eq!(store.request_hashes(), [5, 6].into_iter().collect());
        assert_eq!(store.ongoing_hashes(), [5, 6].into_iter().collect());

        let received = [(5, hash_block(&block_of(&content, &layout, 5)))]
            .into_iter()
            .collect();
        store.hashes(received, [6].into_iter().collect()).await.unwrap();

        assert!(store.ongoing_hashes().is_empty());
        assert!(store.next_hashes().contains(&6));
        assert!(storage.has_hash(5));
        assert_disjoint(&store);
    }

    #[test]
    fn test_hash_batch_bound() {
        let store = store(Arc::new(MemoryStorage::new(layout_101())));
        assert!(store.has_hashes());
        assert!(store.request_hashes().len() <= BlockStoreConfig::default().hash_batch_size);
    }

    #[tokio::test]
    async fn test_block_stored_once() {
        let layout = FileLayout::new(4096, BlockDetails::new(1024));
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::new(layout));
        let store = store(storage.clone());

        let hashes = (0..4).map(|nr| (nr, hash_block(&block_of(&content, &layout, nr)))).collect();
        store.hashes(hashes, BTreeSet::new()).await.unwrap();

        assert!(store.has_blocks());
        let (nr, _) = store.request_block().unwrap();
        let outcome = store.block(nr, block_of(&content, &layout, nr)).await.unwrap();
        assert_eq!(outcome, BlockOutcome::Stored);

        // duplicate delivery after success
        let outcome = store.block(nr, block_of(&content, &layout, nr)).await.unwrap();
        assert_eq!(outcome, BlockOutcome::Ignored);

        while store.request_block().is_some() {}
        assert_eq!(store.ongoing_blocks().len(), 3);
        assert!(!store.has_blocks());
        assert!(!store.next_blocks().contains(&nr));
    }

    #[tokio::test]
    async fn test_mismatch_requeues() {
        let layout = FileLayout::new(2048, BlockDetails::new(1024));
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::new(layout));
        let store = store(storage.clone());
        let hashes = (0..2).map(|nr| (nr, hash_block(&block_of(&content, &layout, nr)))).collect();
        store.hashes(hashes, BTreeSet::new()).await.unwrap();

        storage.inject_block_faults(1, WriteFault::HashMismatch);
        assert!(store.has_blocks());
        let (nr, _) = store.request_block().unwrap();
        let outcome = store.block(nr, block_of(&content, &layout, nr)).await.unwrap();
        assert_eq!(outcome, BlockOutcome::Requeued);
        assert!(store.next_blocks().contains(&nr));
        assert!(!store.ongoing_blocks().contains(&nr));
        assert_disjoint(&store);
    }

    #[tokio::test]
    async fn test_block_without_hash_requeues() {
        let layout = FileLayout::new(2048, BlockDetails::new(1024));
        let content = content(&layout);
        let store = store(Arc::new(MemoryStorage::new(layout)));

        assert!(store.has_blocks());
        let (nr, _) = store.request_block().unwrap();
        let outcome = store.block(nr, block_of(&content, &layout, nr)).await.unwrap();
        assert_eq!(outcome, BlockOutcome::Requeued);
    }

    #[tokio::test]
    async fn test_fatal_write_is_returned() {
        let layout = FileLayout::new(2048, BlockDetails::new(1024));
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::new(layout));
        let store = store(storage.clone());

        assert!(store.has_blocks());
        let (nr, _) = store.request_block().unwrap();
        storage.set_unavailable(true);
        let err = store.block(nr, block_of(&content, &layout, nr)).await.unwrap_err();
        assert!(err.is_fatal());
        assert_disjoint(&store);
    }

    #[test]
    fn test_reset_block() {
        let store = store(Arc::new(MemoryStorage::new(layout_101())));
        assert!(store.has_blocks());
        let (nr, _) = store.request_block().unwrap();
        store.reset_block(nr);
        assert!(store.next_blocks().contains(&nr));
        assert!(!store.ongoing_blocks().contains(&nr));
    }

    #[tokio::test]
    async fn test_round_trip_through_complete_view() {
        let layout = FileLayout::new(2 * 1024 + 10, BlockDetails::new(1024));
        let content = content(&layout);
        let store = store(Arc::new(MemoryStorage::new(layout)));

        let hashes: BTreeMap<_, _> =
            (0..3).map(|nr| (nr, hash_block(&block_of(&content, &layout, nr)))).collect();
        store.hashes(hashes.clone(), BTreeSet::new()).await.unwrap();
        while store.has_blocks() {
            let (nr, _) = store.request_block().unwrap();
            store.block(nr, block_of(&content, &layout, nr)).await.unwrap();
        }

        assert!(store.is_complete());
        assert_eq!(store.report().current_size, layout.length);
        let complete = store.complete().unwrap();
        for nr in 0..3 {
            let data = complete.read_block(nr).await.unwrap();
            assert_eq!(hash_block(&data), hashes[&nr]);
        }
    }

    #[test]
    fn test_complete_requires_all_blocks() {
        let store = store(Arc::new(MemoryStorage::new(layout_101())));
        assert!(store.complete().is_err());
    }

    #[tokio::test]
    async fn test_wait_idle_covers_inflight_writes() {
        let layout = FileLayout::new(1024, BlockDetails::new(1024));
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::new(layout));
        let store = Arc::new(store(storage.clone()));
        let hash = [(0, hash_block(&content))].into_iter().collect();
        store.hashes(hash, BTreeSet::new()).await.unwrap();

        storage.set_write_delay(Some(Duration::from_millis(50)));
        assert!(store.has_blocks());
        let (nr, _) = store.request_block().unwrap();
        let writer = {
            let store = Arc::clone(&store);
            let data = Bytes::from(content.clone());
            tokio::spawn(async move { store.block(nr, data).await })
        };
        tokio::task::yield_now().await;
        store.wait_idle().await;
        assert!(store.is_idle());
        assert_eq!(writer.await.unwrap().unwrap(), BlockOutcome::Stored);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_written_once() {
        let layout = FileLayout::new(2048, BlockDetails::new(1024));
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::new(layout));
        let store = Arc::new(store(storage.clone()));
        let hashes = (0..2).map(|nr| (nr, hash_block(&block_of(&content, &layout, nr)))).collect();
        store.hashes(hashes, BTreeSet::new()).await.unwrap();

        storage.set_write_delay(Some(Duration::from_millis(50)));
        assert!(store.has_blocks());
        let (nr, _) = store.request_block().unwrap();
        let data = block_of(&content, &layout, nr);
        let first = {
            let store = Arc::clone(&store);
            let data = data.clone();
            tokio::spawn(async move { store.block(nr, data).await })
        };
        tokio::task::yield_now().await;

        // a timeout requeue while the write is running leaves it ongoing
        store.reset_block(nr);
        assert!(store.ongoing_blocks().contains(&nr));
        assert!(!store.next_blocks().contains(&nr));

        let second = store.block(nr, data).await.unwrap();
        assert_eq!(second, BlockOutcome::Ignored);
        assert_eq!(first.await.unwrap().unwrap(), BlockOutcome::Stored);
        assert_eq!(storage.block_writes(), 1);
        assert_disjoint(&store);
    }

    #[test]
    fn test_report_counts_short_last_block() {
        let layout = FileLayout::new(2 * 1024 + 10, BlockDetails::new(1024));
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::seeded(layout, &content));
        storage.remove_block(0);
        let view = CompleteFile::new(file_id(), storage.clone(), 2);
        assert_eq!(view.report().current_size, 1024 + 10);

        storage.remove_block(1);
        let incomplete = store(storage);
        assert_eq!(incomplete.report().current_size, 10);
        assert_eq!(incomplete.report().total_size, layout.length);
    }

    #[test]
    fn test_cache_hint_expands() {
        let layout = FileLayout::new(10 * 1024, BlockDetails::new(1024));
        let content = content(&layout);
        let storage = Arc::new(MemoryStorage::seeded(layout, &content));
        let view = CompleteFile::new(file_id(), storage.clone(), 2);

        let expanded = view.set_cache_hint(ReaderId(1), &[3, 8].into_iter().collect());
        assert_eq!(expanded, [3, 4, 5, 8, 9].into_iter().collect());
        assert_eq!(storage.hint(ReaderId(1)), expanded);
    }
}
