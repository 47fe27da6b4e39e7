//! In-memory storage backend
//!
//! Keeps blocks and hashes in memory. Used by tests and by embedders that
//! relay data without persisting it. Failures can be injected to exercise
//! the requeue and teardown paths.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::{check_range, verify_block, Availability, BlockStorage, ReadCache, ReaderId};
use crate::error::{EngineError, ProtocolErrorKind, Result, StorageErrorKind};
use crate::types::{hash_block, BlockNr, FileLayout};

/// Failure to inject into an upcoming block write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// Report a hash verification failure
    HashMismatch,
    /// Report a transient I/O failure
    Io,
    /// Report the medium as gone (fatal)
    Unavailable,
}

#[derive(Debug)]
struct Contents {
    blocks: Vec<Option<Bytes>>,
    hashes: Vec<Option<Bytes>>,
    availability: Availability,
}

/// In-memory storage for one file
#[derive(Debug)]
pub struct MemoryStorage {
    layout: FileLayout,
    contents: RwLock<Contents>,
    block_faults: Mutex<VecDeque<WriteFault>>,
    unavailable: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    block_writes: AtomicUsize,
    reads: AtomicUsize,
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

impl MemoryStorage {
    /// Empty storage: nothing known yet
    pub fn new(layout: FileLayout) -> Self {
        let nr_blocks = layout.nr_blocks() as usize;
        Self::from_contents(
            layout,
            Contents {
                blocks: vec![None; nr_blocks],
                hashes: vec![None; nr_blocks],
                availability: Availability::empty(nr_blocks as u32),
            },
        )
    }

    /// Complete storage holding `content`, hashes computed from it
    pub fn seeded(layout: FileLayout, content: &[u8]) -> Self {
        let nr_blocks = layout.nr_blocks();
        let mut blocks = Vec::with_capacity(nr_blocks as usize);
        let mut hashes = Vec::with_capacity(nr_blocks as usize);
        for block in 0..nr_blocks {
            let range = layout.block_range(block);
            let end = (range.end as usize).min(content.len());
            let start = (range.start as usize).min(end);
            let data = Bytes::copy_from_slice(&content[start..end]);
            hashes.push(Some(hash_block(&data)));
            blocks.push(Some(data));
        }
        Self::from_contents(
            layout,
            Contents {
                blocks,
                hashes,
                availability: Availability::full(nr_blocks),
            },
        )
    }

    fn from_contents(layout: FileLayout, contents: Contents) -> Self {
        Self {
            layout,
            contents: RwLock::new(contents),
            block_faults: Mutex::new(VecDeque::new()),
            unavailable: AtomicBool::new(false),
            write_delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            block_writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            cache: ReadCache::new(usize::MAX),
        }
    }

    /// Drop a stored block (its hash stays)
    pub fn remove_block(&self, block: BlockNr) {
        let mut contents = self.contents.write();
        if let Some(slot) = contents.blocks.get_mut(block as usize) {
            *slot = None;
        }
        contents.availability.set_block(block, false);
    }

    /// Drop a stored hash
    pub fn remove_hash(&self, block: BlockNr) {
        let mut contents = self.contents.write();
        if let Some(slot) = contents.hashes.get_mut(block as usize) {
            *slot = None;
        }
        contents.availability.set_hash(block, false);
    }

    /// Fail the next `count` block writes with `fault`
    pub fn inject_block_faults(&self, count: usize, fault: WriteFault) {
        let mut faults = self.block_faults.lock();
        for _ in 0..count {
            faults.push_back(fault);
        }
    }

    /// Make every operation fail as if the medium disappeared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every write, keeping it in flight for `delay`
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Number of block writes attempted
    pub fn block_writes(&self) -> usize {
        self.block_writes.load(Ordering::SeqCst)
    }

    /// Number of block reads served
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Read-ahead hint registered for `reader`
    pub fn hint(&self, reader: ReaderId) -> BTreeSet<BlockNr> {
        self.cache.hint(reader)
    }

    /// Readers still holding read-ahead state
    pub fn cached_readers(&self) -> usize {
        self.cache.readers()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::storage(
                StorageErrorKind::Unavailable,
                "memory storage marked unavailable",
            ));
        }
        Ok(())
    }

    async fn delay_write(&self) {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BlockStorage for MemoryStorage {
    fn layout(&self) -> FileLayout {
        self.layout
    }

    async fn start(&self) -> Result<()> {
        self.check_available()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    fn next_missing_blocks(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        self.contents
            .read()
            .availability
            .missing_blocks(batch_size, excluding)
    }

    fn next_missing_hashes(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        self.contents
            .read()
            .availability
            .missing_hashes(batch_size, excluding)
    }

    fn has_block(&self, block: BlockNr) -> bool {
        self.contents.read().availability.has_block(block)
    }

    fn has_hash(&self, block: BlockNr) -> bool {
        self.contents.read().availability.has_hash(block)
    }

    async fn read_hash(&self, block: BlockNr) -> Result<Bytes> {
        self.check_available()?;
        check_range(&self.layout, block)?;
        self.contents.read().hashes[block as usize]
            .clone()
            .ok_or_else(|| {
                EngineError::storage(StorageErrorKind::NotFound, format!("No hash for block {}", block))
            })
    }

    async fn read_block(&self, block: BlockNr) -> Result<Bytes> {
        self.check_available()?;
        check_range(&self.layout, block)?;
        let data = self.contents.read().blocks[block as usize].clone();
        let data = data.ok_or_else(|| {
            EngineError::storage(StorageErrorKind::NotFound, format!("No data for block {}", block))
        })?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn write_hash(&self, block: BlockNr, hash: Bytes) -> Result<()> {
        let _guard = InFlight::enter(&self.in_flight);
        self.delay_write().await;
        self.check_available()?;
        check_range(&self.layout, block)?;
        if hash.len() != self.layout.default_block.hash_size as usize {
            return Err(EngineError::protocol(
                ProtocolErrorKind::PeerProtocol,
                format!("Hash for block {} has {} bytes", block, hash.len()),
            ));
        }

        let mut contents = self.contents.write();
        contents.hashes[block as usize] = Some(hash);
        contents.availability.set_hash(block, true);
        Ok(())
    }

    async fn write_block(&self, block: BlockNr, data: Bytes) -> Result<()> {
        let _guard = InFlight::enter(&self.in_flight);
        self.block_writes.fetch_add(1, Ordering::SeqCst);
        self.delay_write().await;
        self.check_available()?;
        check_range(&self.layout, block)?;

        let fault = self.block_faults.lock().pop_front();
        match fault {
            Some(WriteFault::HashMismatch) => {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::HashMismatch,
                    format!("Injected hash mismatch for block {}", block),
                ))
            }
            Some(WriteFault::Io) => {
                return Err(EngineError::storage(
                    StorageErrorKind::Io,
                    format!("Injected I/O failure for block {}", block),
                ))
            }
            Some(WriteFault::Unavailable) => {
                return Err(EngineError::storage(
                    StorageErrorKind::Unavailable,
                    format!("Injected loss of medium for block {}", block),
                ))
            }
            None => {}
        }

        let mut contents = self.contents.write();
        verify_block(
            &self.layout,
            block,
            &data,
            contents.hashes[block as usize].as_ref(),
        )?;
        contents.blocks[block as usize] = Some(data);
        contents.availability.set_block(block, true);
        Ok(())
    }

    fn set_future_reads(&self, reader: ReaderId, hint: BTreeSet<BlockNr>) {
        self.cache.set_hint(reader, hint);
    }

    fn clean(&self, reader: ReaderId) {
        self.cache.clean(reader);
    }

    fn is_complete(&self) -> bool {
        self.contents.read().availability.is_complete()
    }

    fn file_pos(&self) -> u32 {
        self.contents.read().availability.blocks_stored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockDetails;

    fn layout() -> FileLayout {
        FileLayout::new(2 * 1024 + 100, BlockDetails::new(1024))
    }

    fn content() -> Vec<u8> {
        (0..(2 * 1024 + 100)).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_seeded_storage_is_complete() {
        let storage = MemoryStorage::seeded(layout(), &content());
        assert!(storage.is_complete());
        assert_eq!(storage.file_pos(), 3);
        let last = storage.read_block(2).await.unwrap();
        assert_eq!(last.len(), 100);
    }

    #[tokio::test]
    async fn test_write_requires_hash() {
        let storage = MemoryStorage::new(layout());
        let data = Bytes::from(content()[..1024].to_vec());
        let err = storage.write_block(0, data.clone()).await.unwrap_err();
        assert!(err.is_transient());

        storage.write_hash(0, hash_block(&data)).await.unwrap();
        storage.write_block(0, data).await.unwrap();
        assert!(storage.has_block(0));
        assert_eq!(storage.file_pos(), 1);
    }

    #[tokio::test]
    async fn test_write_rejects_bad_data() {
        let storage = MemoryStorage::new(layout());
        let data = Bytes::from(content()[..1024].to_vec());
        storage.write_hash(0, hash_block(&data)).await.unwrap();
        let err = storage
            .write_block(0, Bytes::from(vec![0u8; 1024]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol {
                kind: ProtocolErrorKind::HashMismatch,
                ..
            }
        ));
        assert!(!storage.has_block(0));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let storage = MemoryStorage::seeded(layout(), &content());
        storage.remove_block(1);
        storage.inject_block_faults(1, WriteFault::Io);
        let data = Bytes::from(content()[1024..2048].to_vec());
        assert!(storage.write_block(1, data.clone()).await.is_err());
        storage.write_block(1, data.clone()).await.unwrap();
        assert_eq!(storage.block_writes(), 2);

        storage.remove_block(1);
        storage.inject_block_faults(1, WriteFault::Unavailable);
        assert!(storage.write_block(1, data).await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_unavailable_is_fatal() {
        let storage = MemoryStorage::new(layout());
        storage.set_unavailable(true);
        let err = storage.read_hash(0).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_lists() {
        let storage = MemoryStorage::seeded(layout(), &content());
        storage.remove_block(0);
        storage.remove_hash(2);
        assert_eq!(
            storage.next_missing_blocks(10, &BTreeSet::new()),
            [0].into_iter().collect()
        );
        assert_eq!(
            storage.next_missing_hashes(10, &BTreeSet::new()),
            [2].into_iter().collect()
        );
        assert!(!storage.is_complete());
    }
}
