//! Storage Module
//!
//! The storage collaborator behind every block store: it persists blocks and
//! their hashes for one file, verifies blocks against known hashes, answers
//! "what is still missing", and serves reads with optional read-ahead.
//!
//! Backends:
//! - [`MemoryStorage`]: in-memory, with failure injection for tests
//! - [`FileStorage`]: one data file plus a hash sidecar on local disk
//! - [`MirroredStorage`]: a primary backend replicated onto mirrors

pub mod cache;
pub mod disk;
pub mod memory;
pub mod mirror;

pub use cache::ReadCache;
pub use disk::FileStorage;
pub use memory::{MemoryStorage, WriteFault};
pub use mirror::MirroredStorage;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::Bytes;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{EngineError, ProtocolErrorKind, Result, StorageErrorKind};
use crate::types::{hash_block, BlockNr, FileLayout};

/// Identifies one reader for read-ahead bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(pub u64);

/// Storage trait for the blocks and hashes of one file
///
/// Reads and writes are asynchronous and never block the caller. A block
/// write is hash-checked: it fails with [`ProtocolErrorKind::MissingHash`]
/// when the hash is not stored yet and with [`ProtocolErrorKind::HashMismatch`]
/// when the data does not match. Any other error is either transient I/O
/// ([`StorageErrorKind::Io`]) or fatal ([`StorageErrorKind::Unavailable`]).
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Geometry of the stored file
    fn layout(&self) -> FileLayout;

    /// Open the backend and load what is already stored
    async fn start(&self) -> Result<()>;

    /// Flush and release the backend
    async fn close(&self) -> Result<()>;

    /// True when no I/O is in flight
    fn is_idle(&self) -> bool;

    /// Up to `batch_size` missing blocks, lowest first, not in `excluding`
    fn next_missing_blocks(&self, batch_size: usize, excluding: &BTreeSet<BlockNr>)
        -> BTreeSet<BlockNr>;

    /// Up to `batch_size` missing hashes, lowest first, not in `excluding`
    fn next_missing_hashes(&self, batch_size: usize, excluding: &BTreeSet<BlockNr>)
        -> BTreeSet<BlockNr>;

    fn has_block(&self, block: BlockNr) -> bool;

    fn has_hash(&self, block: BlockNr) -> bool;

    async fn read_hash(&self, block: BlockNr) -> Result<Bytes>;

    async fn read_block(&self, block: BlockNr) -> Result<Bytes>;

    async fn write_hash(&self, block: BlockNr, hash: Bytes) -> Result<()>;

    async fn write_block(&self, block: BlockNr, data: Bytes) -> Result<()>;

    /// Advise that `reader` will soon read the hinted blocks
    fn set_future_reads(&self, reader: ReaderId, hint: BTreeSet<BlockNr>);

    /// Drop any read-ahead state held for `reader`
    fn clean(&self, reader: ReaderId);

    /// All blocks and hashes present
    fn is_complete(&self) -> bool;

    /// Number of blocks written so far
    fn file_pos(&self) -> u32;
}

/// Blocks and hashes known to be stored
#[derive(Debug, Clone)]
pub(crate) struct Availability {
    blocks: BitVec<u8, Msb0>,
    hashes: BitVec<u8, Msb0>,
}

impl Availability {
    pub(crate) fn empty(nr_blocks: u32) -> Self {
        Self {
            blocks: bitvec![u8, Msb0; 0; nr_blocks as usize],
            hashes: bitvec![u8, Msb0; 0; nr_blocks as usize],
        }
    }

    pub(crate) fn full(nr_blocks: u32) -> Self {
        Self {
            blocks: bitvec![u8, Msb0; 1; nr_blocks as usize],
            hashes: bitvec![u8, Msb0; 1; nr_blocks as usize],
        }
    }

    pub(crate) fn has_block(&self, block: BlockNr) -> bool {
        self.blocks.get(block as usize).map(|b| *b).unwrap_or(false)
    }

    pub(crate) fn has_hash(&self, block: BlockNr) -> bool {
        self.hashes.get(block as usize).map(|b| *b).unwrap_or(false)
    }

    pub(crate) fn set_block(&mut self, block: BlockNr, value: bool) {
        if let Some(mut bit) = self.blocks.get_mut(block as usize) {
            *bit = value;
        }
    }

    pub(crate) fn set_hash(&mut self, block: BlockNr, value: bool) {
        if let Some(mut bit) = self.hashes.get_mut(block as usize) {
            *bit = value;
        }
    }

    pub(crate) fn missing_blocks(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        Self::missing(&self.blocks, batch_size, excluding)
    }

    pub(crate) fn missing_hashes(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        Self::missing(&self.hashes, batch_size, excluding)
    }

    fn missing(
        bits: &BitSlice<u8, Msb0>,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        bits.iter_zeros()
            .map(|i| i as BlockNr)
            .filter(|block| !excluding.contains(block))
            .take(batch_size)
            .collect()
    }

    pub(crate) fn blocks_stored(&self) -> u32 {
        self.blocks.count_ones() as u32
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.blocks.all() && self.hashes.all()
    }
}

/// Check a block against its hash and the file geometry
pub(crate) fn verify_block(
    layout: &FileLayout,
    block: BlockNr,
    data: &[u8],
    expected: Option<&Bytes>,
) -> Result<()> {
    let expected = expected.ok_or_else(|| {
        EngineError::protocol(
            ProtocolErrorKind::MissingHash,
            format!("No hash stored for block {}", block),
        )
    })?;

    if data.len() != layout.block_len(block) {
        return Err(EngineError::protocol(
            ProtocolErrorKind::HashMismatch,
            format!(
                "Block {} has wrong size: expected {}, got {}",
                block,
                layout.block_len(block),
                data.len()
            ),
        ));
    }

    if hash_block(data) != *expected {
        return Err(EngineError::protocol(
            ProtocolErrorKind::HashMismatch,
            format!("Block {} failed hash verification", block),
        ));
    }

    Ok(())
}

/// Reject block numbers outside the file
pub(crate) fn check_range(layout: &FileLayout, block: BlockNr) -> Result<()> {
    if block >= layout.nr_blocks() {
        return Err(EngineError::storage(
            StorageErrorKind::OutOfRange,
            format!("Block {} outside file of {} blocks", block, layout.nr_blocks()),
        ));
    }
    Ok(())
}

/// Open the configured backend (plus mirrors) for one file
pub fn open_backend(
    config: &StorageConfig,
    relative_path: &Path,
    layout: FileLayout,
) -> Arc<dyn BlockStorage> {
    let primary: Arc<dyn BlockStorage> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStorage::new(layout)),
        StorageBackend::Disk => Arc::new(FileStorage::new(
            config.data_dir.join(relative_path),
            layout,
        )),
    };

    if config.mirrors.is_empty() {
        return primary;
    }

    let mirrors = config
        .mirrors
        .iter()
        .map(|dir| Arc::new(FileStorage::new(dir.join(relative_path), layout)) as Arc<dyn BlockStorage>)
        .collect();

    Arc::new(MirroredStorage::new(primary, mirrors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockDetails;

    #[test]
    fn test_missing_skips_excluded() {
        let mut availability = Availability::empty(10);
        availability.set_block(0, true);
        let excluding: BTreeSet<BlockNr> = [1, 2].into_iter().collect();
        let missing = availability.missing_blocks(3, &excluding);
        assert_eq!(missing, [3, 4, 5].into_iter().collect());
    }

    #[test]
    fn test_complete_needs_blocks_and_hashes() {
        let mut availability = Availability::empty(2);
        availability.set_block(0, true);
        availability.set_block(1, true);
        assert!(!availability.is_complete());
        availability.set_hash(0, true);
        availability.set_hash(1, true);
        assert!(availability.is_complete());
        assert_eq!(availability.blocks_stored(), 2);
    }

    #[test]
    fn test_verify_block() {
        let layout = FileLayout::new(1100, BlockDetails::new(1024));
        let data = vec![7u8; 76];
        let hash = hash_block(&data);

        assert!(verify_block(&layout, 1, &data, Some(&hash)).is_ok());

        let err = verify_block(&layout, 1, &data, None).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol {
                kind: ProtocolErrorKind::MissingHash,
                ..
            }
        ));

        let err = verify_block(&layout, 1, &[0u8; 76], Some(&hash)).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_check_range() {
        let layout = FileLayout::new(2048, BlockDetails::new(1024));
        assert!(check_range(&layout, 1).is_ok());
        assert!(check_range(&layout, 2).is_err());
    }
}
