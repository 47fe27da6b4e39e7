//! Mirrored storage
//!
//! Replicates writes from a primary backend onto mirrors and fails reads
//! over to mirrors when the primary cannot serve them. A mirror that fails
//! repeatedly is disabled for the rest of the session.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{BlockStorage, ReaderId};
use crate::error::Result;
use crate::types::{BlockNr, FileLayout};

/// Consecutive failures before a mirror is disabled
const MAX_MIRROR_FAILURES: u32 = 3;

/// Primary backend plus replicas
pub struct MirroredStorage {
    primary: Arc<dyn BlockStorage>,
    mirrors: Vec<Arc<dyn BlockStorage>>,
    failure_counts: RwLock<Vec<u32>>,
}

impl MirroredStorage {
    pub fn new(primary: Arc<dyn BlockStorage>, mirrors: Vec<Arc<dyn BlockStorage>>) -> Self {
        let len = mirrors.len();
        Self {
            primary,
            mirrors,
            failure_counts: RwLock::new(vec![0; len]),
        }
    }

    /// Indices of mirrors still in use
    pub fn active_mirrors(&self) -> Vec<usize> {
        let counts = self.failure_counts.read();
        (0..self.mirrors.len())
            .filter(|&i| counts[i] < MAX_MIRROR_FAILURES)
            .collect()
    }

    fn record(&self, index: usize, ok: bool) {
        let mut counts = self.failure_counts.write();
        if ok {
            counts[index] = 0;
            return;
        }
        counts[index] += 1;
        if counts[index] == MAX_MIRROR_FAILURES {
            tracing::warn!("Disabling storage mirror {} after {} failures", index, MAX_MIRROR_FAILURES);
        }
    }

    fn disable(&self, index: usize) {
        self.failure_counts.write()[index] = MAX_MIRROR_FAILURES;
    }
}

#[async_trait]
impl BlockStorage for MirroredStorage {
    fn layout(&self) -> FileLayout {
        self.primary.layout()
    }

    async fn start(&self) -> Result<()> {
        self.primary.start().await?;
        for (i, mirror) in self.mirrors.iter().enumerate() {
            if let Err(e) = mirror.start().await {
                tracing::warn!("Storage mirror {} failed to start: {}", i, e);
                self.disable(i);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for i in self.active_mirrors() {
            if let Err(e) = self.mirrors[i].close().await {
                tracing::warn!("Storage mirror {} failed to close: {}", i, e);
            }
        }
        self.primary.close().await
    }

    fn is_idle(&self) -> bool {
        self.primary.is_idle() && self.mirrors.iter().all(|m| m.is_idle())
    }

    fn next_missing_blocks(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        self.primary.next_missing_blocks(batch_size, excluding)
    }

    fn next_missing_hashes(
        &self,
        batch_size: usize,
        excluding: &BTreeSet<BlockNr>,
    ) -> BTreeSet<BlockNr> {
        self.primary.next_missing_hashes(batch_size, excluding)
    }

    fn has_block(&self, block: BlockNr) -> bool {
        self.primary.has_block(block)
    }

    fn has_hash(&self, block: BlockNr) -> bool {
        self.primary.has_hash(block)
    }

    async fn read_hash(&self, block: BlockNr) -> Result<Bytes> {
        match self.primary.read_hash(block).await {
            Ok(hash) => Ok(hash),
            Err(primary_err) => {
                for i in self.active_mirrors() {
                    if let Ok(hash) = self.mirrors[i].read_hash(block).await {
                        return Ok(hash);
                    }
                }
                Err(primary_err)
            }
        }
    }

    async fn read_block(&self, block: BlockNr) -> Result<Bytes> {
        match self.primary.read_block(block).await {
            Ok(data) => Ok(data),
            Err(primary_err) => {
                for i in self.active_mirrors() {
                    if !self.mirrors[i].has_block(block) {
                        continue;
                    }
                    match self.mirrors[i].read_block(block).await {
                        Ok(data) => {
                            tracing::debug!("Block {} served from mirror {}", block, i);
                            return Ok(data);
                        }
                        Err(_) => self.record(i, false),
                    }
                }
                Err(primary_err)
            }
        }
    }

    async fn write_hash(&self, block: BlockNr, hash: Bytes) -> Result<()> {
        self.primary.write_hash(block, hash.clone()).await?;
        for i in self.active_mirrors() {
            let ok = self.mirrors[i].write_hash(block, hash.clone()).await.is_ok();
            self.record(i, ok);
        }
        Ok(())
    }

    async fn write_block(&self, block: BlockNr, data: Bytes) -> Result<()> {
        self.primary.write_block(block, data.clone()).await?;
        for i in self.active_mirrors() {
            let ok = self.mirrors[i].write_block(block, data.clone()).await.is_ok();
            self.record(i, ok);
        }
        Ok(())
    }

    fn set_future_reads(&self, reader: ReaderId, hint: BTreeSet<BlockNr>) {
        self.primary.set_future_reads(reader, hint);
    }

    fn clean(&self, reader: ReaderId) {
        self.primary.clean(reader);
        for mirror in &self.mirrors {
            mirror.clean(reader);
        }
    }

    fn is_complete(&self) -> bool {
        self.primary.is_complete()
    }

    fn file_pos(&self) -> u32 {
        self.primary.file_pos()
    }
}
