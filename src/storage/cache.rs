//! Read-ahead cache
//!
//! Holds blocks prefetched on behalf of specific readers. A reader announces
//! the blocks it expects to read; the backend prefetches them and later reads
//! are served from here. Entries are dropped when the reader is cleaned or
//! when its hint moves past them.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;

use super::ReaderId;
use crate::types::BlockNr;

#[derive(Debug, Default)]
struct ReaderCache {
    hint: BTreeSet<BlockNr>,
    blocks: HashMap<BlockNr, Bytes>,
}

/// Per-reader block cache
#[derive(Debug)]
pub struct ReadCache {
    readers: Mutex<HashMap<ReaderId, ReaderCache>>,
    max_blocks_per_reader: usize,
}

impl ReadCache {
    pub fn new(max_blocks_per_reader: usize) -> Self {
        Self {
            readers: Mutex::new(HashMap::new()),
            max_blocks_per_reader,
        }
    }

    /// Replace a reader's hint; returns the blocks that still need fetching
    pub fn set_hint(&self, reader: ReaderId, hint: BTreeSet<BlockNr>) -> Vec<BlockNr> {
        let mut readers = self.readers.lock();
        let entry = readers.entry(reader).or_default();
        let hint: BTreeSet<BlockNr> = hint.into_iter().take(self.max_blocks_per_reader).collect();
        entry.blocks.retain(|block, _| hint.contains(block));
        let to_fetch = hint
            .iter()
            .filter(|block| !entry.blocks.contains_key(block))
            .copied()
            .collect();
        entry.hint = hint;
        to_fetch
    }

    /// Store a prefetched block if the reader still wants it
    pub fn insert(&self, reader: ReaderId, block: BlockNr, data: Bytes) {
        let mut readers = self.readers.lock();
        if let Some(entry) = readers.get_mut(&reader) {
            if entry.hint.contains(&block) {
                entry.blocks.insert(block, data);
            }
        }
    }

    /// Look up a block prefetched for any reader
    pub fn get(&self, block: BlockNr) -> Option<Bytes> {
        let readers = self.readers.lock();
        readers
            .values()
            .find_map(|entry| entry.blocks.get(&block).cloned())
    }

    /// Forget a reader and its blocks
    pub fn clean(&self, reader: ReaderId) {
        self.readers.lock().remove(&reader);
    }

    /// Hint currently registered for a reader
    pub fn hint(&self, reader: ReaderId) -> BTreeSet<BlockNr> {
        self.readers
            .lock()
            .get(&reader)
            .map(|entry| entry.hint.clone())
            .unwrap_or_default()
    }

    /// Readers with a registered hint
    pub fn readers(&self) -> usize {
        self.readers.lock().len()
    }

    pub fn cached_blocks(&self) -> usize {
        self.readers.lock().values().map(|entry| entry.blocks.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_and_insert() {
        let cache = ReadCache::new(8);
        let reader = ReaderId(1);
        let to_fetch = cache.set_hint(reader, [1, 2, 3].into_iter().collect());
        assert_eq!(to_fetch, vec![1, 2, 3]);

        cache.insert(reader, 2, Bytes::from_static(b"two"));
        cache.insert(reader, 9, Bytes::from_static(b"not hinted"));
        assert_eq!(cache.get(2), Some(Bytes::from_static(b"two")));
        assert_eq!(cache.get(9), None);

        let to_fetch = cache.set_hint(reader, [2, 3, 4].into_iter().collect());
        assert_eq!(to_fetch, vec![3, 4]);
    }

    #[test]
    fn test_moving_hint_drops_old_blocks() {
        let cache = ReadCache::new(8);
        let reader = ReaderId(1);
        cache.set_hint(reader, [1].into_iter().collect());
        cache.insert(reader, 1, Bytes::from_static(b"one"));
        cache.set_hint(reader, [5].into_iter().collect());
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn test_clean() {
        let cache = ReadCache::new(8);
        let reader = ReaderId(3);
        cache.set_hint(reader, [1].into_iter().collect());
        cache.insert(reader, 1, Bytes::from_static(b"one"));
        cache.clean(reader);
        assert_eq!(cache.cached_blocks(), 0);
        assert_eq!(cache.readers(), 0);
        assert!(cache.hint(reader).is_empty());
    }

    #[test]
    fn test_hint_is_capped() {
        let cache = ReadCache::new(2);
        let to_fetch = cache.set_hint(ReaderId(1), (0..10).collect());
        assert_eq!(to_fetch.len(), 2);
    }
}
