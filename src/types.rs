//! Core types for gosh-swarm
//!
//! Identifiers, block geometry and per-file state shared by the storage,
//! transfer and session layers.

use std::fmt;
use std::net::SocketAddr;
use std::ops::Range;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Index of a block within a file
pub type BlockNr = u32;

/// Request/response correlation id
pub type MsgId = u64;

/// Size of a SHA-1 block hash in bytes
pub const HASH_SIZE: u32 = 20;

/// Opaque identifier for a distribution swarm
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TorrentId([u8; 20]);

impl TorrentId {
    /// Create from raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Derive an id from a human-readable name (SHA-1 of the name)
    pub fn from_name(name: &str) -> Self {
        Self(Sha1::digest(name.as_bytes()).into())
    }

    /// Parse a 40-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TorrentId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A file within a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    pub torrent: TorrentId,
    pub index: u32,
}

impl FileId {
    pub fn new(torrent: TorrentId, index: u32) -> Self {
        Self { torrent, index }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", &self.torrent.to_hex()[..8], self.index)
    }
}

/// Shape of a block: size of the block, of its pieces, and of its hash.
///
/// A file has one default shape; only the final block may differ, and its
/// `block_size` is never larger than the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDetails {
    pub block_size: u32,
    pub piece_size: u32,
    pub hash_size: u32,
}

impl BlockDetails {
    /// Default shape with a SHA-1 hash and one piece per block
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            piece_size: block_size,
            hash_size: HASH_SIZE,
        }
    }

    /// Number of pieces that make up this block
    pub fn nr_pieces(&self) -> u32 {
        if self.piece_size == 0 {
            return 0;
        }
        self.block_size.div_ceil(self.piece_size)
    }
}

/// Geometry of one file: its length and its default block shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    pub length: u64,
    pub default_block: BlockDetails,
}

impl FileLayout {
    pub fn new(length: u64, default_block: BlockDetails) -> Self {
        Self {
            length,
            default_block,
        }
    }

    /// `ceil(length / block_size)`
    pub fn nr_blocks(&self) -> u32 {
        if self.default_block.block_size == 0 {
            return 0;
        }
        self.length.div_ceil(self.default_block.block_size as u64) as u32
    }

    /// Index of the final block, if the file has any
    pub fn last_block(&self) -> Option<BlockNr> {
        self.nr_blocks().checked_sub(1)
    }

    pub fn is_last(&self, block: BlockNr) -> bool {
        self.last_block() == Some(block)
    }

    /// Byte range covered by a block
    pub fn block_range(&self, block: BlockNr) -> Range<u64> {
        let size = self.default_block.block_size as u64;
        let start = block as u64 * size;
        let end = (start + size).min(self.length);
        start..end
    }

    /// Length in bytes of a block
    pub fn block_len(&self, block: BlockNr) -> usize {
        let range = self.block_range(block);
        range.end.saturating_sub(range.start) as usize
    }

    /// Shape of the final block
    pub fn last_block_details(&self) -> Option<BlockDetails> {
        let last = self.last_block()?;
        let block_size = self.block_len(last) as u32;
        Some(BlockDetails {
            block_size,
            piece_size: self.default_block.piece_size.min(block_size),
            hash_size: self.default_block.hash_size,
        })
    }

    /// Irregular shape of `block`, if it differs from the default
    pub fn irregular_details(&self, block: BlockNr) -> Option<BlockDetails> {
        if !self.is_last(block) {
            return None;
        }
        self.last_block_details()
            .filter(|details| *details != self.default_block)
    }

    /// Shape of any block in the file
    pub fn block_details(&self, block: BlockNr) -> BlockDetails {
        self.irregular_details(block).unwrap_or(self.default_block)
    }
}

/// Compute the hash of a block's bytes
pub fn hash_block(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(Sha1::digest(data).as_slice())
}

/// Transfer state of a file within a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Not yet started
    Pending,
    /// Being downloaded or seeded
    Ongoing,
    /// All blocks and hashes present
    Complete,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ongoing => write!(f, "ongoing"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Which side of a transfer a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// This node downloads from the peer
    Leecher,
    /// This node serves the peer
    Seeder,
}

impl Role {
    /// Role of the remote end of a session
    pub fn opposite(self) -> Self {
        match self {
            Self::Leecher => Self::Seeder,
            Self::Seeder => Self::Leecher,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leecher => write!(f, "leecher"),
            Self::Seeder => write!(f, "seeder"),
        }
    }
}

/// Identity of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId {
    pub file: FileId,
    pub peer: SocketAddr,
    pub role: Role,
}

impl HandleId {
    pub fn new(file: FileId, peer: SocketAddr, role: Role) -> Self {
        Self { file, peer, role }
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}[{}]", self.file, self.peer, self.role)
    }
}

/// Monotonic progress snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub total_size: u64,
    pub current_size: u64,
}

impl TransferReport {
    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.current_size as f64 / self.total_size as f64) * 100.0
    }

    pub fn merge(self, other: TransferReport) -> TransferReport {
        TransferReport {
            total_size: self.total_size + other.total_size,
            current_size: self.current_size + other.current_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_block_count() {
        let layout = FileLayout::new(101 * 1024 - 924, BlockDetails::new(1024));
        assert_eq!(layout.nr_blocks(), 101);
        assert_eq!(layout.last_block(), Some(100));
        assert_eq!(layout.block_len(100), 100);
        assert_eq!(layout.block_len(99), 1024);
    }

    #[test]
    fn test_irregular_last_block() {
        let layout = FileLayout::new(2 * 1024 + 100, BlockDetails::new(1024));
        assert_eq!(layout.irregular_details(1), None);
        let last = layout.irregular_details(2).unwrap();
        assert_eq!(last.block_size, 100);
        assert_eq!(last.piece_size, 100);
    }

    #[test]
    fn test_regular_last_block_is_not_irregular() {
        let layout = FileLayout::new(4096, BlockDetails::new(1024));
        assert_eq!(layout.nr_blocks(), 4);
        assert_eq!(layout.irregular_details(3), None);
    }

    #[test]
    fn test_empty_file() {
        let layout = FileLayout::new(0, BlockDetails::new(1024));
        assert_eq!(layout.nr_blocks(), 0);
        assert_eq!(layout.last_block(), None);
    }

    #[test]
    fn test_torrent_id_hex() {
        let id = TorrentId::from_name("movie");
        assert_eq!(TorrentId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(TorrentId::from_hex("zz"), None);
    }

    #[test]
    fn test_hash_block_size() {
        assert_eq!(hash_block(b"abc").len(), HASH_SIZE as usize);
    }

    #[test]
    fn test_report_percentage() {
        let report = TransferReport {
            total_size: 200,
            current_size: 50,
        };
        assert_eq!(report.percentage(), 25.0);
    }
}
