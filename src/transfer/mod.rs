//! Transfer Module
//!
//! Per-file block stores and the per-torrent manager that sequences files
//! through pending, ongoing and complete.

pub mod block_store;
pub mod manager;

pub use block_store::{BlockOutcome, CompleteFile, IncompleteFile};
pub use manager::{FileTransferManager, ManifestFile, TorrentManifest};
