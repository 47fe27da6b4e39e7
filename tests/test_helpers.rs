//! Test Helpers
//!
//! Builders for torrent content and manifests, in-memory managers for both
//! sides of a transfer, and nodes wired onto a shared channel network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gosh_swarm::{
    BlockDetails, BlockStorage, ChannelNetwork, ChannelTransport, FileId, FileLayout,
    FileTransferManager, MemoryStorage, SessionRegistry, TorrentId, TorrentManifest,
    TransferConfig, TransferEvent,
};
use sha1::{Digest, Sha1};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Builder for creating test torrent data
pub struct TestTorrentBuilder {
    name: String,
    block_size: u32,
    files: Vec<TestFile>,
}

/// A file in the test torrent
struct TestFile {
    name: String,
    content: Vec<u8>,
}

impl TestTorrentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block_size: 1024,
            files: Vec::new(),
        }
    }

    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    pub fn add_file(mut self, name: impl Into<String>, content: Vec<u8>) -> Self {
        self.files.push(TestFile {
            name: name.into(),
            content,
        });
        self
    }

    /// Single file of patterned content
    pub fn single_file(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        Self::new(&name).add_file(&name, patterned(size, 0))
    }

    /// Three files, the last with an irregular final block
    pub fn multi_file(name: impl Into<String>) -> Self {
        Self::new(name)
            .add_file("file1.bin", patterned(8 * 1024, 1))
            .add_file("file2.bin", patterned(20 * 1024, 2))
            .add_file("subdir/file3.bin", patterned(5 * 1024 + 333, 3))
    }

    pub fn torrent_id(&self) -> TorrentId {
        TorrentId::from_name(&self.name)
    }

    pub fn manifest(&self) -> TorrentManifest {
        let mut manifest = TorrentManifest::new(self.torrent_id());
        for file in &self.files {
            manifest.add_file(
                file.name.clone(),
                FileLayout::new(file.content.len() as u64, BlockDetails::new(self.block_size)),
            );
        }
        manifest
    }

    pub fn content(&self, name: &str) -> &[u8] {
        self.files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.content.as_slice())
            .unwrap_or(&[])
    }

    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    /// SHA-1 of every block of `name`
    pub fn block_hashes(&self, name: &str) -> Vec<[u8; 20]> {
        self.content(name)
            .chunks(self.block_size as usize)
            .map(|block| {
                let mut hasher = Sha1::new();
                hasher.update(block);
                hasher.finalize().into()
            })
            .collect()
    }

    /// Manager holding every file, backed by memory
    pub fn seeder_manager(&self, config: TransferConfig) -> FileTransferManager {
        FileTransferManager::new(&self.manifest(), config, true, |file| {
            let storage: Arc<dyn BlockStorage> =
                Arc::new(MemoryStorage::seeded(file.layout, self.content(&file.name)));
            Ok(storage)
        })
        .expect("seeder manager")
    }

    /// Manager holding nothing yet, backed by memory
    pub fn leecher_manager(&self, config: TransferConfig) -> FileTransferManager {
        FileTransferManager::new(&self.manifest(), config, false, |file| {
            let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new(file.layout));
            Ok(storage)
        })
        .expect("leecher manager")
    }
}

/// Deterministic content that differs per file
pub fn patterned(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| ((i % 251) as u8).wrapping_add(seed.wrapping_mul(31)))
        .collect()
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// One node of a test swarm
pub struct TestNode {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub transport: ChannelTransport,
}

impl TestNode {
    pub fn manager(&self) -> &Arc<FileTransferManager> {
        self.registry.manager()
    }
}

/// Start `manager` and attach a registry to `network` at `addr`
pub async fn spawn_node(
    network: &ChannelNetwork,
    addr: SocketAddr,
    manager: FileTransferManager,
) -> TestNode {
    manager.start().await.expect("start manager");
    let (transport, inbound) = network.endpoint(addr);
    let registry = SessionRegistry::new(Arc::new(manager), Arc::new(transport.clone()));
    registry.attach(inbound);
    TestNode {
        addr,
        registry,
        transport,
    }
}

/// Wait for an event matching `predicate`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<TransferEvent>,
    predicate: F,
    timeout_duration: Duration,
) -> Option<TransferEvent>
where
    F: Fn(&TransferEvent) -> bool,
{
    let result = timeout(timeout_duration, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;
    result.unwrap_or(None)
}

/// Read every block of `file` back out of `manager`
pub async fn read_file(manager: &FileTransferManager, file: FileId) -> Vec<u8> {
    let view = manager.read_from(file).expect("readable file");
    let mut content = Vec::new();
    for nr in 0..view.layout().nr_blocks() {
        let block = view.read_block(nr).await.expect("stored block");
        content.extend_from_slice(&block);
    }
    content
}
