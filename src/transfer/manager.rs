//! Per-torrent file sequencing
//!
//! Owns one block store per file of a torrent and moves files through
//! `pending -> ongoing -> complete`. Seeded files start complete; leeched
//! files start pending and are opened a few at a time via
//! [`FileTransferManager::next_pending`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::block_store::{progress, CompleteFile, IncompleteFile};
use crate::config::TransferConfig;
use crate::error::{EngineError, Result};
use crate::storage::{open_backend, BlockStorage, FileStorage};
use crate::types::{FileId, FileLayout, FileState, TorrentId, TransferReport};

/// One file declared by a torrent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub id: FileId,
    pub layout: FileLayout,
}

/// Ordered list of files making up a torrent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentManifest {
    pub id: TorrentId,
    pub files: Vec<ManifestFile>,
}

impl TorrentManifest {
    pub fn new(id: TorrentId) -> Self {
        Self {
            id,
            files: Vec::new(),
        }
    }

    /// Append a file; ids are assigned in declaration order
    pub fn add_file(&mut self, name: impl Into<String>, layout: FileLayout) -> FileId {
        let id = FileId::new(self.id, self.files.len() as u32);
        self.files.push(ManifestFile {
            name: name.into(),
            id,
            layout,
        });
        id
    }

    /// Builder form of [`add_file`](Self::add_file)
    pub fn with_file(mut self, name: impl Into<String>, layout: FileLayout) -> Self {
        self.add_file(name, layout);
        self
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.files.iter().find(|f| f.name == name).map(|f| f.id)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.layout.length).sum()
    }
}

enum FileSlot {
    Pending(Arc<dyn BlockStorage>),
    Ongoing(Arc<IncompleteFile>),
    Complete(Arc<CompleteFile>),
}

impl FileSlot {
    fn state(&self) -> FileState {
        match self {
            Self::Pending(_) => FileState::Pending,
            Self::Ongoing(_) => FileState::Ongoing,
            Self::Complete(_) => FileState::Complete,
        }
    }

    fn storage_report(&self, layout: &FileLayout) -> TransferReport {
        match self {
            Self::Pending(storage) => progress(layout, storage.as_ref()),
            Self::Ongoing(file) => file.report(),
            Self::Complete(file) => file.report(),
        }
    }
}

struct Inner {
    slots: HashMap<FileId, FileSlot>,
    pending: BTreeSet<FileId>,
    ongoing: BTreeSet<FileId>,
}

/// Block stores for every file of one torrent
pub struct FileTransferManager {
    torrent: TorrentId,
    config: TransferConfig,
    layouts: BTreeMap<FileId, FileLayout>,
    names: BTreeMap<String, FileId>,
    inner: RwLock<Inner>,
}

impl FileTransferManager {
    /// Wire one block store per manifest file using `open` for storage
    pub fn new<F>(
        manifest: &TorrentManifest,
        config: TransferConfig,
        seeding: bool,
        mut open: F,
    ) -> Result<Self>
    where
        F: FnMut(&ManifestFile) -> Result<Arc<dyn BlockStorage>>,
    {
        config.validate()?;

        let mut slots = HashMap::new();
        let mut pending = BTreeSet::new();
        let mut layouts = BTreeMap::new();
        let mut names = BTreeMap::new();

        for file in &manifest.files {
            if names.insert(file.name.clone(), file.id).is_some() {
                return Err(EngineError::AlreadyExists(file.name.clone()));
            }
            layouts.insert(file.id, file.layout);

            let storage = open(file)?;
            let slot = if seeding {
                FileSlot::Complete(Arc::new(CompleteFile::new(
                    file.id,
                    storage,
                    config.store.read_ahead_blocks,
                )))
            } else {
                pending.insert(file.id);
                FileSlot::Pending(storage)
            };
            slots.insert(file.id, slot);
        }

        Ok(Self {
            torrent: manifest.id,
            config,
            layouts,
            names,
            inner: RwLock::new(Inner {
                slots,
                pending,
                ongoing: BTreeSet::new(),
            }),
        })
    }

    /// Open storage for every file through the configured backend
    ///
    /// Files are stored under `<torrent hex>/<file name>`.
    pub fn with_backend(
        manifest: &TorrentManifest,
        config: TransferConfig,
        seeding: bool,
    ) -> Result<Self> {
        let storage_config = config.storage.clone();
        let torrent_dir = PathBuf::from(manifest.id.to_hex());
        Self::new(manifest, config, seeding, |file| {
            let relative = PathBuf::from(&file.name);
            FileStorage::validate_relative_path(&relative)?;
            Ok(open_backend(
                &storage_config,
                &torrent_dir.join(relative),
                file.layout,
            ))
        })
    }

    pub fn torrent(&self) -> TorrentId {
        self.torrent
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.names.get(name).copied()
    }

    pub fn layout(&self, file: FileId) -> Option<FileLayout> {
        self.layouts.get(&file).copied()
    }

    pub fn files(&self) -> Vec<FileId> {
        self.layouts.keys().copied().collect()
    }

    /// Start every storage backend
    ///
    /// Pending files whose data is already complete (resumed from a previous
    /// run) are promoted straight to complete.
    pub async fn start(&self) -> Result<()> {
        for storage in self.storages() {
            storage.start().await?;
        }

        let mut inner = self.inner.write();
        let resumed: Vec<FileId> = inner
            .pending
            .iter()
            .filter(|id| {
                matches!(inner.slots.get(*id), Some(FileSlot::Pending(storage)) if storage.is_complete())
            })
            .copied()
            .collect();
        for id in resumed {
            inner.pending.remove(&id);
            if let Some(FileSlot::Pending(storage)) = inner.slots.remove(&id) {
                tracing::info!("File {} already complete", id);
                inner.slots.insert(
                    id,
                    FileSlot::Complete(Arc::new(CompleteFile::new(
                        id,
                        storage,
                        self.config.store.read_ahead_blocks,
                    ))),
                );
            }
        }
        Ok(())
    }

    /// Close every storage backend, waiting for in-flight writes
    pub async fn close(&self) -> Result<()> {
        let ongoing: Vec<Arc<IncompleteFile>> = {
            let inner = self.inner.read();
            inner
                .slots
                .values()
                .filter_map(|slot| match slot {
                    FileSlot::Ongoing(file) => Some(Arc::clone(file)),
                    _ => None,
                })
                .collect()
        };
        for file in ongoing {
            file.wait_idle().await;
        }
        for storage in self.storages() {
            storage.close().await?;
        }
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.read();
        inner.slots.values().all(|slot| match slot {
            FileSlot::Pending(storage) => storage.is_idle(),
            FileSlot::Ongoing(file) => file.is_idle(),
            FileSlot::Complete(file) => file.is_idle(),
        })
    }

    fn storages(&self) -> Vec<Arc<dyn BlockStorage>> {
        // one handle per file, whatever its state
        let inner = self.inner.read();
        let mut storages = Vec::with_capacity(inner.slots.len());
        for slot in inner.slots.values() {
            match slot {
                FileSlot::Pending(storage) => storages.push(Arc::clone(storage)),
                FileSlot::Ongoing(file) => storages.push(file.storage()),
                FileSlot::Complete(file) => storages.push(file.storage()),
            }
        }
        storages
    }

    /// Open the lowest pending file, if the ongoing limit allows
    pub fn next_pending(&self) -> Option<FileId> {
        let mut inner = self.inner.write();
        if inner.ongoing.len() >= self.config.max_ongoing_files {
            return None;
        }
        let id = inner.pending.pop_first()?;
        Self::open_file(&mut inner, id, &self.config);
        Some(id)
    }

    /// Open a specific pending file; a no-op for ongoing files
    pub fn activate(&self, file: FileId) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.slots.get(&file).map(FileSlot::state) {
            None => Err(EngineError::NotFound(file.to_string())),
            Some(FileState::Ongoing) => Ok(()),
            Some(FileState::Complete) => Err(EngineError::invalid_state("activate", "complete")),
            Some(FileState::Pending) => {
                inner.pending.remove(&file);
                Self::open_file(&mut inner, file, &self.config);
                Ok(())
            }
        }
    }

    fn open_file(inner: &mut Inner, id: FileId, config: &TransferConfig) {
        if let Some(FileSlot::Pending(storage)) = inner.slots.remove(&id) {
            let file = IncompleteFile::new(id, storage, config.store.clone());
            inner.slots.insert(id, FileSlot::Ongoing(Arc::new(file)));
            inner.ongoing.insert(id);
            tracing::debug!("File {} is now ongoing", id);
        }
    }

    /// Read view of a file: complete files, or what an ongoing file has so far
    pub fn read_from(&self, file: FileId) -> Result<Arc<CompleteFile>> {
        let inner = self.inner.read();
        match inner.slots.get(&file) {
            None => Err(EngineError::NotFound(file.to_string())),
            Some(FileSlot::Complete(view)) => Ok(Arc::clone(view)),
            Some(FileSlot::Ongoing(store)) => Ok(Arc::new(store.reader())),
            Some(FileSlot::Pending(_)) => Err(EngineError::invalid_state("read", "pending")),
        }
    }

    /// Write view of an ongoing file
    pub fn write_to(&self, file: FileId) -> Result<Arc<IncompleteFile>> {
        let inner = self.inner.read();
        match inner.slots.get(&file) {
            None => Err(EngineError::NotFound(file.to_string())),
            Some(FileSlot::Ongoing(store)) => Ok(Arc::clone(store)),
            Some(slot) => Err(EngineError::invalid_state("write", slot.state())),
        }
    }

    /// Promote an ongoing file whose data is complete
    ///
    /// Returns `true` only for the call that performed the promotion.
    pub fn complete_file(&self, file: FileId) -> Result<bool> {
        let mut inner = self.inner.write();
        let view = match inner.slots.get(&file) {
            None => return Err(EngineError::NotFound(file.to_string())),
            Some(FileSlot::Ongoing(store)) if store.is_complete() => store.complete()?,
            Some(_) => return Ok(false),
        };
        inner.ongoing.remove(&file);
        inner.slots.insert(file, FileSlot::Complete(Arc::new(view)));
        tracing::info!("File {} complete", file);
        Ok(true)
    }

    pub fn state(&self, file: FileId) -> Option<FileState> {
        self.inner.read().slots.get(&file).map(FileSlot::state)
    }

    /// Every file is complete
    pub fn complete(&self) -> bool {
        let inner = self.inner.read();
        inner.pending.is_empty() && inner.ongoing.is_empty()
    }

    pub fn has_ongoing(&self) -> bool {
        !self.inner.read().ongoing.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.read().pending.is_empty()
    }

    pub fn ongoing(&self) -> Vec<FileId> {
        self.inner.read().ongoing.iter().copied().collect()
    }

    pub fn file_report(&self, file: FileId) -> Option<TransferReport> {
        let layout = self.layouts.get(&file)?;
        let inner = self.inner.read();
        inner.slots.get(&file).map(|slot| slot.storage_report(layout))
    }

    /// Progress summed over every file
    pub fn report(&self) -> TransferReport {
        let inner = self.inner.read();
        self.layouts
            .iter()
            .filter_map(|(id, layout)| inner.slots.get(id).map(|slot| slot.storage_report(layout)))
            .fold(TransferReport::default(), TransferReport::merge)
    }
}
