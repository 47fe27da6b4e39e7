//! Session message families
//!
//! - [`PeerMessage`]: exchanged with the remote peer over a transport
//! - [`SessionInput`]: delivered to a session by its owner
//! - [`SessionNotice`]: reported by a session to its owner
//! - [`TransferEvent`]: broadcast to subscribers of a registry

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{BlockDetails, BlockNr, FileId, HandleId, MsgId, Role, TorrentId, TransferReport};

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Handshake in progress
    SettingUp,
    /// Exchanging blocks
    Active,
    /// Waiting for in-flight I/O before closing
    ShuttingDown,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SettingUp => write!(f, "setting up"),
            Self::Active => write!(f, "active"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Messages exchanged between a leecher and a seeder
///
/// Requests carry a message id; the response echoes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    SetupReq {
        file: FileId,
        msg_id: MsgId,
        with_hashes: bool,
    },
    SetupResp {
        file: FileId,
        msg_id: MsgId,
        default_block: BlockDetails,
        length: u64,
        with_hashes: bool,
    },
    BlocksReq {
        file: FileId,
        msg_id: MsgId,
        blocks: BTreeSet<BlockNr>,
        /// Hashes requested on their own
        hashes: BTreeSet<BlockNr>,
        /// Also send the hash of every requested block
        with_hashes: bool,
        cache_hint: BTreeSet<BlockNr>,
    },
    BlocksResp {
        file: FileId,
        msg_id: MsgId,
        hashes: BTreeMap<BlockNr, Bytes>,
        blocks: BTreeMap<BlockNr, Bytes>,
        irregular_blocks: BTreeMap<BlockNr, BlockDetails>,
    },
    Shutdown {
        file: FileId,
        from: Role,
    },
    ShutdownAck {
        file: FileId,
        from: Role,
    },
}

impl PeerMessage {
    pub fn file(&self) -> FileId {
        match self {
            Self::SetupReq { file, .. }
            | Self::SetupResp { file, .. }
            | Self::BlocksReq { file, .. }
            | Self::BlocksResp { file, .. }
            | Self::Shutdown { file, .. }
            | Self::ShutdownAck { file, .. } => *file,
        }
    }

    /// Role of the local session that handles this message
    pub fn target_role(&self) -> Role {
        match self {
            Self::SetupReq { .. } | Self::BlocksReq { .. } => Role::Seeder,
            Self::SetupResp { .. } | Self::BlocksResp { .. } => Role::Leecher,
            Self::Shutdown { from, .. } | Self::ShutdownAck { from, .. } => from.opposite(),
        }
    }

    pub fn msg_id(&self) -> Option<MsgId> {
        match self {
            Self::SetupReq { msg_id, .. }
            | Self::SetupResp { msg_id, .. }
            | Self::BlocksReq { msg_id, .. }
            | Self::BlocksResp { msg_id, .. } => Some(*msg_id),
            Self::Shutdown { .. } | Self::ShutdownAck { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SetupReq { .. } => "SetupReq",
            Self::SetupResp { .. } => "SetupResp",
            Self::BlocksReq { .. } => "BlocksReq",
            Self::BlocksResp { .. } => "BlocksResp",
            Self::Shutdown { .. } => "Shutdown",
            Self::ShutdownAck { .. } => "ShutdownAck",
        }
    }
}

/// Input delivered to a running session
#[derive(Debug, Clone)]
pub enum SessionInput {
    Peer(PeerMessage),
    /// Window delta to apply
    CwndControl(i64),
    /// Cap on blocks held in flight
    MemSet(usize),
    Shutdown,
}

/// Activity summary emitted periodically by a session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionReport {
    pub progress: TransferReport,
    pub cwnd: u32,
    pub blocks_in_flight: usize,
    pub blocks_transferred: u64,
    pub queuing_delay: Option<Duration>,
}

/// Reported by a session to its owner
#[derive(Debug, Clone)]
pub enum SessionNotice {
    StateChanged {
        handle: HandleId,
        state: SessionState,
    },
    Report {
        handle: HandleId,
        report: SessionReport,
    },
    /// Consecutive request timeouts reached the health threshold
    Unhealthy {
        handle: HandleId,
        consecutive_timeouts: u32,
    },
    FileComplete {
        handle: HandleId,
    },
    Closed {
        handle: HandleId,
        /// Blocks still unresolved when the session stopped
        incomplete: BTreeSet<BlockNr>,
        error: Option<String>,
    },
}

impl SessionNotice {
    pub fn handle(&self) -> HandleId {
        match self {
            Self::StateChanged { handle, .. }
            | Self::Report { handle, .. }
            | Self::Unhealthy { handle, .. }
            | Self::FileComplete { handle }
            | Self::Closed { handle, .. } => *handle,
        }
    }
}

/// Events broadcast by a session registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    SessionStarted {
        handle: HandleId,
    },
    SessionStateChanged {
        handle: HandleId,
        state: SessionState,
    },
    Progress {
        handle: HandleId,
        progress: TransferReport,
        cwnd: u32,
    },
    SessionUnhealthy {
        handle: HandleId,
        consecutive_timeouts: u32,
    },
    SessionClosed {
        handle: HandleId,
        incomplete: usize,
        error: Option<String>,
    },
    FileCompleted {
        file: FileId,
    },
    TorrentCompleted {
        torrent: TorrentId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> FileId {
        FileId::new(TorrentId::from_name("messages"), 1)
    }

    #[test]
    fn test_routing_role() {
        let req = PeerMessage::BlocksReq {
            file: file(),
            msg_id: 7,
            blocks: BTreeSet::new(),
            hashes: BTreeSet::new(),
            with_hashes: true,
            cache_hint: BTreeSet::new(),
        };
        assert_eq!(req.target_role(), Role::Seeder);
        assert_eq!(req.msg_id(), Some(7));

        let shutdown = PeerMessage::Shutdown {
            file: file(),
            from: Role::Seeder,
        };
        assert_eq!(shutdown.target_role(), Role::Leecher);
        assert_eq!(shutdown.msg_id(), None);
        assert_eq!(shutdown.file(), file());
    }

    #[test]
    fn test_event_serialization() {
        let event = TransferEvent::FileCompleted { file: file() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("file_completed"));
    }
}
