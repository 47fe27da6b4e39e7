//! Session Module
//!
//! Per-peer, per-file sessions and the registry that owns them.
//!
//! A session is a transition function (`LeecherMachine`, `SeederMachine`)
//! wrapped by a task that supplies timers and inbound messages and performs
//! the resulting storage and network effects. Both share the lifecycle
//! `SettingUp -> Active -> ShuttingDown -> Closed`.

pub mod leecher;
pub mod messages;
pub mod pending;
pub mod registry;
pub mod seeder;
pub mod window;

pub use leecher::{LeecherEffect, LeecherEvent, LeecherMachine, LeecherSession, StoreBatch, StoreResult};
pub use messages::{PeerMessage, SessionInput, SessionNotice, SessionReport, SessionState, TransferEvent};
pub use pending::{PendingRequest, PendingRequests};
pub use registry::SessionRegistry;
pub use seeder::{serve_blocks, SeederEffect, SeederEvent, SeederMachine, SeederSession, ServeRequest};
pub use window::RequestWindow;
