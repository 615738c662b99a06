//! Chat synchronization between a remote collection and a local cache.
//!
//! This module keeps a single conversation in sync with a remote data
//! service while the network comes and goes:
//!
//! - Live snapshots of the remote collection while connected
//! - A durable local cache shown while offline
//! - An outbox for messages composed offline, replayed on reconnect
//! - Image and location attachments
//! - A scripted automated reply to every delivered message

pub mod attachments;
pub mod cache;
pub mod connectivity;
pub mod dispatcher;
pub mod engine;
pub mod remote;
pub mod types;

pub use attachments::{
    ActionChooser, AttachmentProvider, Capture, Composer, ComposerAction, ImageSource,
};
pub use cache::{LocalCache, OutboxKey, SledCache};
pub use connectivity::{
    ConnectivityMonitor, ConnectivityState, ConnectivitySubscription, ManualSignal, NetworkSignal,
    ProbeSignal, UnavailableSignal,
};
pub use dispatcher::{DispatchOutcome, FlushReport, OutboundDispatcher};
pub use engine::{EngineState, SyncEngine, SyncEvent, SyncHandle};
pub use remote::{
    InMemoryCollection, RecordFeed, RemoteCollection, RemoteMessageStream, StreamEvent,
    StreamHandle,
};
pub use types::*;
