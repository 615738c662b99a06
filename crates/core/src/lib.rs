//! Chatsnap Core Library
//!
//! This crate provides the core functionality for chatsnap, including:
//! - Connectivity monitoring
//! - Remote collection streaming
//! - Local message cache and outbox
//! - Configuration management
//!
//! It is used by the terminal client.

pub mod chat;
pub mod config;
pub mod error;
pub mod platform;

// Re-export commonly used types
pub use chat::{
    ConnectivityMonitor, ConversationSnapshot, DispatchOutcome, EngineState, Message, MessageId,
    Sender, SyncEngine, SyncEvent, SyncHandle,
};
pub use config::Config;
pub use error::{Error, Result};
