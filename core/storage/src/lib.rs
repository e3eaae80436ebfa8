//! Store abstractions for Buddy sync.
//!
//! This module provides the trait-based interfaces the sync engine consumes
//! (`LocalStore` for the device's durable state, `RemoteStore` for the shared
//! cloud copy) together with in-memory and SQLite implementations.
//!
//! # Design Principles
//! - Store isolation: no sync policy lives here, only persistence
//! - Async operations: every call is async, stores synchronize internally
//! - Idempotent remote writes: a write is keyed by record and sync version

pub mod local;
pub mod memory;
pub mod provider;

pub use local::SqliteLocalStore;
pub use memory::{MemoryLocalStore, MemoryRemoteStore};
pub use provider::{LocalStore, PushAck, RemoteRecord, RemoteStore, StoredRecord};
