//! Common types shared across the Buddy sync crates.
//!
//! This module provides the error taxonomy, identifiers, closed enums and the
//! persisted data model, so that storage backends and the sync engine agree on
//! a single representation.

pub mod error;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use record::{
    checksum, ConflictAudit, DeviceInfo, SyncOperation, SyncRecord, SyncStatus, SYNC_ENVELOPE_KEY,
};
pub use types::{
    CapabilityClass, ConflictStrategy, ConnectionState, DeviceType, OperationType, Priority,
    RecordKey,
};
