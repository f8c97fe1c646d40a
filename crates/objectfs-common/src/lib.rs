//! objectfs common types
//!
//! Shared pieces used by the journal and the store engine:
//! - Identifiers (`ObjectId`, `CollectionId`, `OpPosition`)
//! - The `Error`/`Result` pair
//! - Engine configuration (`StoreConfig`)
//! - Binary encoding helpers (`Encoder`/`Decoder`)

pub mod config;
pub mod encoding;
pub mod error;
pub mod types;

// Re-exports
pub use config::{
    DebugConfig, JournalConfig, QueueConfig, StoreConfig, SyncConfig, ThreadConfig,
    WbThrottleConfig, XattrConfig,
};
pub use encoding::{Decoder, Encoder};
pub use error::{Error, Result};
pub use types::{CollectionId, ObjectId, OpPosition, NO_GEN, NO_SNAP};
