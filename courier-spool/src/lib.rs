//! Persistence for queued and dead-lettered messages.
//!
//! A [`BackingStore`] keeps one record per [`MessageId`]. The delivery queue
//! writes through to it on every mutation so that a restart can rebuild the
//! queue. [`EmlArchive`] additionally keeps a plain `.eml` copy of each
//! dead-lettered message for operators.
//!
//! [`MessageId`]: courier_common::MessageId

pub mod archive;
pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;

pub use archive::EmlArchive;
pub use backends::{FileBackingStore, MemoryBackingStore};
pub use config::SpoolConfig;
pub use error::{Result, SerializationError, SpoolError};
pub use r#trait::BackingStore;
