//! Backing store implementations
//!
//! - `memory`: in-process storage for tests and transient deployments
//! - `file`: one bincode file per record, for production use

pub mod file;
pub mod memory;

pub use file::FileBackingStore;
pub use memory::MemoryBackingStore;
