//! Storage module
//!
//! SQLite-backed persistence for memories, their version history, settings
//! overrides, and fixed-window rate limiting.

mod migrations;
mod sqlite;

pub use migrations::{CURRENT_SCHEMA_VERSION, apply_migrations};
pub use sqlite::{
    ActiveMemory, InsertMemoryInput, InsertOutcome, MemoryRecord, RetrieveQuery, Storage,
    StorageError, StorageStats,
};

pub type Result<T> = std::result::Result<T, StorageError>;
