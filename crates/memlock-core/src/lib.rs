//! # memlock-core
//!
//! A per-user long-term memory store for conversational agents: a durable,
//! versioned, policy-governed fact repository with deterministic retrieval
//! ranking.
//!
//! A calling agent proposes candidate memories extracted from dialogue;
//! [`policy::PolicyEngine`] decides, by a strict deterministic policy,
//! whether to accept, supersede, reject, or ignore each proposal, under
//! optimistic concurrency control with bounded retry. [`facade::MemoryFacade`]
//! is the thin gated surface a host actually calls.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use memlock_core::{AccessMode, MemoryFacade, Storage, facade::StoreMemoryInput};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(Storage::new(None)?);
//! let facade = MemoryFacade::new(storage, None);
//!
//! let outcome = facade.store_memory(StoreMemoryInput {
//!     content: "User prefers dark mode",
//!     memory_date: "2026-01-01",
//!     subject: "Preferences",
//!     importance: 4,
//!     session_id: "session-1",
//!     user_id: "user-1",
//!     access_mode: AccessMode::Private,
//! });
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod facade;
pub mod model;
pub mod policy;
pub mod settings;
pub mod storage;

pub use facade::{MemoryFacade, RetrieveMemoryOutcome, StoreMemoryOutcome};
pub use model::{AccessMode, LifecycleState, Memory, MemoryVersion, Source};
pub use policy::{PolicyEngine, PolicyOutcome, ReasonCode};
pub use settings::Settings;
pub use storage::{Storage, StorageError, StorageStats};

pub mod prelude {
    pub use crate::facade::{
        MemoryFacade, RetrieveMemoryInput, RetrieveMemoryOutcome, StoreMemoryInput,
        StoreMemoryOutcome,
    };
    pub use crate::model::{AccessMode, LifecycleState, Memory, MemoryVersion, Source};
    pub use crate::policy::{PolicyEngine, PolicyOutcome, ReasonCode};
    pub use crate::settings::Settings;
    pub use crate::storage::{Storage, StorageError};
}
