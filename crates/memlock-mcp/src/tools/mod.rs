//! MCP tool handlers.
//!
//! Each tool exposes a `description()` (the `tools/list` entry, carrying its
//! JSON schema) and an `execute()` that deserializes camelCase arguments,
//! calls into [`memlock_core::facade::MemoryFacade`], and serializes the
//! outcome back to JSON. This is the only place in the crate that knows the
//! wire-level argument names.

pub mod retrieve_memory;
pub mod store_memory;
