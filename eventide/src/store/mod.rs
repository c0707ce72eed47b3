//! Backend and offset tracker implementations.
//!
//! Persistent backends (SQL and friends) live outside this crate; what ships
//! here are the in-memory implementations used for tests and development.

// The in-memory implementations are compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory persistence backend.
pub mod in_memory;

#[cfg(feature = "in-memory")]
/// An in-memory offset tracker.
pub mod in_memory_offset;
