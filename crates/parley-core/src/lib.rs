//! # Parley Core
//!
//! Runtime-free building blocks of the Parley transcript analyzer: data
//! models, the overlapping chunker, quote location, cross-chunk highlight
//! merging, the deterministic summary fallback, the streamed event type and
//! the storage trait.
//!
//! Nothing here performs network or filesystem I/O; the `parley` crate wires
//! these pieces to an LLM client, SQLite and an HTTP server.

pub mod chunk;
pub mod error;
pub mod events;
pub mod merge;
pub mod models;
pub mod span;
pub mod store;
pub mod summary;

pub use error::{AnalysisError, Result};
pub use events::AnalysisEvent;
