//! Storage layer for Dormant
//!
//! This crate implements the statement-executor seam of the engine:
//! - MemoryStore: transactional in-memory row store (read committed,
//!   first-committer-wins) enforcing primary-key, not-null and foreign-key
//!   constraints from the mapping model
//! - StoreOp: log of executed writes for inspection

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;

pub use memory::{MemoryStore, StoreOp};
