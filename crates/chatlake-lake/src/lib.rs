//! The data-lake half of chatlake: append-only day-logs, checkpointed
//! compaction into a date-partitioned Parquet store, and the partition-pruned
//! query surface the analysis pipeline reads from.
//!
//! Everything here is synchronous. Callers on an async runtime bridge with
//! `spawn_blocking`; none of these operations are expected to hold an event
//! loop.

pub mod atomic;
pub mod checkpoint;
pub mod columnar;
pub mod compact;
pub mod dedup;
pub mod error;
pub mod lock;
pub mod partition;
pub mod query;
pub mod rawlog;
pub mod schema;

pub use error::{IoReason, LakeError, QueryErrorKind, Result};
