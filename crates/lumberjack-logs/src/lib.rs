//! Log buffering for lumberjack
//!
//! This crate provides the bounded fan-out buffer that multiplexes one growing
//! log to many live subscribers, and the tail processes that feed it.

mod buffer;
mod tail;

pub use buffer::{Flow, LogBuffer, SubscriberId, Subscription};
pub use tail::{LineSplitter, TailError, TailManager};

// Re-export types used in our public API
pub use lumberjack_types::{LogBatch, LogLine};
