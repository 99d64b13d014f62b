//! Resilient subscriber for remote streams of JSON frames
//!
//! A [`Sluice`] keeps one long-lived HTTP GET open against a URL, cuts the
//! body into JSON frames and hands them to a [`FrameParser`]. Transport
//! failures and empty frames both lead to a reconnect after a delay that
//! doubles on every attempt.

mod backoff;
mod config;
mod decoder;
mod parsers;
mod sluice;
mod stats;

pub use backoff::Backoff;
pub use config::{ParserKind, SluiceEntry, SluiceFile};
pub use decoder::{Decoded, FrameDecoder, is_end_of_stream, record_count};
pub use parsers::{CountParser, PrintParser};
pub use sluice::{FrameParser, Sluice, SluiceConfig, SluiceError, SluiceState};
pub use stats::{SluiceStats, StatsSnapshot, format_report};
