//! lumberjack node: tails local files, serves them live and keeps a lodge

pub mod config;
pub mod server;

pub use config::{Config, ConfigLayer};
pub use server::{AppState, router};
