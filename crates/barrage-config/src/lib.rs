//! Configuration for the barrage client SDK.
//!
//! Settings persist to disk as RON files. Every section carries
//! `#[serde(default)]`, so partial files and files written by older
//! versions load cleanly.

mod config;
mod error;

pub use config::{Config, DebugConfig, DispatchConfig, NetworkConfig, TokenConfig};
pub use error::ConfigError;
