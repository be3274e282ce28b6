//! Configuration for the IPTV transcoding proxy
//!
//! Loads `config.toml`, applies environment overrides and validates the result.

pub mod config;

pub use config::*;
