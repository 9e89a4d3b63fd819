//! Configuration management
//!
//! Harness settings come from built-in defaults, an optional TOML file and
//! `RELAY_HARNESS_*` environment variables, in that order.

pub mod settings;

pub use settings::{HarnessConfig, CONFIG_FILE_KEY};
