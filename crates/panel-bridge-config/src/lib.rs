//! Configuration parsing for panel-bridge
//!
//! This crate handles parsing the KDL configuration file that tunes the
//! bridge daemon: socket location, compositor backend selection and the
//! event pipeline's queue and backoff settings.

mod error;
mod model;
mod parser;

pub use error::ConfigError;
pub use model::*;
pub use parser::{load_config, parse_config, parse_config_str};
