//! # Music Tools Common Library
//!
//! Shared code for the music tools service crates:
//! - Bootstrap configuration (TOML) and its startup validation
//! - Retention policy derived from configuration
//! - Logging initialisation
//! - Common error type

pub mod config;
pub mod error;
pub mod logging;

pub use config::{RetentionPolicy, TomlConfig};
pub use error::{Error, Result};
