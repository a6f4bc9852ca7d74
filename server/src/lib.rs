//! Certificate request gateway server.
//!
//! Configuration and bootstrap for the `certgate` binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod lifecycle;

pub use config::{Config, ConfigError};
