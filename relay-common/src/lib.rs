//! Relay Common - Shared configuration, errors, and logging for the WeCom relay.
//!
//! This crate provides:
//! - Environment-driven configuration with startup validation
//! - Error types and handling utilities
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, Locale, WeComConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
