//! Bootstrap helpers for starting the Confab server
//!
//! This module handles:
//! - Configuration discovery and loading
//! - Fail-fast configuration validation

pub mod config;

pub use config::load_config;
