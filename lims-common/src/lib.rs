//! # LIMS Common Library
//!
//! Shared code for the LIMS warehouse ingestion crates including:
//! - Database initialization, schema and migrations
//! - Event types (IngestEvent enum) and the EventBus
//! - Root folder and TOML configuration loading
//! - Timestamp utilities

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
