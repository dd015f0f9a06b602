//! Common utilities and types shared across Ledgersync modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the error taxonomy, the collection registry and the domain record shapes.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Category, Collection, Record, RecordDraft};
