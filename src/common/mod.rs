//! Common Types
//!
//! Unified error handling shared across the crate.

pub mod error;

pub use error::{KtError, Result};
