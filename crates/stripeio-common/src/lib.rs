//! Shared types for the stripeio storage engine
//!
//! This crate sits at the bottom of the workspace: identifiers, metadata
//! records, the enums visible in configuration files, and the common error
//! taxonomy. Everything here is plain data; behavior lives in the crates
//! that consume it.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
