//! # lager-common
//!
//! Shared types for the lager layered-storage driver:
//! - Common error types
//! - Standard filesystem roots

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{LagerError, LagerResult};
pub use paths::DriverRoots;
