//! Common utilities for ouroboros
//!
//! This crate provides the error type shared by the ouroboros client crates.

pub mod error;

pub use error::{DriverError, Result};
