//! # cinder-base
//!
//! Core types and utilities shared by every cinder crate.
//!
//! - **Error Types**: the error taxonomy surfaced by mutating operations
//! - **Strategy**: the build-time concurrency strategy selector
//! - **Utilities**: PRNG and hashing helpers

pub mod error;
pub mod strategy;
pub mod utils;

pub use error::{Error, Result};
pub use strategy::{Section, Serializer, Strategy};
