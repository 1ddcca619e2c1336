//! Shared domain types for the valet gateway.
//!
//! Everything here is plain data: the error type used across all crates,
//! provider-agnostic conversation messages, streaming chunk types, and the
//! configuration schema with its loader.

pub mod config;
pub mod error;
pub mod message;
pub mod stream;

pub use error::{Error, Result};
