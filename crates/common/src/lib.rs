//! Shared error plumbing used across manifold crates.

pub mod error;

pub use error::FromMessage;
