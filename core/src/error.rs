//! Crate-wide error type.
//!
//! Every fallible operation in `fsdp-rs` returns [`Result`]. Shape and state checks are
//! performed locally, before any collective is issued, so a misconfigured worker fails fast
//! instead of leaving its peers blocked inside a collective.

use thiserror::Error;

/// Error type for tensor, autograd and sharding operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The shape (or element count) of a tensor does not match the expected one.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index or range falls outside of a tensor.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// An operation was attempted while a parameter (or the coordinator) was in the wrong state.
    #[error("Invalid state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
    /// A collective operation failed (peer hung up, mismatched payload, ...).
    #[error("Collective failed: {0}")]
    Collective(String),
    /// The sharding setup is inconsistent (bad rank, nested wrapping, ...).
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
