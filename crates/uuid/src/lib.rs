//! Identifier and sharded-path utilities.
//!
//! MedVault stores every table entry under a sharded directory derived from its identifier.
//! To keep path derivation deterministic, identifiers use a *canonical* UUID representation:
//! **32 lowercase hexadecimal characters** (no hyphens).
//!
//! This crate provides:
//! - [`ShardableUuid`], which guarantees the canonical format once constructed and derives the
//!   sharded directory for an entry.
//! - [`TimestampUuid`], a time-prefixed identifier used for append-only logs where filename
//!   order should match chronological order.
//! - [`Sha256Hash`], a validated lowercase-hex SHA-256 digest used for content checksums.
//!
//! ## Sharded directory layout
//! For a canonical UUID `u`, data lives under:
//! `parent_dir/<u[0..2]>/<u[2..4]>/<u>/`
//!
//! Example:
//! `medvault_data/patients/55/0e/550e8400e29b41d4a716446655440000/`

mod hash;
mod shardable;
mod timestamp;

pub use hash::Sha256Hash;
pub use shardable::{ShardableUuid, Uuid};
pub use timestamp::TimestampUuid;

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
