//! MedVault blob storage.
//!
//! Clinical documents are stored as opaque (already encrypted) blobs addressed by a relative
//! path such as `documents/<patient>/<document>/v1.enc`. The key material needed to read a blob
//! never lives next to it: this crate only knows about bytes and paths.
//!
//! ## Design Principles
//!
//! - Blobs are write-once. A new version of a document is a new path.
//! - Paths are validated before they touch the filesystem; traversal and executable-looking
//!   names are rejected.
//! - Writes are atomic (temporary file + rename), so a reader never observes a torn blob.
//!
//! ## Example Usage
//!
//! ```no_run
//! use vault_files::{BlobPath, BlobStore, FsBlobStore};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FsBlobStore::new(Path::new("medvault_data/blobs"))?;
//! let path = BlobPath::new("documents/abc/def/v1.enc")?;
//! store.put(&path, b"ciphertext")?;
//! assert_eq!(store.get(&path)?, b"ciphertext");
//! # Ok(())
//! # }
//! ```

mod blob_path;
mod content;
mod store;

pub use blob_path::BlobPath;
pub use content::{sha256_digest, sniff_media_type};
pub use store::{BlobStore, FsBlobStore};
pub use vault_uuid::Sha256Hash;

/// Errors that can occur during blob operations
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    /// Root directory does not exist or is not a directory
    #[error("Invalid root directory: {0}")]
    InvalidRootDirectory(String),

    /// Path validation failed (potential directory traversal or unsafe path)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Blob already exists at the requested path (immutability violation)
    #[error("Blob already exists at {0}")]
    BlobAlreadyExists(String),

    /// No blob is stored at the requested path
    #[error("Blob not found at {0}")]
    BlobNotFound(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
