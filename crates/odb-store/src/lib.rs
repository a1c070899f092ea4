//! Object storage backends for the object database.
//!
//! This crate implements the one-file-per-object store analogous to git's
//! `.git/objects/xx/yyyy...` layout, an in-memory store, and the bounded
//! object cache shared by every backend.
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectBackend`] trait:
//!
//! - [`LooseObjectStore`] -- zlib-compressed files, atomic rename on write
//! - [`InMemoryObjectStore`] -- `HashMap`-based store for tests and embedding
//!
//! Pack files live in `odb-pack` and implement the same trait.
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written (content-addressing guarantees this).
//! 2. Writes become visible atomically (temp file + rename).
//! 3. Concurrent reads are always safe (objects are immutable).
//! 4. "Not found" is `Ok(None)`; damage is an error, never silently repaired.
//! 5. All I/O errors are propagated with the offending path.

pub mod cache;
pub mod error;
pub mod loose;
pub mod memory;
pub mod object;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use cache::{CacheConfig, CacheStats, ObjectCache};
pub use error::{IoResultExt, StoreError, StoreResult};
pub use loose::{LooseConfig, LooseObjectStore};
pub use memory::InMemoryObjectStore;
pub use object::{normalize_prefix, parse_canonical_header, ObjectHeader, RawObject, MIN_PREFIX_LEN};
pub use traits::ObjectBackend;
