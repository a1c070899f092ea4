//! Content addressing for the object database.
//!
//! Provides the canonical object hasher (`"{type} {len}\0{content}"`) and a
//! streaming [`Digest`] used for pack trailers and index checksums.
//!
//! All crypto operations wrap established libraries; no custom cryptography.

pub mod digest;
pub mod hasher;

pub use digest::Digest;
pub use hasher::{canonical_header, ContentHasher};
