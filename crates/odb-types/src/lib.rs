//! Foundation types for the object database.
//!
//! This crate provides the identity and classification types shared by every
//! other crate in the workspace. It has no I/O and no hashing of its own;
//! digests are computed by `odb-crypto` and wrapped here.
//!
//! # Key Types
//!
//! - [`ObjectId`]: Content-addressed identifier (20 or 32 bytes)
//! - [`ObjectType`]: Blob, tree, commit or tag
//! - [`HashAlgorithm`]: Digest used for ids, pack trailers and index checksums

pub mod algorithm;
pub mod error;
pub mod kind;
pub mod object;

pub use algorithm::HashAlgorithm;
pub use error::TypeError;
pub use kind::ObjectType;
pub use object::ObjectId;
