//! Pack file format for the object database.
//!
//! Reads and writes git-compatible packs: zlib-compressed frames, optionally
//! delta-encoded against a base in the same pack (ofs-delta) or named by id
//! (ref-delta), with a v2 index for random access.
//!
//! # Architecture
//!
//! - **Pack file** (`.pack`): `PACK` header, frames, whole-file digest trailer
//! - **Pack index** (`.idx`): fan-out table + sorted ids, CRCs and offsets
//! - **Delta codec**: copy/insert instruction streams ([`delta`])
//! - **WindowManager**: bounded LRU of memory-mapped pack regions
//! - **PackStore**: random-access reads, iterative bounded delta resolution
//! - **PackWriter**: builds a pack + index, delta-compressing similar objects

pub mod delta;
pub mod entry;
pub mod error;
pub mod index;
pub mod reader;
pub mod window;
pub mod writer;

pub use delta::DeltaError;
pub use entry::{FrameHeader, PackObjectKind};
pub use error::{PackError, PackResult};
pub use index::PackIndex;
pub use reader::{BaseResolver, NoExternalBases, PackReadConfig, PackStore, VerifyReport};
pub use window::{WindowConfig, WindowManager, WindowStats};
pub use writer::{PackFile, PackWriter, PackWriterConfig};
