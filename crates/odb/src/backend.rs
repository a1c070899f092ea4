use std::sync::Arc;

use odb_pack::{BaseResolver, PackStore};
use odb_store::{
    InMemoryObjectStore, LooseObjectStore, ObjectBackend, ObjectHeader, RawObject, StoreError,
    StoreResult,
};
use odb_types::ObjectId;

use crate::database::ObjectDatabase;

pub const LOOSE_PRIORITY: i32 = 300;
pub const MEMORY_PRIORITY: i32 = 300;
pub const PACK_PRIORITY: i32 = 200;
pub const ALTERNATE_PRIORITY: i32 = 100;

/// Handle returned by registration, used to unregister a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub(crate) u64);

/// One source of objects in an [`ObjectDatabase`].
pub enum Backend {
    Loose(LooseObjectStore),
    Pack(PackStore),
    Memory(InMemoryObjectStore),
    /// Another database whose objects are borrowed read-only.
    Alternate(Arc<ObjectDatabase>),
}

impl Backend {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Loose(_) => "loose",
            Self::Pack(_) => "pack",
            Self::Memory(_) => "memory",
            Self::Alternate(_) => "alternate",
        }
    }

    /// Priority used when the caller does not choose one: loose and memory
    /// stores first, then packs, then alternates.
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Loose(_) => LOOSE_PRIORITY,
            Self::Memory(_) => MEMORY_PRIORITY,
            Self::Pack(_) => PACK_PRIORITY,
            Self::Alternate(_) => ALTERNATE_PRIORITY,
        }
    }

    /// Whether `insert` may write here.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Loose(_) | Self::Memory(_))
    }

    pub fn as_pack(&self) -> Option<&PackStore> {
        match self {
            Self::Pack(pack) => Some(pack),
            _ => None,
        }
    }

    /// Read an object. Packs resolve external delta bases through
    /// `resolver`; `depth` is the delta depth already consumed.
    pub fn read(
        &self,
        id: &ObjectId,
        resolver: &dyn BaseResolver,
        depth: usize,
    ) -> StoreResult<Option<RawObject>> {
        match self {
            Self::Loose(store) => store.read(id),
            Self::Pack(pack) => pack.read_with(id, resolver, depth),
            Self::Memory(store) => store.read(id),
            Self::Alternate(db) => db.find(id, depth),
        }
    }

    pub fn read_header(
        &self,
        id: &ObjectId,
        resolver: &dyn BaseResolver,
        depth: usize,
    ) -> StoreResult<Option<ObjectHeader>> {
        match self {
            Self::Loose(store) => store.read_header(id),
            Self::Pack(pack) => pack.read_header_with(id, resolver, depth),
            Self::Memory(store) => store.read_header(id),
            Self::Alternate(db) => db.find_header(id, depth),
        }
    }

    pub fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        match self {
            Self::Loose(store) => store.exists(id),
            Self::Pack(pack) => pack.exists(id),
            Self::Memory(store) => store.exists(id),
            Self::Alternate(db) => db.exists(id),
        }
    }

    pub fn write(&self, object: &RawObject) -> StoreResult<ObjectId> {
        match self {
            Self::Loose(store) => store.write(object),
            Self::Memory(store) => store.write(object),
            Self::Pack(_) | Self::Alternate(_) => Err(StoreError::ReadOnly),
        }
    }

    pub fn for_each_id(
        &self,
        f: &mut dyn FnMut(&ObjectId) -> StoreResult<()>,
    ) -> StoreResult<()> {
        match self {
            Self::Loose(store) => store.for_each_id(f),
            Self::Pack(pack) => pack.for_each_id(f),
            Self::Memory(store) => store.for_each_id(f),
            Self::Alternate(db) => db.for_each_id(f),
        }
    }

    /// Unique match for an already-normalised prefix.
    pub fn resolve_prefix(&self, prefix: &str) -> StoreResult<Option<ObjectId>> {
        match self {
            Self::Loose(store) => store.resolve_prefix(prefix),
            Self::Pack(pack) => pack.resolve_prefix(prefix),
            Self::Memory(store) => store.resolve_prefix(prefix),
            Self::Alternate(db) => match db.resolve_prefix(prefix) {
                Ok(id) => Ok(Some(id)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            },
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loose(store) => f.debug_tuple("Loose").field(&store.root()).finish(),
            Self::Pack(pack) => f.debug_tuple("Pack").field(&pack.pack_path()).finish(),
            Self::Memory(store) => f.debug_tuple("Memory").field(&store.len()).finish(),
            Self::Alternate(db) => f.debug_tuple("Alternate").field(&db.objects_dir()).finish(),
        }
    }
}

/// A registered backend and its position in the lookup order.
#[derive(Debug)]
pub(crate) struct BackendEntry {
    pub id: BackendId,
    pub priority: i32,
    pub backend: Backend,
}

/// Lookup order: higher priority first; among equals, the most recently
/// registered first so newer packs shadow older ones.
pub(crate) fn sort_entries(entries: &mut [Arc<BackendEntry>]) {
    entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.id.cmp(&a.id)));
}
