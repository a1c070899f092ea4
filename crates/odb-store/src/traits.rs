use odb_types::ObjectId;

use crate::error::{StoreError, StoreResult};
use crate::object::{ObjectHeader, RawObject};

/// A single source of objects: the loose directory, one pack, or memory.
///
/// All implementations must satisfy these invariants:
/// - Objects are immutable once written. Content-addressing guarantees this:
///   the same data always produces the same ID.
/// - `read` returns `Ok(None)` for absent objects and `Err` only for I/O
///   failure or damage to an object the backend claims to hold.
/// - Concurrent reads are always safe.
/// - All I/O errors are propagated, never silently ignored.
pub trait ObjectBackend: Send + Sync {
    /// Read an object by its content-addressed ID.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    /// Returns `Err` on I/O failure or data corruption.
    fn read(&self, id: &ObjectId) -> StoreResult<Option<RawObject>>;

    /// Read only the type and size of an object.
    ///
    /// The default implementation reads the whole object; backends override
    /// it when the header is cheaper to get at.
    fn read_header(&self, id: &ObjectId) -> StoreResult<Option<ObjectHeader>> {
        Ok(self.read(id)?.map(|obj| obj.header()))
    }

    /// Check whether an object exists without reading its content.
    fn exists(&self, id: &ObjectId) -> StoreResult<bool>;

    /// Write an object and return its content-addressed ID.
    ///
    /// If the object already exists, this is a no-op (idempotent). Read-only
    /// backends keep the default, which refuses.
    fn write(&self, _object: &RawObject) -> StoreResult<ObjectId> {
        Err(StoreError::ReadOnly)
    }

    /// Visit every object id held by this backend.
    fn for_each_id(&self, f: &mut dyn FnMut(&ObjectId) -> StoreResult<()>) -> StoreResult<()>;

    /// Find the unique id whose hex form starts with `prefix`.
    ///
    /// `prefix` is already normalised (lowercase hex, length checked).
    /// Returns `Ok(None)` when nothing matches and `StoreError::Ambiguous`
    /// when more than one id does.
    fn resolve_prefix(&self, prefix: &str) -> StoreResult<Option<ObjectId>> {
        let mut found: Option<ObjectId> = None;
        self.for_each_id(&mut |id| {
            if id.matches_hex_prefix(prefix) {
                match found {
                    Some(existing) if existing != *id => {
                        return Err(StoreError::Ambiguous(prefix.to_string()))
                    }
                    _ => found = Some(*id),
                }
            }
            Ok(())
        })?;
        Ok(found)
    }

    /// Read multiple objects in a batch.
    fn read_batch(&self, ids: &[ObjectId]) -> StoreResult<Vec<Option<RawObject>>> {
        ids.iter().map(|id| self.read(id)).collect()
    }
}
