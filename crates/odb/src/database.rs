use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use odb_pack::{BaseResolver, PackFile, PackStore, PackWriter, WindowManager, WindowStats};
use odb_store::{
    normalize_prefix, CacheStats, InMemoryObjectStore, LooseObjectStore, ObjectBackend,
    ObjectCache, ObjectHeader, RawObject, StoreError, StoreResult,
};
use odb_types::ObjectId;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{sort_entries, Backend, BackendEntry, BackendId};
use crate::config::OdbConfig;

type Snapshot = Arc<Vec<Arc<BackendEntry>>>;

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OdbStats {
    pub cache: CacheStats,
    pub windows: WindowStats,
    pub backends: usize,
    pub packs: usize,
}

/// Object database: an ordered set of backends behind one lookup API.
///
/// Lookups consult the shared [`ObjectCache`] and then each backend in
/// priority order. A backend that does not have the object is skipped; a
/// backend that fails for any other reason (corruption, I/O, budget) ends
/// the lookup with that error.
///
/// The backend list is copy-on-write. Registration and removal publish a
/// new list; a lookup already in progress keeps the list it started with,
/// and a removed backend is released once the last such lookup finishes.
pub struct ObjectDatabase {
    objects_dir: Option<PathBuf>,
    config: OdbConfig,
    backends: RwLock<Snapshot>,
    next_backend: AtomicU64,
    cache: Arc<ObjectCache>,
    windows: Arc<WindowManager>,
    /// Serializes pack directory rescans.
    refresh_lock: Mutex<()>,
}

impl ObjectDatabase {
    /// A database with no backends and its own cache and window manager.
    pub fn new(config: OdbConfig) -> Self {
        let cache = Arc::new(ObjectCache::new(config.cache.clone()));
        let windows = Arc::new(WindowManager::new(config.windows.clone()));
        Self::with_shared(config, cache, windows, None)
    }

    fn with_shared(
        config: OdbConfig,
        cache: Arc<ObjectCache>,
        windows: Arc<WindowManager>,
        objects_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            objects_dir,
            config,
            backends: RwLock::new(Arc::new(Vec::new())),
            next_backend: AtomicU64::new(1),
            cache,
            windows,
            refresh_lock: Mutex::new(()),
        }
    }

    /// A database backed by a single in-memory store.
    pub fn in_memory(config: OdbConfig) -> Self {
        let db = Self::new(config);
        db.register_backend(Backend::Memory(InMemoryObjectStore::new(db.config.algorithm)));
        db
    }

    /// Open the object directory of a repository (`.git/objects`).
    ///
    /// Registers the loose store rooted at `objects_dir`, every
    /// `pack/pack-*.idx` with its pack, and the databases listed in
    /// `info/alternates`. Alternates share this database's cache and
    /// window budget.
    pub fn open(objects_dir: &Path, config: OdbConfig) -> StoreResult<Self> {
        let cache = Arc::new(ObjectCache::new(config.cache.clone()));
        let windows = Arc::new(WindowManager::new(config.windows.clone()));
        let mut chain = Vec::new();
        let db = Self::open_nested(objects_dir, config, cache, windows, 0, &mut chain)?;
        info!(
            objects_dir = %objects_dir.display(),
            backends = db.backend_count(),
            packs = db.pack_count(),
            "opened object database"
        );
        Ok(db)
    }

    fn open_nested(
        objects_dir: &Path,
        config: OdbConfig,
        cache: Arc<ObjectCache>,
        windows: Arc<WindowManager>,
        depth: usize,
        chain: &mut Vec<PathBuf>,
    ) -> StoreResult<Self> {
        let meta = fs::metadata(objects_dir).map_err(|e| StoreError::io(objects_dir, e))?;
        if !meta.is_dir() {
            return Err(StoreError::io(
                objects_dir,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
        let canonical = fs::canonicalize(objects_dir).map_err(|e| StoreError::io(objects_dir, e))?;

        let db = Self::with_shared(
            config.clone(),
            cache.clone(),
            windows.clone(),
            Some(objects_dir.to_path_buf()),
        );
        db.register_backend(Backend::Loose(LooseObjectStore::new(
            objects_dir,
            config.algorithm,
            config.loose.clone(),
        )));
        db.refresh()?;

        chain.push(canonical);
        for alternate in read_alternates(objects_dir)? {
            if depth >= config.max_alternate_depth {
                warn!(
                    alternate = %alternate.display(),
                    limit = config.max_alternate_depth,
                    "alternate nesting too deep, ignoring"
                );
                continue;
            }
            let resolved = match fs::canonicalize(&alternate) {
                Ok(path) => path,
                Err(e) => {
                    warn!(alternate = %alternate.display(), error = %e, "unusable alternate");
                    continue;
                }
            };
            if chain.contains(&resolved) {
                warn!(alternate = %alternate.display(), "alternate cycle, ignoring");
                continue;
            }
            match Self::open_nested(
                &alternate,
                config.clone(),
                cache.clone(),
                windows.clone(),
                depth + 1,
                chain,
            ) {
                Ok(alt) => {
                    db.register_backend(Backend::Alternate(Arc::new(alt)));
                }
                Err(e) => {
                    warn!(alternate = %alternate.display(), error = %e, "unusable alternate");
                }
            }
        }
        chain.pop();
        Ok(db)
    }

    pub fn objects_dir(&self) -> Option<&Path> {
        self.objects_dir.as_deref()
    }

    pub fn config(&self) -> &OdbConfig {
        &self.config
    }

    /// The object cache shared with this database's packs.
    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    pub fn windows(&self) -> &Arc<WindowManager> {
        &self.windows
    }

    /// Add a backend at its default priority.
    pub fn register_backend(&self, backend: Backend) -> BackendId {
        let priority = backend.default_priority();
        self.register_backend_with_priority(backend, priority)
    }

    /// Add a backend. Higher priorities are consulted first; among equal
    /// priorities the most recently registered backend comes first.
    pub fn register_backend_with_priority(&self, backend: Backend, priority: i32) -> BackendId {
        let id = BackendId(self.next_backend.fetch_add(1, Ordering::Relaxed));
        debug!(
            backend = backend.kind_name(),
            id = id.0,
            priority,
            "registered backend"
        );
        let entry = Arc::new(BackendEntry {
            id,
            priority,
            backend,
        });
        let mut slot = self.backends.write();
        let mut next = Vec::with_capacity(slot.len() + 1);
        next.extend(slot.iter().cloned());
        next.push(entry);
        sort_entries(&mut next);
        *slot = Arc::new(next);
        id
    }

    /// Remove a backend from future lookups. Returns `false` if it was not
    /// registered.
    pub fn unregister(&self, id: BackendId) -> bool {
        let mut slot = self.backends.write();
        if !slot.iter().any(|e| e.id == id) {
            return false;
        }
        let next: Vec<_> = slot.iter().filter(|e| e.id != id).cloned().collect();
        *slot = Arc::new(next);
        debug!(id = id.0, "unregistered backend");
        true
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.backends.read().clone()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.read().len()
    }

    pub fn pack_count(&self) -> usize {
        self.backends
            .read()
            .iter()
            .filter(|e| e.backend.as_pack().is_some())
            .count()
    }

    /// Fetch an object. A miss in every backend is [`StoreError::NotFound`].
    pub fn lookup(&self, id: &ObjectId) -> StoreResult<RawObject> {
        if let Some(obj) = self.find(id, 0)? {
            return Ok(obj);
        }
        if self.refresh_after_miss()? {
            if let Some(obj) = self.find(id, 0)? {
                return Ok(obj);
            }
        }
        Err(StoreError::NotFound(*id))
    }

    /// Whether any backend has `id`, without reading its content.
    pub fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        if self.exists_once(id)? {
            return Ok(true);
        }
        if self.refresh_after_miss()? {
            return self.exists_once(id);
        }
        Ok(false)
    }

    /// Type and size of an object.
    pub fn read_header(&self, id: &ObjectId) -> StoreResult<ObjectHeader> {
        if let Some(header) = self.find_header(id, 0)? {
            return Ok(header);
        }
        if self.refresh_after_miss()? {
            if let Some(header) = self.find_header(id, 0)? {
                return Ok(header);
            }
        }
        Err(StoreError::NotFound(*id))
    }

    /// Store an object in the highest-priority writable backend.
    pub fn insert(&self, object: RawObject) -> StoreResult<ObjectId> {
        let backends = self.snapshot();
        let target = backends
            .iter()
            .find(|e| e.backend.is_writable())
            .ok_or(StoreError::ReadOnly)?;
        let id = target.backend.write(&object)?;
        self.remember(id, object);
        Ok(id)
    }

    /// Expand an abbreviated hex id. Fails with `Ambiguous` when two
    /// distinct objects match and `PrefixNotFound` when none does.
    pub fn resolve_prefix(&self, prefix: &str) -> StoreResult<ObjectId> {
        let prefix = normalize_prefix(prefix, self.config.algorithm)?;
        let mut found: Option<ObjectId> = None;
        for entry in self.snapshot().iter() {
            let Some(id) = entry.backend.resolve_prefix(&prefix)? else {
                continue;
            };
            match found {
                Some(prev) if prev != id => return Err(StoreError::Ambiguous(prefix)),
                _ => found = Some(id),
            }
        }
        found.ok_or(StoreError::PrefixNotFound(prefix))
    }

    /// Visit every object id once, across all backends.
    pub fn for_each_id(
        &self,
        f: &mut dyn FnMut(&ObjectId) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut seen = BTreeSet::new();
        for entry in self.snapshot().iter() {
            entry.backend.for_each_id(&mut |id| {
                if seen.insert(*id) {
                    f(id)
                } else {
                    Ok(())
                }
            })?;
        }
        Ok(())
    }

    /// Rescan `pack/`: register packs that appeared and drop packs whose
    /// index is gone. Returns the number of packs added.
    pub fn refresh(&self) -> StoreResult<usize> {
        let Some(objects_dir) = &self.objects_dir else {
            return Ok(0);
        };
        let _guard = self.refresh_lock.lock();
        let on_disk = scan_pack_dir(&objects_dir.join("pack"))?;

        let registered: Vec<(BackendId, PathBuf)> = self
            .snapshot()
            .iter()
            .filter_map(|e| {
                e.backend
                    .as_pack()
                    .map(|p| (e.id, p.index_path().to_path_buf()))
            })
            .collect();
        for (id, index_path) in &registered {
            if !on_disk.contains(index_path) {
                debug!(index = %index_path.display(), "pack disappeared");
                self.unregister(*id);
            }
        }

        let known: HashSet<&PathBuf> = registered.iter().map(|(_, path)| path).collect();
        let mut added = 0;
        for index_path in &on_disk {
            if known.contains(index_path) {
                continue;
            }
            match self.open_pack(index_path) {
                Ok(pack) => {
                    self.register_backend(Backend::Pack(pack));
                    added += 1;
                }
                Err(e) => {
                    warn!(index = %index_path.display(), error = %e, "skipping unreadable pack");
                }
            }
        }
        if added > 0 {
            info!(objects_dir = %objects_dir.display(), added, "registered new packs");
        }
        Ok(added)
    }

    /// Write `objects` as a new pack under `pack/` and register it.
    pub fn write_pack(
        &self,
        objects: impl IntoIterator<Item = RawObject>,
    ) -> StoreResult<PackFile> {
        let objects_dir = self.objects_dir.as_ref().ok_or(StoreError::ReadOnly)?;
        let mut writer = PackWriter::new(self.config.algorithm, self.config.writer.clone());
        for object in objects {
            writer.add(object);
        }
        let file = writer.write_to_dir(&objects_dir.join("pack"))?;

        let _guard = self.refresh_lock.lock();
        let already = self.snapshot().iter().any(|e| {
            e.backend
                .as_pack()
                .is_some_and(|p| p.index_path() == file.index_path.as_path())
        });
        if !already {
            let pack = self.open_pack(&file.index_path)?;
            self.register_backend(Backend::Pack(pack));
        }
        Ok(file)
    }

    /// Pack every loose object. With `prune`, the loose copies are deleted
    /// once the pack is registered. Returns `None` when there was nothing
    /// to pack.
    pub fn repack(&self, prune: bool) -> StoreResult<Option<PackFile>> {
        let backends = self.snapshot();
        let loose: Vec<&LooseObjectStore> = backends
            .iter()
            .filter_map(|e| match &e.backend {
                Backend::Loose(store) => Some(store),
                _ => None,
            })
            .collect();

        let mut objects = Vec::new();
        let mut ids = Vec::new();
        for store in &loose {
            let mut found = Vec::new();
            store.for_each_id(&mut |id| {
                found.push(*id);
                Ok(())
            })?;
            for id in found {
                // removed concurrently
                if let Some(obj) = store.read(&id)? {
                    objects.push(obj);
                    ids.push(id);
                }
            }
        }
        if objects.is_empty() {
            return Ok(None);
        }

        let file = self.write_pack(objects)?;
        if prune {
            let mut pruned = 0usize;
            for store in &loose {
                for id in &ids {
                    if store.delete(id)? {
                        pruned += 1;
                    }
                }
            }
            debug!(pruned, "pruned loose objects");
        }
        info!(
            objects = file.object_count,
            deltas = file.delta_count,
            prune,
            "repacked loose objects"
        );
        Ok(Some(file))
    }

    pub fn stats(&self) -> OdbStats {
        OdbStats {
            cache: self.cache.stats(),
            windows: self.windows.stats(),
            backends: self.backend_count(),
            packs: self.pack_count(),
        }
    }

    fn open_pack(&self, index_path: &Path) -> StoreResult<PackStore> {
        Ok(PackStore::open(
            index_path,
            self.config.algorithm,
            self.windows.clone(),
            Some(self.cache.clone()),
            self.config.pack.clone(),
        )?)
    }

    fn refresh_after_miss(&self) -> StoreResult<bool> {
        if !self.config.refresh_on_miss || self.objects_dir.is_none() {
            return Ok(false);
        }
        Ok(self.refresh()? > 0)
    }

    fn remember(&self, id: ObjectId, object: RawObject) {
        if let Err(e) = self.cache.insert(id, object) {
            warn!(id = %id.short_hex(), error = %e, "object not cached");
        }
    }

    /// Cache, then every backend in order. `depth` is the delta depth
    /// already consumed when this is a base lookup for a pack.
    pub(crate) fn find(&self, id: &ObjectId, depth: usize) -> StoreResult<Option<RawObject>> {
        if let Some(obj) = self.cache.get(id) {
            return Ok(Some(obj));
        }
        for entry in self.snapshot().iter() {
            match entry.backend.read(id, self, depth) {
                Ok(Some(obj)) => {
                    self.remember(*id, obj.clone());
                    return Ok(Some(obj));
                }
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        id = %id.short_hex(),
                        backend = entry.backend.kind_name(),
                        error = %e,
                        "lookup failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn find_header(
        &self,
        id: &ObjectId,
        depth: usize,
    ) -> StoreResult<Option<ObjectHeader>> {
        if let Some(obj) = self.cache.get(id) {
            return Ok(Some(obj.header()));
        }
        for entry in self.snapshot().iter() {
            match entry.backend.read_header(id, self, depth) {
                Ok(Some(header)) => return Ok(Some(header)),
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn exists_once(&self, id: &ObjectId) -> StoreResult<bool> {
        if self.cache.contains(id) {
            return Ok(true);
        }
        for entry in self.snapshot().iter() {
            match entry.backend.exists(id) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}

impl BaseResolver for ObjectDatabase {
    fn resolve_base(&self, id: &ObjectId, depth: usize) -> StoreResult<Option<RawObject>> {
        self.find(id, depth)
    }
}

impl std::fmt::Debug for ObjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDatabase")
            .field("objects_dir", &self.objects_dir)
            .field("algorithm", &self.config.algorithm)
            .field("backends", &self.snapshot())
            .finish()
    }
}

/// `pack-*.idx` files that have a sibling `.pack`, oldest first so that
/// registration order puts the newest pack ahead.
fn scan_pack_dir(pack_dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(pack_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(pack_dir, e)),
    };
    let mut found = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(pack_dir, e))?.path();
        let is_index = path.extension().is_some_and(|ext| ext == "idx")
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("pack-"));
        if !is_index {
            continue;
        }
        if !path.with_extension("pack").is_file() {
            debug!(index = %path.display(), "index without pack, ignoring");
            continue;
        }
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, path));
    }
    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Paths listed in `info/alternates`: one per line, `#` comments, relative
/// paths taken from `objects_dir`.
fn read_alternates(objects_dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let path = objects_dir.join("info").join("alternates");
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| objects_dir.join(line))
        .collect())
}
