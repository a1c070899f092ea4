//! Bounded memory-mapped windows over pack files.
//!
//! Every pack registered with a [`WindowManager`] is read through windows:
//! mapped slices aligned to `window_size`. The manager keeps the sum of its
//! resident windows under `mapped_limit` by unmapping the least recently used
//! one. A [`WindowView`] holds its own reference to the mapping, so an
//! evicted window stays mapped until its last view is dropped.

use std::collections::HashMap;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PackError, PackResult};

/// Window sizing and the global mapping budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Size and alignment of a regular window.
    pub window_size: u64,
    /// Maximum bytes mapped by the manager across all packs.
    pub mapped_limit: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: 8 * 1024 * 1024,
            mapped_limit: 256 * 1024 * 1024,
        }
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub mapped_bytes: u64,
    pub peak_mapped_bytes: u64,
    pub open_windows: usize,
    pub open_files: usize,
    pub mmap_calls: u64,
    pub evictions: u64,
}

/// Handle of a file registered with the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackFileId(u64);

struct MappedWindow {
    map: Mmap,
    start: u64,
}

struct Window {
    file: PackFileId,
    map: Arc<MappedWindow>,
    last_used: u64,
}

impl Window {
    fn covers(&self, file: PackFileId, offset: u64, len: u64) -> bool {
        self.file == file
            && offset >= self.map.start
            && offset + len <= self.map.start + self.map.map.len() as u64
    }
}

struct OpenFile {
    path: PathBuf,
    file: File,
    len: u64,
}

#[derive(Default)]
struct WindowState {
    files: HashMap<PackFileId, OpenFile>,
    windows: Vec<Window>,
    next_file: u64,
    tick: u64,
    stats: WindowStats,
}

impl WindowState {
    fn evict_lru(&mut self) -> bool {
        let Some(victim) = self
            .windows
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.last_used)
            .map(|(i, _)| i)
        else {
            return false;
        };
        let window = self.windows.swap_remove(victim);
        let len = window.map.map.len() as u64;
        self.stats.mapped_bytes -= len;
        self.stats.evictions += 1;
        debug!(start = window.map.start, len, "evicted pack window");
        true
    }
}

/// A borrowed range of a mapped window.
///
/// Keeps the underlying mapping alive for as long as the view exists.
#[derive(Clone)]
pub struct WindowView {
    map: Arc<MappedWindow>,
    begin: usize,
    end: usize,
}

impl WindowView {
    /// Pack offset of the first byte of this view.
    pub fn offset(&self) -> u64 {
        self.map.start + self.begin as u64
    }
}

impl Deref for WindowView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map.map[self.begin..self.end]
    }
}

impl std::fmt::Debug for WindowView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowView")
            .field("offset", &self.offset())
            .field("len", &(self.end - self.begin))
            .finish()
    }
}

/// Maps pack regions on demand under a shared byte budget.
pub struct WindowManager {
    config: WindowConfig,
    state: Mutex<WindowState>,
}

impl WindowManager {
    pub fn new(config: WindowConfig) -> Self {
        let config = WindowConfig {
            window_size: config.window_size.max(1),
            mapped_limit: config.mapped_limit,
        };
        Self {
            config,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn window_size(&self) -> u64 {
        self.config.window_size
    }

    /// Open `path` for windowed reads. Returns the handle and file length.
    pub fn open_file(&self, path: &Path) -> PackResult<(PackFileId, u64)> {
        let file = File::open(path).map_err(|e| PackError::io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| PackError::io(path, e))?
            .len();

        let mut state = self.state.lock();
        let id = PackFileId(state.next_file);
        state.next_file += 1;
        state.files.insert(
            id,
            OpenFile {
                path: path.to_path_buf(),
                file,
                len,
            },
        );
        state.stats.open_files = state.files.len();
        debug!(path = %path.display(), len, "registered pack file");
        Ok((id, len))
    }

    /// Forget a file and drop every window over it.
    ///
    /// Views already handed out stay valid.
    pub fn close_file(&self, id: PackFileId) {
        let mut state = self.state.lock();
        if state.files.remove(&id).is_none() {
            return;
        }
        let mut released = 0u64;
        state.windows.retain(|w| {
            if w.file == id {
                released += w.map.map.len() as u64;
                false
            } else {
                true
            }
        });
        state.stats.mapped_bytes -= released;
        state.stats.open_windows = state.windows.len();
        state.stats.open_files = state.files.len();
    }

    /// Map `len` bytes of `file` starting at `offset`.
    pub fn view(&self, file: PackFileId, offset: u64, len: usize) -> PackResult<WindowView> {
        let want = len as u64;
        if want > self.config.mapped_limit {
            return Err(PackError::ResourceExhausted {
                resource: "pack window",
                requested: want,
                limit: self.config.mapped_limit,
            });
        }

        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;

        if let Some(window) = state
            .windows
            .iter_mut()
            .find(|w| w.covers(file, offset, want))
        {
            window.last_used = tick;
            return Ok(slice(&window.map, offset, len));
        }

        let (path, file_len) = match state.files.get(&file) {
            Some(open) => (open.path.clone(), open.len),
            None => {
                return Err(PackError::io(
                    PathBuf::new(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "pack file is not open"),
                ))
            }
        };
        let end = offset.checked_add(want).filter(|&end| end <= file_len).ok_or_else(|| {
            PackError::io(
                &path,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("range {offset}+{len} is beyond end of file ({file_len} bytes)"),
                ),
            )
        })?;

        // Aligned window grown to cover the request; fall back to mapping the
        // request exactly when the grown window would not fit the budget.
        let mut start = offset - offset % self.config.window_size;
        let mut map_end = (start + self.config.window_size).max(end).min(file_len);
        if map_end - start > self.config.mapped_limit {
            start = offset;
            map_end = end;
        }
        let map_len = map_end - start;

        while state.stats.mapped_bytes + map_len > self.config.mapped_limit {
            if !state.evict_lru() {
                break;
            }
        }

        let open = state.files.get(&file).ok_or_else(|| {
            PackError::io(&path, std::io::Error::other("pack file closed while mapping"))
        })?;
        // SAFETY: pack files are immutable once written and are replaced by
        // rename, never rewritten in place, so the mapped bytes cannot change
        // underneath a view.
        let map = unsafe { MmapOptions::new().offset(start).len(map_len as usize).map(&open.file) }
            .map_err(|e| PackError::io(&path, e))?;

        let window = Arc::new(MappedWindow { map, start });
        let view = slice(&window, offset, len);
        state.windows.push(Window {
            file,
            map: window,
            last_used: tick,
        });
        state.stats.mmap_calls += 1;
        state.stats.mapped_bytes += map_len;
        state.stats.peak_mapped_bytes = state.stats.peak_mapped_bytes.max(state.stats.mapped_bytes);
        state.stats.open_windows = state.windows.len();
        Ok(view)
    }

    /// Current counters.
    pub fn stats(&self) -> WindowStats {
        let state = self.state.lock();
        WindowStats {
            open_windows: state.windows.len(),
            open_files: state.files.len(),
            ..state.stats
        }
    }
}

fn slice(window: &Arc<MappedWindow>, offset: u64, len: usize) -> WindowView {
    let begin = (offset - window.start) as usize;
    WindowView {
        map: Arc::clone(window),
        begin,
        end: begin + len,
    }
}

impl Default for WindowManager {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}

impl std::fmt::Debug for WindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
