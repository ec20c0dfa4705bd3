//! File content cache.
//!
//! One backing file per inode, stored in a hash fan-out layout:
//! `{cache_dir}/content/{first_2_chars_of_sha256(id)}/{rest}`.
//! Downloads land in a `.partial` sibling and are promoted by rename,
//! so a crash never leaves a half-written file at the final path.
//!
//! Writers to the same id serialize through a per-id lock; readers
//! open their own descriptors and use positioned reads. Files are
//! created owner-only. The cache is lossy: the engine may evict the
//! backing file of any clean hydrated item, oldest access first.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use nimbus_core::ItemId;

use crate::StoreError;

/// Owner-only permissions for cached content.
const CONTENT_MODE: u32 = 0o600;

/// Manages cached file content on disk.
pub struct ContentCache {
    content_dir: PathBuf,
    /// Serializes writers per id.
    write_locks: DashMap<ItemId, Arc<Mutex<()>>>,
    /// Last read/write per id, for LRU eviction. Only items touched
    /// this session appear here; untouched files rank oldest.
    last_access: DashMap<ItemId, Instant>,
    /// Running total of cached bytes.
    total_bytes: AtomicU64,
}

impl ContentCache {
    /// Create a cache rooted at `cache_dir`, creating `content/` if
    /// needed and scanning existing files into the size total.
    pub fn new(cache_dir: &Path) -> Result<Self, StoreError> {
        let content_dir = cache_dir.join("content");
        fs::create_dir_all(&content_dir)?;

        let cache = Self {
            content_dir,
            write_locks: DashMap::new(),
            last_access: DashMap::new(),
            total_bytes: AtomicU64::new(0),
        };
        let total = cache.rescan()?;
        tracing::debug!(total_bytes = total, "Content cache initialized");
        Ok(cache)
    }

    /// Path of the backing file for `id`.
    pub fn content_path(&self, id: &ItemId) -> PathBuf {
        let hash = Self::hash_id(id);
        let (prefix, rest) = hash.split_at(2);
        self.content_dir.join(prefix).join(rest)
    }

    /// Path of the in-progress download for `id`.
    pub fn partial_path(&self, id: &ItemId) -> PathBuf {
        let mut path = self.content_path(id);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.set_file_name(format!("{name}.partial"));
        path
    }

    /// True if a backing file exists for `id`.
    pub fn exists(&self, id: &ItemId) -> bool {
        self.content_path(id).exists()
    }

    /// Open the backing file for positioned reads.
    pub fn open_for_read(&self, id: &ItemId) -> Result<File, StoreError> {
        self.touch(id);
        Ok(File::open(self.content_path(id))?)
    }

    /// Read up to `size` bytes at `offset`.
    pub fn read_at(&self, id: &ItemId, offset: u64, size: u32) -> Result<Vec<u8>, StoreError> {
        self.touch(id);
        let mut file = File::open(self.content_path(id))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size as usize];
        let mut read = 0usize;
        // A short read mid-buffer is legal; loop until EOF or full.
        loop {
            let n = file.read(&mut buffer[read..])?;
            if n == 0 {
                break;
            }
            read += n;
            if read == buffer.len() {
                break;
            }
        }
        buffer.truncate(read);
        Ok(buffer)
    }

    /// Write `data` at `offset`, creating the file if absent.
    /// Returns the number of bytes written.
    pub fn write_at(&self, id: &ItemId, offset: u64, data: &[u8]) -> Result<u32, StoreError> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.content_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let before = path.metadata().map(|m| m.len()).unwrap_or(0);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(CONTENT_MODE)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        let after = file.metadata()?.len();

        self.adjust_total(before, after);
        self.touch(id);
        Ok(data.len() as u32)
    }

    /// Replace the backing file's content wholesale.
    pub fn store(&self, id: &ItemId, data: &[u8]) -> Result<(), StoreError> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.content_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let before = path.metadata().map(|m| m.len()).unwrap_or(0);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CONTENT_MODE)
            .open(&path)?;
        file.write_all(data)?;
        file.sync_all()?;

        self.adjust_total(before, data.len() as u64);
        self.touch(id);
        Ok(())
    }

    /// Truncate (or extend with zeros) the backing file to `size`.
    pub fn truncate(&self, id: &ItemId, size: u64) -> Result<(), StoreError> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.content_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let before = path.metadata().map(|m| m.len()).unwrap_or(0);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(CONTENT_MODE)
            .open(&path)?;
        file.set_len(size)?;

        self.adjust_total(before, size);
        self.touch(id);
        Ok(())
    }

    /// Move a backing file to a new id (provisional id adoption).
    /// No-op when the old id has no content.
    pub fn rekey(&self, old: &ItemId, new: &ItemId) -> Result<(), StoreError> {
        let lock = self.write_lock(old);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let from = self.content_path(old);
        if !from.exists() {
            return Ok(());
        }
        let to = self.content_path(new);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)?;

        if let Some((_, at)) = self.last_access.remove(old) {
            self.last_access.insert(new.clone(), at);
        }
        Ok(())
    }

    /// Copy one item's backing file to another id (conflict copies).
    pub fn copy(&self, from: &ItemId, to: &ItemId) -> Result<u64, StoreError> {
        let lock = self.write_lock(to);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dest = self.content_path(to);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let before = dest.metadata().map(|m| m.len()).unwrap_or(0);
        let copied = fs::copy(self.content_path(from), &dest)?;
        fs::set_permissions(&dest, std::os::unix::fs::PermissionsExt::from_mode(CONTENT_MODE))?;

        self.adjust_total(before, copied);
        self.touch(to);
        Ok(copied)
    }

    /// Byte length of the backing file, if present.
    pub fn size_on_disk(&self, id: &ItemId) -> Result<Option<u64>, StoreError> {
        match fs::metadata(self.content_path(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open the partial file for a hydration download, truncating any
    /// stale leftover.
    pub fn open_partial(&self, id: &ItemId) -> Result<File, StoreError> {
        let path = self.partial_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CONTENT_MODE)
            .open(&path)?)
    }

    /// Promote a completed partial download to the final path.
    pub fn promote_partial(&self, id: &ItemId) -> Result<(), StoreError> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let partial = self.partial_path(id);
        let final_path = self.content_path(id);
        let before = final_path.metadata().map(|m| m.len()).unwrap_or(0);
        let after = partial.metadata()?.len();
        fs::rename(&partial, &final_path)?;

        self.adjust_total(before, after);
        self.touch(id);
        Ok(())
    }

    /// Discard a failed partial download, if present.
    pub fn discard_partial(&self, id: &ItemId) {
        let partial = self.partial_path(id);
        if partial.exists() {
            if let Err(e) = fs::remove_file(&partial) {
                tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial file");
            }
        }
    }

    /// Remove the backing file (and any partial).
    pub fn remove(&self, id: &ItemId) -> Result<(), StoreError> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.content_path(id);
        if let Ok(meta) = path.metadata() {
            self.adjust_total(meta.len(), 0);
            fs::remove_file(&path)?;
        }
        self.discard_partial(id);
        self.last_access.remove(id);
        Ok(())
    }

    /// Total cached bytes (final files only).
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Evict one item's content; the caller has verified the item is
    /// clean, hydrated, and unreferenced. Returns bytes freed.
    pub fn evict(&self, id: &ItemId) -> Result<u64, StoreError> {
        let freed = self.size_on_disk(id)?.unwrap_or(0);
        self.remove(id)?;
        tracing::debug!(id = %id, freed, "Evicted cached content");
        Ok(freed)
    }

    /// Evict from `candidates` (oldest access first) until the total
    /// drops to `target_bytes`. Returns the ids actually evicted.
    pub fn evict_until(
        &self,
        target_bytes: u64,
        candidates: &[ItemId],
    ) -> Result<Vec<ItemId>, StoreError> {
        let mut ordered: Vec<&ItemId> = candidates.iter().collect();
        ordered.sort_by_key(|id| self.last_access.get(*id).map(|t| *t.value()));

        let mut evicted = Vec::new();
        for id in ordered {
            if self.total_bytes() <= target_bytes {
                break;
            }
            self.evict(id)?;
            evicted.push(id.clone());
        }
        Ok(evicted)
    }

    /// Recompute the byte total by walking the fan-out directories.
    /// Partial files are not counted.
    pub fn rescan(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for entry in fs::read_dir(&self.content_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if file.file_type()?.is_file()
                    && !file.file_name().to_string_lossy().ends_with(".partial")
                {
                    total += file.metadata()?.len();
                }
            }
        }
        self.total_bytes.store(total, Ordering::Relaxed);
        Ok(total)
    }

    /// Remove partial files left behind by a crash.
    pub fn sweep_partials(&self) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        for entry in fs::read_dir(&self.content_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if file.file_name().to_string_lossy().ends_with(".partial") {
                    fs::remove_file(file.path())?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Swept stale partial downloads");
        }
        Ok(removed)
    }

    fn write_lock(&self, id: &ItemId) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn touch(&self, id: &ItemId) {
        self.last_access.insert(id.clone(), Instant::now());
    }

    fn adjust_total(&self, before: u64, after: u64) {
        if after >= before {
            self.total_bytes.fetch_add(after - before, Ordering::Relaxed);
        } else {
            self.total_bytes.fetch_sub(before - after, Ordering::Relaxed);
        }
    }

    fn hash_id(id: &ItemId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// Tests
// ============================================================================
