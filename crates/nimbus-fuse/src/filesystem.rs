//! The `fuser::Filesystem` implementation.
//!
//! FUSE callbacks are synchronous; they bridge into the engine's
//! runtime via `Handle::block_on`. Lock order everywhere: parent
//! before child, metadata store before content cache.
//!
//! Reads of cached content never touch the network. A read-open on a
//! `Ghost` submits a high-priority hydration and blocks until it
//! completes or the configured timeout elapses. Writes land in the
//! content cache, mark the record dirty, and wake the upload manager;
//! while offline they are additionally journaled (once per open
//! session).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use dashmap::{DashMap, DashSet};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use nimbus_core::domain::newtypes::FileName;
use nimbus_core::ports::remote_drive::DriveQuota;
use nimbus_core::{ItemId, ItemKind, ItemRecord, ItemState};
use nimbus_store::JournalOp;
use nimbus_sync::SyncEngine;

use crate::error::errno_for;
use crate::handles::HandleTable;
use crate::inode_table::{InodeTable, ROOT_INO};
use crate::virtual_files::VirtualFiles;

/// Kernel attribute cache TTL.
const TTL: Duration = Duration::from_secs(1);

/// Internal sentinel (never surfaced to the kernel): the operation
/// needs the item hydrated before it can be retried.
const NEEDS_HYDRATION: libc::c_int = -1;

/// Filesystem block size reported to statfs.
const BLOCK_SIZE: u32 = 4096;

/// The FUSE-facing filesystem.
pub struct NimbusFs {
    rt: Handle,
    engine: Arc<SyncEngine>,
    inodes: Arc<InodeTable>,
    handles: Arc<HandleTable>,
    virtuals: VirtualFiles,
    root_id: ItemId,
    /// Directories listed from the remote this session.
    listed: DashSet<ItemId>,
    /// In-memory extended attributes, never synced.
    xattrs: Arc<DashMap<ItemId, HashMap<String, Vec<u8>>>>,
    /// Cached drive quota for statfs.
    quota: Arc<std::sync::RwLock<DriveQuota>>,
    uid: u32,
    gid: u32,
}

impl NimbusFs {
    /// Build the filesystem over a started engine. `root_id` is the
    /// resolved drive root.
    pub fn new(rt: Handle, engine: Arc<SyncEngine>, root_id: ItemId) -> Self {
        let inodes = Arc::new(InodeTable::new(root_id.clone()));
        let handles = Arc::new(HandleTable::new());
        let xattrs: Arc<DashMap<ItemId, HashMap<String, Vec<u8>>>> = Arc::new(DashMap::new());

        // Keep kernel-visible tables in step with provisional-id
        // adoption performed by the upload manager.
        {
            let inodes = Arc::clone(&inodes);
            let handles = Arc::clone(&handles);
            let xattrs = Arc::clone(&xattrs);
            engine.upload().set_adoption_hook(Box::new(move |old, new| {
                inodes.rekey(old, new.clone());
                handles.rekey(old, new);
                if let Some((_, attrs)) = xattrs.remove(old) {
                    xattrs.insert(new.clone(), attrs);
                }
            }));
        }

        let virtuals = VirtualFiles::new(engine.config().overlay.default_policy);

        Self {
            rt,
            engine,
            inodes,
            handles,
            virtuals,
            root_id,
            listed: DashSet::new(),
            xattrs,
            quota: Arc::new(std::sync::RwLock::new(DriveQuota::default())),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn record_for_ino(&self, ino: u64) -> Result<ItemRecord, libc::c_int> {
        let id = self.inodes.id_for(ino).ok_or(libc::ENOENT)?;
        self.record_for_id(&id)
    }

    fn record_for_id(&self, id: &ItemId) -> Result<ItemRecord, libc::c_int> {
        self.rt
            .block_on(self.engine.store().get(id))
            .map_err(|e| errno_for(&e.into()))?
            .ok_or(libc::ENOENT)
    }

    fn attr_for(&self, ino: u64, record: &ItemRecord) -> FileAttr {
        attr_from_record(ino, record, self.uid, self.gid)
    }

    fn root_attr(&self) -> FileAttr {
        directory_attr(ROOT_INO, self.uid, self.gid)
    }

    fn virtual_attr(&self, file: &crate::virtual_files::VirtualFile) -> FileAttr {
        FileAttr {
            ino: file.ino,
            size: file.content.len() as u64,
            blocks: 1,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o444,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Make sure a directory has been listed from the remote at least
    /// once this session. Offline, the cached listing serves.
    fn ensure_listed(&self, dir_id: &ItemId) {
        if self.listed.contains(dir_id) || self.engine.is_offline() || dir_id.is_local() {
            return;
        }
        let result = self
            .rt
            .block_on(self.engine.metadata_queue().refresh_children(dir_id));
        match result {
            Ok(()) => {
                self.listed.insert(dir_id.clone());
            }
            Err(e) if e.is_offline() => {
                debug!(dir = %dir_id, "Offline during listing; serving cached entries");
            }
            Err(e) => {
                warn!(dir = %dir_id, error = %e, "Directory listing failed");
            }
        }
    }

    /// Journal a metadata operation; when online, replay eagerly so
    /// the remote converges without waiting for a reconnect.
    fn journal_op(&self, id: &ItemId, op: JournalOp) {
        if let Err(e) = self.rt.block_on(self.engine.journal().append(id, &op)) {
            warn!(item = %id, error = %e, "Failed to journal operation");
            return;
        }
        if !self.engine.is_offline() {
            let replayer = Arc::clone(self.engine.replayer());
            self.rt.spawn(async move {
                if let Err(e) = replayer.replay().await {
                    debug!(error = %e, "Eager journal replay deferred");
                }
            });
        }
    }

    /// Create an empty backing file and walk a fresh ghost to
    /// `Hydrated` without a download (O_TRUNC and zero-size cases).
    fn materialize_empty(&self, record: &mut ItemRecord) -> Result<(), libc::c_int> {
        self.engine
            .content()
            .store(&record.id, b"")
            .map_err(|e| errno_for(&e.into()))?;
        record.transition_to(ItemState::Hydrating).map_err(|_| libc::EIO)?;
        record.transition_to(ItemState::Hydrated).map_err(|_| libc::EIO)?;
        record.size = 0;
        Ok(())
    }

    /// Hydrate a ghost file, blocking up to the configured timeout.
    fn hydrate_blocking(&self, id: &ItemId) -> Result<(), libc::c_int> {
        let timeout = Duration::from_secs(self.engine.config().hydration.open_timeout_seconds);
        self.rt
            .block_on(self.engine.hydration().hydrate_and_wait(id, timeout))
            .map_err(|e| errno_for(&e))
    }

    /// Shared mknod/create path.
    fn create_item(
        &self,
        parent: u64,
        name: &OsStr,
        kind: ItemKind,
    ) -> Result<(u64, ItemRecord), libc::c_int> {
        let parent_id = self.inodes.id_for(parent).ok_or(libc::ENOENT)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let name = FileName::new(name.to_string()).map_err(|_| libc::EINVAL)?;

        self.rt.block_on(async {
            let _parent_guard = self.engine.locks().lock(&parent_id).await;

            if self
                .engine
                .store()
                .get_by_name(&parent_id, name.as_str())
                .await
                .map_err(|e| errno_for(&e.into()))?
                .is_some()
            {
                return Err(libc::EEXIST);
            }

            let record = ItemRecord::new_local(parent_id.clone(), name.clone(), kind);
            if kind == ItemKind::File {
                self.engine
                    .content()
                    .store(&record.id, b"")
                    .map_err(|e| errno_for(&e.into()))?;
            }
            self.engine
                .store()
                .put(&record)
                .await
                .map_err(|e| errno_for(&e.into()))?;

            if self.engine.is_offline() {
                let op = JournalOp::Create {
                    parent_id: parent_id.clone(),
                    name: name.clone(),
                    kind,
                };
                if let Err(e) = self.engine.journal().append(&record.id, &op).await {
                    warn!(error = %e, "Failed to journal creation");
                }
            }
            self.engine.upload().kick();

            let ino = self.inodes.ino_for(&record.id);
            Ok((ino, record))
        })
    }

    /// Shared unlink/rmdir path. The caller has checked kind and
    /// emptiness.
    fn remove_item(&self, record: &ItemRecord) -> Result<(), libc::c_int> {
        self.rt.block_on(async {
            let _parent_guard = self.engine.locks().lock(&record.parent_id).await;
            let _guard = self.engine.locks().lock(&record.id).await;

            if record.is_directory() {
                self.engine
                    .store()
                    .delete_recursive(&record.id)
                    .await
                    .map_err(|e| errno_for(&e.into()))?;
            } else {
                self.engine
                    .store()
                    .delete(&record.id)
                    .await
                    .map_err(|e| errno_for(&e.into()))?;
            }
            self.engine
                .content()
                .remove(&record.id)
                .map_err(|e| errno_for(&e.into()))?;
            Ok::<(), libc::c_int>(())
        })?;

        self.inodes.forget(&record.id);
        self.xattrs.remove(&record.id);
        // queue_delete journals by itself when the drive is offline.
        self.engine
            .upload()
            .queue_delete(record.id.clone(), record.etag.clone());
        Ok(())
    }

    fn refresh_quota(&self) {
        let drive = Arc::clone(self.engine.drive());
        let quota = Arc::clone(&self.quota);
        self.rt.spawn(async move {
            if let Ok(fresh) = drive.quota().await {
                *quota.write().unwrap_or_else(|e| e.into_inner()) = fresh;
            }
        });
    }
}

/// Build kernel attributes from a record.
fn attr_from_record(ino: u64, record: &ItemRecord, uid: u32, gid: u32) -> FileAttr {
    let kind = if record.is_directory() {
        FileType::Directory
    } else {
        FileType::RegularFile
    };
    let perm = if record.is_directory() { 0o755 } else { 0o644 };
    let mtime: SystemTime = record.mtime.into();

    FileAttr {
        ino,
        size: if record.is_directory() { 0 } else { record.size },
        blocks: record.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink: if record.is_directory() { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn directory_attr(ino: u64, uid: u32, gid: u32) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

// ============================================================================
// Filesystem trait
// ============================================================================

impl Filesystem for NimbusFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_id) = self.inodes.id_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };

        // Virtual files exist only at the root.
        if parent == ROOT_INO {
            let real_exists = self
                .rt
                .block_on(self.engine.store().get_by_name(&parent_id, name_str))
                .ok()
                .flatten()
                .is_some();
            if let Some(file) = self.virtuals.lookup(name_str, real_exists) {
                let attr = self.virtual_attr(file);
                reply.entry(&TTL, &attr, 0);
                return;
            }
        }

        let mut found = self
            .rt
            .block_on(self.engine.store().get_by_name(&parent_id, name_str))
            .ok()
            .flatten();
        if found.is_none() && !self.listed.contains(&parent_id) {
            // First miss on an unlisted directory: fetch, then retry.
            self.ensure_listed(&parent_id);
            found = self
                .rt
                .block_on(self.engine.store().get_by_name(&parent_id, name_str))
                .ok()
                .flatten();
        }

        match found {
            Some(record) => {
                let ino = self.inodes.ino_for(&record.id);
                let attr = self.attr_for(ino, &record);
                reply.entry(&TTL, &attr, 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &self.root_attr());
            return;
        }
        if let Some(file) = self.virtuals.by_ino(ino) {
            let attr = self.virtual_attr(file);
            reply.attr(&TTL, &attr);
            return;
        }

        match self.record_for_ino(ino) {
            Ok(record) => {
                // Surface a parked pipeline error exactly once.
                if let Some(error) = &record.last_error {
                    debug!(ino, %error, "Item carries a pipeline error");
                }
                let attr = self.attr_for(ino, &record);
                reply.attr(&TTL, &attr);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(dir_id) = self.inodes.id_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if ino != ROOT_INO {
            match self.record_for_ino(ino) {
                Ok(record) if record.is_directory() => {}
                Ok(_) => {
                    reply.error(libc::ENOTDIR);
                    return;
                }
                Err(errno) => {
                    reply.error(errno);
                    return;
                }
            }
        }

        self.ensure_listed(&dir_id);

        let children = match self.rt.block_on(self.engine.store().children(&dir_id)) {
            Ok(children) => children,
            Err(e) => {
                reply.error(errno_for(&e.into()));
                return;
            }
        };

        let parent_ino = if ino == ROOT_INO {
            ROOT_INO
        } else {
            self.record_for_ino(ino)
                .map(|r| self.inodes.ino_for(&r.parent_id))
                .unwrap_or(ROOT_INO)
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        if ino == ROOT_INO {
            let real_names: Vec<String> =
                children.iter().map(|c| c.name.as_str().to_string()).collect();
            for file in self.virtuals.readdir_entries(&real_names) {
                entries.push((file.ino, FileType::RegularFile, file.name.to_string()));
            }
        }
        for child in &children {
            let child_ino = self.inodes.ino_for(&child.id);
            let kind = if child.is_directory() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child_ino, kind, child.name.as_str().to_string()));

            // Speculative prefetch: queue subdirectory listings at low
            // priority so descending into them is a cache hit.
            if child.is_directory() && !self.listed.contains(&child.id) {
                use nimbus_sync::metadata_queue::{MetadataRequest, Priority};
                let _ = self.rt.block_on(self.engine.metadata_queue().enqueue(
                    MetadataRequest::Children(child.id.clone()),
                    Priority::Low,
                ));
            }
        }

        for (index, (entry_ino, kind, name)) in
            entries.iter().enumerate().skip(offset as usize)
        {
            // The offset handed back to the kernel is the index of the
            // next entry.
            if reply.add(*entry_ino, (index + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == ROOT_INO || self.virtuals.is_virtual_ino(ino) {
            reply.error(libc::EACCES);
            return;
        }
        let Some(id) = self.inodes.id_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let result: Result<ItemRecord, libc::c_int> = self.rt.block_on(async {
            let _guard = self.engine.locks().lock(&id).await;
            let mut record = self
                .engine
                .store()
                .get(&id)
                .await
                .map_err(|e| errno_for(&e.into()))?
                .ok_or(libc::ENOENT)?;

            if let Some(new_size) = size {
                if record.is_directory() {
                    return Err(libc::EISDIR);
                }
                if record.state.blocks_writes() {
                    return Err(libc::EACCES);
                }

                if record.state == ItemState::Ghost {
                    if new_size == 0 {
                        self.materialize_empty(&mut record)?;
                    } else {
                        // Needs content first; hydrate outside this
                        // lock and re-run the whole setattr.
                        return Err(NEEDS_HYDRATION);
                    }
                }
                self.engine
                    .content()
                    .truncate(&id, new_size)
                    .map_err(|e| errno_for(&e.into()))?;
                record.record_write().map_err(|_| libc::EIO)?;
                record.size = new_size;
                record.mtime = chrono::Utc::now();
                record.last_error = None;
                self.engine.upload().unpark(&id);
            }

            if let Some(when) = mtime {
                let when = match when {
                    TimeOrNow::SpecificTime(t) => t.into(),
                    TimeOrNow::Now => chrono::Utc::now(),
                };
                record.mtime = when;
            }

            self.engine
                .store()
                .put(&record)
                .await
                .map_err(|e| errno_for(&e.into()))?;
            Ok(record)
        });

        match result {
            Ok(record) => {
                if size.is_some() {
                    self.engine.upload().kick();
                    if self.engine.is_offline() {
                        self.journal_op(&id, JournalOp::Write { size: record.size });
                    }
                } else if mtime.is_some() {
                    self.journal_op(&id, JournalOp::SetMtime { mtime: record.mtime });
                }
                let attr = self.attr_for(ino, &record);
                reply.attr(&TTL, &attr);
            }
            Err(errno) if errno == NEEDS_HYDRATION => {
                // Ghost truncate to a nonzero size: hydrate, then run
                // the whole setattr once more.
                if let Err(errno) = self.hydrate_blocking(&id) {
                    reply.error(errno);
                    return;
                }
                self.setattr(
                    _req, ino, _mode, _uid, _gid, size, _atime, mtime, _ctime, _fh, _crtime,
                    _chgtime, _bkuptime, _flags, reply,
                );
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.create_item(parent, name, ItemKind::Directory) {
            Ok((ino, record)) => {
                let attr = self.attr_for(ino, &record);
                reply.entry(&TTL, &attr, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        // Only regular files; no devices or pipes on a remote drive.
        if mode & libc::S_IFMT != libc::S_IFREG {
            reply.error(libc::EPERM);
            return;
        }
        match self.create_item(parent, name, ItemKind::File) {
            Ok((ino, record)) => {
                let attr = self.attr_for(ino, &record);
                reply.entry(&TTL, &attr, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_item(parent, name, ItemKind::File) {
            Ok((ino, record)) => {
                let fh = self.handles.open(record.id.clone(), true, false);
                let attr = self.attr_for(ino, &record);
                reply.created(&TTL, &attr, 0, fh, flags as u32);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_id) = self.inodes.id_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };

        let record = match self
            .rt
            .block_on(self.engine.store().get_by_name(&parent_id, name_str))
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(errno_for(&e.into()));
                return;
            }
        };
        if record.is_directory() {
            reply.error(libc::EISDIR);
            return;
        }

        match self.remove_item(&record) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_id) = self.inodes.id_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };

        let record = match self
            .rt
            .block_on(self.engine.store().get_by_name(&parent_id, name_str))
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(errno_for(&e.into()));
                return;
            }
        };
        if !record.is_directory() {
            reply.error(libc::ENOTDIR);
            return;
        }

        // Know the full child set before judging emptiness.
        self.ensure_listed(&record.id);
        match self.rt.block_on(self.engine.store().child_count(&record.id)) {
            Ok(0) => {}
            Ok(_) => {
                reply.error(libc::ENOTEMPTY);
                return;
            }
            Err(e) => {
                reply.error(errno_for(&e.into()));
                return;
            }
        }

        match self.remove_item(&record) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_id), Some(newparent_id)) =
            (self.inodes.id_for(parent), self.inodes.id_for(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let (Some(name_str), Some(newname_str)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let new_name = match FileName::new(newname_str.to_string()) {
            Ok(name) => name,
            Err(_) => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        let result: Result<ItemId, libc::c_int> = self.rt.block_on(async {
            // Parent locks in a fixed order to avoid an ABBA deadlock
            // between concurrent cross-directory renames.
            let (first, second) = if parent_id.as_str() <= newparent_id.as_str() {
                (&parent_id, &newparent_id)
            } else {
                (&newparent_id, &parent_id)
            };
            let _first_guard = self.engine.locks().lock(first).await;
            let _second_guard = if first != second {
                Some(self.engine.locks().lock(second).await)
            } else {
                None
            };

            let source = self
                .engine
                .store()
                .get_by_name(&parent_id, name_str)
                .await
                .map_err(|e| errno_for(&e.into()))?
                .ok_or(libc::ENOENT)?;

            // POSIX rename replaces an existing destination.
            if let Some(dest) = self
                .engine
                .store()
                .get_by_name(&newparent_id, new_name.as_str())
                .await
                .map_err(|e| errno_for(&e.into()))?
            {
                if dest.id != source.id {
                    if dest.is_directory()
                        && self
                            .engine
                            .store()
                            .child_count(&dest.id)
                            .await
                            .map_err(|e| errno_for(&e.into()))?
                            > 0
                    {
                        return Err(libc::ENOTEMPTY);
                    }
                    self.engine
                        .store()
                        .delete(&dest.id)
                        .await
                        .map_err(|e| errno_for(&e.into()))?;
                    self.engine
                        .content()
                        .remove(&dest.id)
                        .map_err(|e| errno_for(&e.into()))?;
                    self.inodes.forget(&dest.id);
                    self.engine.upload().queue_delete(dest.id, dest.etag);
                }
            }

            self.engine
                .store()
                .rename(&source.id, &newparent_id, &new_name)
                .await
                .map_err(|e| errno_for(&e.into()))?;
            Ok(source.id)
        });

        match result {
            Ok(source_id) => {
                self.journal_op(
                    &source_id,
                    JournalOp::Rename {
                        new_parent_id: newparent_id,
                        new_name,
                    },
                );
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if let Some(file) = self.virtuals.by_ino(ino) {
            if flags & libc::O_ACCMODE != libc::O_RDONLY {
                reply.error(libc::EACCES);
                return;
            }
            let fh = self
                .handles
                .open(self.root_id.clone(), false, true);
            debug!(name = file.name, fh, "Opened virtual file");
            reply.opened(fh, 0);
            return;
        }

        let record = match self.record_for_ino(ino) {
            Ok(record) => record,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        if record.is_directory() {
            reply.error(libc::EISDIR);
            return;
        }

        // A parked upload failure surfaces exactly once, then the
        // pipelines get another chance.
        if record.state == ItemState::DirtyLocal {
            if let Some(message) = &record.last_error {
                warn!(ino, %message, "Surfacing parked pipeline error");
                let _ = self
                    .rt
                    .block_on(self.engine.store().set_error(&record.id, None));
                self.engine.upload().unpark(&record.id);
                self.engine.upload().kick();
                reply.error(libc::EIO);
                return;
            }
        }

        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let truncate = flags & libc::O_TRUNC != 0;

        if record.state == ItemState::Ghost {
            if truncate && writable {
                // Content is about to be discarded; skip the download.
                let errno = self.rt.block_on(async {
                    let _guard = self.engine.locks().lock(&record.id).await;
                    let mut record = match self.engine.store().get(&record.id).await {
                        Ok(Some(record)) => record,
                        _ => return Some(libc::ENOENT),
                    };
                    if record.state == ItemState::Ghost {
                        if self.materialize_empty(&mut record).is_err() {
                            return Some(libc::EIO);
                        }
                        if self.engine.store().put(&record).await.is_err() {
                            return Some(libc::EIO);
                        }
                    }
                    None
                });
                if let Some(errno) = errno {
                    reply.error(errno);
                    return;
                }
            } else if let Err(errno) = self.hydrate_blocking(&record.id) {
                reply.error(errno);
                return;
            }
        }

        let fh = self.handles.open(record.id.clone(), writable, false);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if let Some(file) = self.virtuals.by_ino(ino) {
            let start = (offset as usize).min(file.content.len());
            let end = (start + size as usize).min(file.content.len());
            reply.data(&file.content[start..end]);
            return;
        }

        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };

        match self
            .engine
            .content()
            .read_at(&handle.item_id, offset as u64, size)
        {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, fh, error = %e, "Read failed");
                reply.error(libc::EIO);
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if !handle.writable || handle.is_virtual {
            reply.error(libc::EACCES);
            return;
        }
        let id = handle.item_id.clone();

        let result: Result<u64, libc::c_int> = self.rt.block_on(async {
            let _guard = self.engine.locks().lock(&id).await;
            let mut record = self
                .engine
                .store()
                .get(&id)
                .await
                .map_err(|e| errno_for(&e.into()))?
                .ok_or(libc::ENOENT)?;

            if record.state.blocks_writes() {
                return Err(libc::EACCES);
            }
            record.record_write().map_err(|_| libc::EIO)?;

            self.engine
                .content()
                .write_at(&id, offset as u64, data)
                .map_err(|e| errno_for(&e.into()))?;

            record.size = record.size.max(offset as u64 + data.len() as u64);
            record.mtime = chrono::Utc::now();
            record.last_error = None;
            self.engine
                .store()
                .put(&record)
                .await
                .map_err(|e| errno_for(&e.into()))?;
            Ok(record.size)
        });

        match result {
            Ok(size) => {
                self.engine.upload().unpark(&id);
                if self.engine.is_offline() && self.handles.record_write(fh, true) {
                    // One journal entry per open session is enough:
                    // replay pushes whatever bytes are in the cache.
                    let _ = self
                        .rt
                        .block_on(self.engine.journal().append(&id, &JournalOp::Write { size }));
                } else {
                    self.handles.record_write(fh, false);
                }
                debug!(ino, offset, len = data.len(), "Write cached");
                reply.written(data.len() as u32);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.get(fh) {
            if handle.wrote {
                self.engine.upload().kick();
            }
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.close(fh) {
            if handle.wrote {
                self.engine.upload().kick();
            }
            // With the handle gone the item may be evictable again.
            let engine = Arc::clone(&self.engine);
            let protected = self.handles.open_items();
            self.rt.spawn(async move {
                if let Err(e) = engine.enforce_cache_limit(&protected).await {
                    debug!(error = %e, "Cache limit pass failed");
                }
            });
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        self.refresh_quota();
        let quota = *self.quota.read().unwrap_or_else(|e| e.into_inner());

        let blocks = quota.total / BLOCK_SIZE as u64;
        let free = quota.total.saturating_sub(quota.used) / BLOCK_SIZE as u64;
        reply.statfs(blocks, free, free, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(id) = self.inodes.id_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };

        let value = self
            .xattrs
            .get(&id)
            .and_then(|attrs| attrs.get(name_str).cloned());
        match value {
            Some(value) if size == 0 => reply.size(value.len() as u32),
            Some(value) if (value.len() as u32) <= size => reply.data(&value),
            Some(_) => reply.error(libc::ERANGE),
            None => reply.error(libc::ENODATA),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(id) = self.inodes.id_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };

        // Extended attributes are per-mount and in-memory only; they
        // are never pushed to the remote.
        self.xattrs
            .entry(id)
            .or_default()
            .insert(name_str.to_string(), value.to_vec());
        reply.ok();
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(id) = self.inodes.id_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mut buffer = Vec::new();
        if let Some(attrs) = self.xattrs.get(&id) {
            for name in attrs.keys() {
                buffer.extend_from_slice(name.as_bytes());
                buffer.push(0);
            }
        }

        if size == 0 {
            reply.size(buffer.len() as u32);
        } else if (buffer.len() as u32) <= size {
            reply.data(&buffer);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(id) = self.inodes.id_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name_str) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };

        let removed = self
            .xattrs
            .get_mut(&id)
            .map(|mut attrs| attrs.remove(name_str).is_some())
            .unwrap_or(false);
        if removed {
            reply.ok();
        } else {
            reply.error(libc::ENODATA);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use nimbus_core::domain::newtypes::ETag;

    fn record() -> ItemRecord {
        ItemRecord::from_remote(
            ItemId::new("A1".to_string()).unwrap(),
            ItemId::new("ROOT".to_string()).unwrap(),
            FileName::new("doc.txt".to_string()).unwrap(),
            ItemKind::File,
            1536,
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
            Some(ETag::new("\"v1\"".to_string()).unwrap()),
            None,
        )
    }

    #[test]
    fn test_file_attr_mapping() {
        let attr = attr_from_record(42, &record(), 1000, 1000);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 1536);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.uid, 1000);
    }

    #[test]
    fn test_directory_attr_mapping() {
        let mut rec = record();
        rec.kind = ItemKind::Directory;
        rec.size = 4096; // remote reports aggregate sizes for folders
        let attr = attr_from_record(7, &rec, 1000, 1000);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
    }

    #[test]
    fn test_mtime_preserved_in_attr() {
        let rec = record();
        let attr = attr_from_record(1, &rec, 0, 0);
        let expected: SystemTime = rec.mtime.into();
        assert_eq!(attr.mtime, expected);
        assert_eq!(attr.ctime, expected);
    }
}
