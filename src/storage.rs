use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use log::{info, trace, warn};
use memmap2::Mmap;
use nix::sys::inotify::{AddWatchFlags, InotifyEvent, WatchDescriptor};

use crate::data::MtpData;
use crate::dataset::{ObjectInfo, StorageInfo};
use crate::event::{Event, StandardEventCode};
use crate::format::{
    AccessCapability, AssociationType, FilesystemType, ObjHandle, ObjectFormatCode, StorageId,
    StorageType, FORMAT_ASSOCIATION, FORMAT_UNDEFINED, HANDLE_ROOT,
};
use crate::inotify::FsNotify;
use crate::properties::{self, ObjPropDesc};
use crate::response::StandardResponseCode as Resp;
use crate::thumbnailer::{Thumbnailer, ThumbnailerService};
use crate::OpResult;

/// Largest representative sample served inline (48 KiB).
pub const THUMB_MAX_SIZE: u32 = 1024 * 48;
pub const THUMB_WIDTH: u32 = 128;
pub const THUMB_HEIGHT: u32 = 128;

/// Thumbnail files larger than this are never mapped.
const THUMB_FILE_CAP: u64 = 10 << 20;

/// A lone IN_MOVED_FROM whose pair never arrives is committed as a delete
/// after this long.
const MOVE_PAIR_TIMEOUT: Duration = Duration::from_millis(500);

const FOURCC_WMV3: u32 = 0x574D_5633;

/// How symbolic links inside a storage root are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymLinkPolicy {
    AllowAll,
    AllowWithinStorage,
    DenyAll,
}

impl SymLinkPolicy {
    /// Policy selection from `BUTEO_MTP_SYMLINK_POLICY`; unset or unknown
    /// values fall back to DenyAll.
    pub fn from_env() -> SymLinkPolicy {
        match std::env::var("BUTEO_MTP_SYMLINK_POLICY")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "allowall" | "allow" => SymLinkPolicy::AllowAll,
            "allowwithinstorage" | "storage" => SymLinkPolicy::AllowWithinStorage,
            "denyall" | "deny" | "" => SymLinkPolicy::DenyAll,
            other => {
                warn!("unknown symlink policy {:?}, denying all", other);
                SymLinkPolicy::DenyAll
            }
        }
    }
}

/// Allocates object handles (process-wide) and PUOIDs (monotonic above
/// every persisted value). Owned by the factory, threaded into storage
/// calls that create objects.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    next_handle: ObjHandle,
    next_puoid: u128,
}

impl HandleAllocator {
    pub fn next_handle(&mut self) -> ObjHandle {
        self.next_handle += 1;
        self.next_handle
    }

    pub fn next_puoid(&mut self) -> u128 {
        self.next_puoid += 1;
        self.next_puoid
    }

    /// Raise the PUOID floor so newly issued values stay above persisted
    /// ones.
    pub fn seed_puoid(&mut self, largest: u128) {
        self.next_puoid = self.next_puoid.max(largest);
    }
}

/// One object in the graph. Parent/child links index into the owning
/// storage's handle map.
pub struct StorageItem {
    pub handle: ObjHandle,
    pub path: PathBuf,
    pub puoid: u128,
    wd: Option<WatchDescriptor>,
    pub info: Option<ObjectInfo>,
    pub parent: Option<ObjHandle>,
    pub children: Vec<ObjHandle>,
    events_enabled: bool,
}

impl StorageItem {
    fn new(handle: ObjHandle, path: PathBuf, parent: Option<ObjHandle>) -> StorageItem {
        StorageItem {
            handle,
            path,
            puoid: 0,
            wd: None,
            info: None,
            parent,
            children: Vec::new(),
            events_enabled: false,
        }
    }

    fn is_association(&self) -> bool {
        self.info
            .as_ref()
            .map(|info| info.object_format == FORMAT_ASSOCIATION)
            .unwrap_or(false)
    }
}

struct PendingMovedFrom {
    wd: WatchDescriptor,
    cookie: u32,
    name: String,
    since: Instant,
}

/// Filesystem-backed storage: one subtree exported as one MTP storage.
pub struct FsStorage {
    storage_id: StorageId,
    storage_path: PathBuf,
    items: HashMap<ObjHandle, StorageItem>,
    by_path: HashMap<PathBuf, ObjHandle>,
    puoids: HashMap<PathBuf, u128>,
    puoid_to_handle: HashMap<u128, ObjHandle>,
    largest_puoid: u128,
    references: HashMap<ObjHandle, Vec<ObjHandle>>,
    storage_info: StorageInfo,
    symlink_policy: SymLinkPolicy,
    exclude_paths: HashSet<PathBuf>,
    inotify: FsNotify,
    watch_map: HashMap<WatchDescriptor, ObjHandle>,
    pending_move: Option<PendingMovedFrom>,
    write_object: ObjHandle,
    data_file: Option<File>,
    reported_free_space: u64,
    thumbnailer: Thumbnailer,
    puoid_db_path: PathBuf,
    refs_db_path: PathBuf,
    pending_events: Vec<Event>,
}

impl FsStorage {
    pub fn new(
        storage_id: StorageId,
        storage_type: StorageType,
        storage_path: &Path,
        volume_label: &str,
        description: &str,
        db_root: &Path,
        thumb_service: Box<dyn ThumbnailerService>,
    ) -> std::io::Result<FsStorage> {
        fs::create_dir_all(storage_path)?;
        let storage_path = storage_path.canonicalize()?;

        let mut storage_info = StorageInfo {
            storage_type: storage_type as u16,
            filesystem_type: FilesystemType::GenericHierarchical as u16,
            access_capability: AccessCapability::ReadWrite as u16,
            description: description.to_owned(),
            volume_label: volume_label.to_owned(),
            ..Default::default()
        };
        if let Ok(stat) = nix::sys::statvfs::statvfs(&storage_path) {
            storage_info.max_capacity = stat.blocks() as u64 * stat.fragment_size() as u64;
            storage_info.free_space = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        }

        fs::create_dir_all(db_root)?;
        let puoid_db_path = db_root.join(format!(
            "mtppuoids-{}-{}",
            volume_label,
            filesystem_uuid(&storage_path)
        ));
        let refs_db_path = db_root.join("mtpreferences");

        let mask = AddWatchFlags::IN_MOVE
            | AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_CLOSE_WRITE;
        let inotify = FsNotify::new(mask)
            .map_err(|err| std::io::Error::from_raw_os_error(err as i32))?;

        let mut storage = FsStorage {
            storage_id,
            storage_path,
            items: HashMap::new(),
            by_path: HashMap::new(),
            puoids: HashMap::new(),
            puoid_to_handle: HashMap::new(),
            largest_puoid: 0,
            references: HashMap::new(),
            storage_info,
            symlink_policy: SymLinkPolicy::from_env(),
            exclude_paths: HashSet::new(),
            inotify,
            watch_map: HashMap::new(),
            pending_move: None,
            write_object: HANDLE_ROOT,
            data_file: None,
            reported_free_space: 0,
            thumbnailer: Thumbnailer::new(thumb_service),
            puoid_db_path,
            refs_db_path,
            pending_events: Vec::new(),
        };
        storage.populate_puoids();
        storage.reported_free_space = storage.storage_info.free_space;

        info!(
            "{} exported as FS storage {} ({})",
            storage.storage_path.display(),
            volume_label,
            description
        );
        Ok(storage)
    }

    pub fn storage_id(&self) -> StorageId {
        self.storage_id
    }

    pub fn root_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn largest_puoid(&self) -> u128 {
        self.largest_puoid
    }

    /// Paths relative to the storage root that are never exported.
    pub fn exclude_path(&mut self, relative: &str) {
        self.exclude_paths.insert(self.storage_path.join(relative));
    }

    /// Walks the storage subtree, allocating handles and PUOIDs. Called
    /// once, from the enumeration task.
    pub fn enumerate(&mut self, alloc: &mut HandleAllocator) -> OpResult<()> {
        let root = self.storage_path.clone();
        self.add_to_storage(&root, None, false, false, None, alloc)?;
        self.remove_unused_puoids();
        self.populate_object_references();
        info!("storage {} is ready", self.storage_id);
        self.thumbnailer.enable_thumbnailing();
        Ok(())
    }

    /* ===================================================================
     * Object graph bookkeeping
     * =================================================================== */

    fn link_child(&mut self, child: ObjHandle, parent: ObjHandle) {
        if let Some(item) = self.items.get_mut(&parent) {
            item.children.insert(0, child);
        }
    }

    fn unlink_child(&mut self, child: ObjHandle) {
        let parent = self.items.get(&child).and_then(|item| item.parent);
        if let Some(parent) = parent {
            if let Some(item) = self.items.get_mut(&parent) {
                item.children.retain(|&h| h != child);
            }
        }
    }

    fn assign_puoid(&mut self, handle: ObjHandle, alloc: &mut HandleAllocator) {
        let path = match self.items.get(&handle) {
            Some(item) => item.path.clone(),
            None => return,
        };
        let puoid = match self.puoids.get(&path) {
            Some(known) => *known,
            None => {
                let fresh = alloc.next_puoid();
                self.largest_puoid = self.largest_puoid.max(fresh);
                self.puoids.insert(path, fresh);
                fresh
            }
        };
        if let Some(item) = self.items.get_mut(&handle) {
            item.puoid = puoid;
        }
        self.puoid_to_handle.insert(puoid, handle);
    }

    fn check_symlink(&self, path: &Path) -> OpResult<()> {
        let meta = match path.symlink_metadata() {
            Ok(meta) => meta,
            Err(_) => return Err(Resp::AccessDenied),
        };
        if !meta.file_type().is_symlink() {
            return Ok(());
        }
        let target = path.canonicalize().map_err(|_| {
            warn!("excluded broken symlink {}", path.display());
            Resp::AccessDenied
        })?;
        match self.symlink_policy {
            SymLinkPolicy::AllowAll => Ok(()),
            SymLinkPolicy::AllowWithinStorage => {
                if target.starts_with(&self.storage_path) && target != self.storage_path {
                    Ok(())
                } else {
                    info!("excluded out-of-storage symlink {}", path.display());
                    Err(Resp::AccessDenied)
                }
            }
            SymLinkPolicy::DenyAll => {
                info!("excluded symlink {}", path.display());
                Err(Resp::AccessDenied)
            }
        }
    }

    /// Adds one path (and, for directories, its contents) to the graph,
    /// optionally creating the backing file. The workhorse behind
    /// enumeration, SendObjectInfo and inotify-created objects.
    fn add_to_storage(
        &mut self,
        path: &Path,
        info: Option<&ObjectInfo>,
        send_event: bool,
        create_if_not_exist: bool,
        forced_handle: Option<ObjHandle>,
        alloc: &mut HandleAllocator,
    ) -> OpResult<ObjHandle> {
        if self.exclude_paths.contains(path) {
            return Err(Resp::AccessDenied);
        }
        if !create_if_not_exist {
            self.check_symlink(path)?;
        }

        if let Some(&existing) = self.by_path.get(path) {
            return Ok(existing);
        }

        let is_root = path == self.storage_path;
        let parent = if is_root {
            None
        } else {
            let parent_path = path.parent().unwrap_or(&self.storage_path);
            Some(*self.by_path.get(parent_path).unwrap_or(&HANDLE_ROOT))
        };

        let handle = if is_root {
            HANDLE_ROOT
        } else {
            forced_handle.unwrap_or_else(|| alloc.next_handle())
        };

        let mut object_info = match info {
            Some(info) => {
                let mut info = info.clone();
                info.storage_id = self.storage_id.0;
                info
            }
            None => self.build_object_info(path, parent),
        };
        object_info.parent_object = parent.unwrap_or(HANDLE_ROOT);

        let is_dir = object_info.object_format == FORMAT_ASSOCIATION;

        if create_if_not_exist {
            if is_dir {
                create_directory(path)?;
            } else {
                create_file(path, &object_info)?;
            }
        }

        let mut item = StorageItem::new(handle, path.to_owned(), parent);
        item.info = Some(object_info);
        self.items.insert(handle, item);
        self.by_path.insert(path.to_owned(), handle);
        if let Some(parent) = parent {
            self.link_child(handle, parent);
        }
        self.assign_puoid(handle, alloc);

        if is_dir {
            self.add_watch(handle);

            let mut entries: Vec<PathBuf> = fs::read_dir(path)
                .map(|dir| {
                    dir.filter_map(|entry| entry.ok().map(|e| e.path()))
                        .collect()
                })
                .unwrap_or_default();
            entries.sort();
            for entry in entries {
                // refused symlinks and unreadable entries do not stop the walk
                let _ = self.add_to_storage(&entry, None, send_event, false, None, alloc);
            }
        }

        // freshly created objects report the dates the filesystem settled on
        if create_if_not_exist {
            if let Some(item) = self.items.get_mut(&handle) {
                if let Some(info) = item.info.as_mut() {
                    let modified = modified_date(path);
                    info.modification_date = modified.clone();
                    info.capture_date = modified;
                    info.compressed_size = file_size(path);
                }
            }
        }

        if send_event {
            self.push_event(StandardEventCode::ObjectAdded, vec![handle]);
        }

        Ok(handle)
    }

    fn build_object_info(&mut self, path: &Path, parent: Option<ObjHandle>) -> ObjectInfo {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let is_dir = path.is_dir();
        let format = if is_dir {
            FORMAT_ASSOCIATION
        } else {
            format_by_extension(path)
        };

        let mut info = ObjectInfo {
            storage_id: self.storage_id.0,
            object_format: format,
            compressed_size: if is_dir { 0 } else { file_size(path) },
            parent_object: parent.unwrap_or(HANDLE_ROOT),
            association_type: if is_dir {
                AssociationType::GenericFolder as u16
            } else {
                0
            },
            filename,
            ..Default::default()
        };
        info.modification_date = modified_date(path);
        info.capture_date = info.modification_date.clone();

        if is_thumbnailable_image(path) {
            info.thumb_format = ObjectFormatCode::Jfif.value();
            info.thumb_pix_width = THUMB_WIDTH;
            info.thumb_pix_height = THUMB_HEIGHT;
            if let Some(mime) = mime_for_format(format) {
                if let Some(thumb) =
                    self.thumbnailer.request_thumbnail(&path.to_string_lossy(), mime)
                {
                    info.thumb_compressed_size = file_size(&thumb).min(u32::MAX as u64) as u32;
                }
            }
        }
        info
    }

    /* ===================================================================
     * Lookup
     * =================================================================== */

    pub fn check_handle(&self, handle: ObjHandle) -> bool {
        self.items.contains_key(&handle)
    }

    pub fn path_for_handle(&self, handle: ObjHandle) -> OpResult<PathBuf> {
        self.items
            .get(&handle)
            .map(|item| item.path.clone())
            .ok_or(Resp::GeneralError)
    }

    pub fn handle_for_path(&self, path: &Path) -> Option<ObjHandle> {
        self.by_path.get(path).copied()
    }

    pub fn events_enabled(&self, handle: ObjHandle) -> OpResult<bool> {
        self.items
            .get(&handle)
            .map(|item| item.events_enabled)
            .ok_or(Resp::GeneralError)
    }

    pub fn set_events_enabled(&mut self, handle: ObjHandle, enabled: bool) -> OpResult<()> {
        self.items
            .get_mut(&handle)
            .map(|item| item.events_enabled = enabled)
            .ok_or(Resp::GeneralError)
    }

    pub fn disable_object_events(&mut self) {
        for item in self.items.values_mut() {
            item.events_enabled = false;
        }
    }

    /// ObjectInfo for the host. Querying an object's info is the host
    /// showing interest in it, which arms change events for the object.
    pub fn object_info(&mut self, handle: ObjHandle) -> OpResult<&ObjectInfo> {
        if !self.items.contains_key(&handle) {
            return Err(Resp::InvalidObjectHandle);
        }
        self.refresh_object_info(handle);
        let item = self.items.get_mut(&handle).ok_or(Resp::GeneralError)?;
        item.events_enabled = true;
        item.info.as_ref().ok_or(Resp::GeneralError)
    }

    /// ObjectInfo without arming events; internal callers only.
    pub fn item_info(&self, handle: ObjHandle) -> OpResult<&ObjectInfo> {
        self.items
            .get(&handle)
            .ok_or(Resp::InvalidObjectHandle)?
            .info
            .as_ref()
            .ok_or(Resp::GeneralError)
    }

    fn refresh_object_info(&mut self, handle: ObjHandle) {
        let needs_refresh = self
            .items
            .get(&handle)
            .map(|item| item.info.is_none())
            .unwrap_or(false);
        if needs_refresh {
            let (path, parent) = match self.items.get(&handle) {
                Some(item) => (item.path.clone(), item.parent),
                None => return,
            };
            let info = self.build_object_info(&path, parent);
            if let Some(item) = self.items.get_mut(&handle) {
                item.info = Some(info);
            }
        }
    }

    /// Handle listing per the GetObjectHandles association parameter:
    /// 0 selects every object, 0xFFFFFFFF the root's children, anything
    /// else the children of that association.
    pub fn object_handles(
        &self,
        format_code: u16,
        association: ObjHandle,
    ) -> OpResult<Vec<ObjHandle>> {
        let matches = |item: &StorageItem| -> bool {
            format_code == 0
                || item
                    .info
                    .as_ref()
                    .map(|info| info.object_format == format_code)
                    .unwrap_or(false)
        };

        let mut handles = Vec::new();
        match association {
            0x0000_0000 => {
                for (&handle, item) in &self.items {
                    if handle != HANDLE_ROOT && matches(item) {
                        handles.push(handle);
                    }
                }
            }
            0xFFFF_FFFF => {
                let root = self.items.get(&HANDLE_ROOT).ok_or(Resp::InvalidParentObject)?;
                for &child in &root.children {
                    if let Some(item) = self.items.get(&child) {
                        if matches(item) {
                            handles.push(child);
                        }
                    }
                }
            }
            parent => {
                let item = self.items.get(&parent).ok_or(Resp::InvalidParentObject)?;
                if !item.is_association() {
                    return Err(Resp::InvalidParentObject);
                }
                for &child in &item.children {
                    if let Some(child_item) = self.items.get(&child) {
                        if matches(child_item) {
                            handles.push(child);
                        }
                    }
                }
            }
        }
        Ok(handles)
    }

    pub fn storage_info(&mut self) -> OpResult<StorageInfo> {
        let stat =
            nix::sys::statvfs::statvfs(&self.storage_path).map_err(|_| Resp::GeneralError)?;
        self.storage_info.max_capacity = stat.blocks() as u64 * stat.fragment_size() as u64;
        self.storage_info.free_space =
            stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(self.storage_info.clone())
    }

    /* ===================================================================
     * Object creation and deletion
     * =================================================================== */

    /// Creates the object described by `info` under `parent`.
    /// 0xFFFFFFFF leaves the placement to us: the root folder.
    pub fn add_item(
        &mut self,
        mut parent: ObjHandle,
        info: &ObjectInfo,
        alloc: &mut HandleAllocator,
    ) -> OpResult<(ObjHandle, ObjHandle)> {
        if parent == 0xFFFF_FFFF {
            parent = HANDLE_ROOT;
        }
        if !self.check_handle(parent) {
            return Err(Resp::InvalidParentObject);
        }
        if !is_file_name_valid(&info.filename) {
            return Err(Resp::InvalidDataset);
        }

        let parent_path = self.path_for_handle(parent)?;
        let path = parent_path.join(&info.filename);
        if self.by_path.contains_key(&path) || path.exists() {
            return Err(Resp::InvalidDataset);
        }

        let handle = self.add_to_storage(&path, Some(info), false, true, None, alloc)?;
        let parent = self
            .items
            .get(&handle)
            .and_then(|item| item.parent)
            .unwrap_or(HANDLE_ROOT);
        Ok((parent, handle))
    }

    /// Recreates an object of another storage here, under the same handle.
    /// Safe because handles are allocated globally.
    pub fn copy_handle_from(
        &mut self,
        source_storage: &FsStorage,
        source: ObjHandle,
        mut parent: ObjHandle,
        alloc: &mut HandleAllocator,
    ) -> OpResult<()> {
        if self.items.contains_key(&source) {
            return Err(Resp::InvalidDataset);
        }
        if parent == 0xFFFF_FFFF {
            parent = HANDLE_ROOT;
        }
        if !self.check_handle(parent) {
            return Err(Resp::InvalidParentObject);
        }

        let info = source_storage.item_info(source)?.clone();
        let parent_path = self.path_for_handle(parent)?;
        let path = parent_path.join(&info.filename);

        let mut new_info = info.clone();
        new_info.parent_object = parent;
        self.add_to_storage(&path, Some(&new_info), false, true, Some(source), alloc)?;

        if info.object_format == FORMAT_ASSOCIATION {
            let children = source_storage.object_handles(0, source)?;
            for child in children {
                self.copy_handle_from(source_storage, child, source, alloc)?;
            }
            Ok(())
        } else {
            self.copy_file_contents(source_storage, source, source)
        }
    }

    fn copy_file_contents(
        &mut self,
        source_storage: &FsStorage,
        source: ObjHandle,
        destination: ObjHandle,
    ) -> OpResult<()> {
        let total = source_storage.item_info(source)?.compressed_size;
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        let mut first = true;
        while offset < total {
            let chunk = buf.len().min((total - offset) as usize);
            source_storage.read_data(source, offset, &mut buf[..chunk])?;
            self.write_data(destination, Some(&buf[..chunk]), first, false)?;
            offset += chunk as u64;
            first = false;
        }
        if first {
            // zero-length file still needs its open/close cycle
            self.write_data(destination, Some(&[]), true, false)?;
        }
        self.write_data(destination, None, false, true)
    }

    /// Copy within this storage; a fresh handle is allocated.
    pub fn copy_within(
        &mut self,
        handle: ObjHandle,
        mut parent: ObjHandle,
        alloc: &mut HandleAllocator,
    ) -> OpResult<ObjHandle> {
        if parent == 0xFFFF_FFFF {
            parent = HANDLE_ROOT;
        }
        if !self.check_handle(handle) {
            return Err(Resp::InvalidObjectHandle);
        }
        if !self.check_handle(parent) {
            return Err(Resp::InvalidParentObject);
        }

        let info = self.item_info(handle)?.clone();
        let free = self.storage_info()?.free_space;
        if free < info.compressed_size {
            return Err(Resp::StoreFull);
        }

        let source_path = self.path_for_handle(handle)?;
        let parent_path = self.path_for_handle(parent)?;
        let destination = parent_path.join(&info.filename);
        if info.object_format == FORMAT_ASSOCIATION {
            // refuse copying a directory into itself or below itself
            if parent_path.starts_with(&source_path) {
                return Err(Resp::InvalidParentObject);
            }
            if self.by_path.contains_key(&destination) {
                return Err(Resp::InvalidParentObject);
            }
        }

        // suppress inotify noise about our own writes into the destination
        self.remove_watch(parent);

        let mut new_info = info.clone();
        new_info.parent_object = parent;
        let result = (|| -> OpResult<ObjHandle> {
            let copied = self.add_to_storage(&destination, Some(&new_info), false, true, None, alloc)?;
            if info.object_format == FORMAT_ASSOCIATION {
                let children: Vec<ObjHandle> = self
                    .items
                    .get(&handle)
                    .map(|item| item.children.clone())
                    .unwrap_or_default();
                for child in children {
                    self.copy_within(child, copied, alloc)?;
                }
            } else {
                let total = info.compressed_size;
                let mut buf = vec![0u8; 64 * 1024];
                let mut offset = 0u64;
                let mut source_file =
                    File::open(&source_path).map_err(|_| Resp::AccessDenied)?;
                let mut first = true;
                while offset < total || first {
                    let chunk = buf.len().min((total - offset) as usize);
                    source_file
                        .read_exact(&mut buf[..chunk])
                        .map_err(|_| Resp::GeneralError)?;
                    self.write_data(copied, Some(&buf[..chunk]), first, false)?;
                    offset += chunk as u64;
                    first = false;
                }
                self.write_data(copied, None, false, true)?;
            }
            Ok(copied)
        })();

        self.add_watch(parent);
        result
    }

    /// DeleteObject. Handle 0xFFFFFFFF iterates a snapshot of every object,
    /// filtered by format; per MTPv1.1 D.2.11 a mixed outcome is
    /// PartialDeletion.
    pub fn delete_item(&mut self, handle: ObjHandle, format_code: u16) -> OpResult<()> {
        if handle != 0xFFFF_FFFF {
            return self.delete_item_helper(handle, true, false);
        }

        let mut deleted_some = false;
        let mut failed_some = false;
        let mut last_error = Resp::GeneralError;
        // the root stands for the storage itself, not an object to delete
        let snapshot: Vec<ObjHandle> = self
            .items
            .keys()
            .copied()
            .filter(|&handle| handle != HANDLE_ROOT)
            .collect();
        for candidate in snapshot {
            if format_code != 0 && format_code != FORMAT_UNDEFINED {
                let matches = self
                    .items
                    .get(&candidate)
                    .and_then(|item| item.info.as_ref())
                    .map(|info| info.object_format == format_code)
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            match self.delete_item_helper(candidate, true, false) {
                Ok(()) => deleted_some = true,
                // children already deleted with their parent
                Err(Resp::InvalidObjectHandle) => {}
                Err(err) => {
                    failed_some = true;
                    last_error = err;
                }
            }
        }

        if deleted_some && failed_some {
            Err(Resp::PartialDeletion)
        } else if failed_some {
            Err(last_error)
        } else {
            Ok(())
        }
    }

    fn delete_item_helper(
        &mut self,
        handle: ObjHandle,
        remove_physically: bool,
        send_event: bool,
    ) -> OpResult<()> {
        if !self.check_handle(handle) {
            return Err(Resp::InvalidObjectHandle);
        }
        // Deleting the root is too dangerous; it might be $HOME.
        if handle == HANDLE_ROOT {
            return Err(Resp::ObjectWriteProtected);
        }

        let (path, is_dir, children) = {
            let item = self.items.get(&handle).ok_or(Resp::GeneralError)?;
            (item.path.clone(), item.is_association(), item.children.clone())
        };

        if children.is_empty() {
            if remove_physically {
                let result = if is_dir {
                    fs::remove_dir(&path)
                } else {
                    fs::remove_file(&path)
                };
                if result.is_err() {
                    return Err(Resp::GeneralError);
                }
            }
            self.remove_from_storage(handle, send_event);
            Ok(())
        } else {
            for child in children {
                if self
                    .delete_item_helper(child, remove_physically, send_event)
                    .is_err()
                {
                    return Err(Resp::PartialDeletion);
                }
            }
            self.delete_item_helper(handle, remove_physically, send_event)
        }
    }

    fn remove_from_storage(&mut self, handle: ObjHandle, send_event: bool) {
        if let Some(item) = self.items.get(&handle) {
            if item.wd.is_some() {
                self.remove_watch(handle);
            }
        }
        self.unlink_child(handle);
        if let Some(item) = self.items.remove(&handle) {
            self.by_path.remove(&item.path);
            self.puoid_to_handle.remove(&item.puoid);
        }
        if send_event {
            self.push_event(StandardEventCode::ObjectRemoved, vec![handle]);
        }
    }

    /* ===================================================================
     * Move
     * =================================================================== */

    /// Move within this storage. `move_physically` is false when the
    /// filesystem already performed the rename (inotify-observed moves).
    pub fn move_within(
        &mut self,
        handle: ObjHandle,
        parent: ObjHandle,
        move_physically: bool,
    ) -> OpResult<()> {
        if !self.check_handle(handle) {
            return Err(Resp::InvalidObjectHandle);
        }
        if !self.check_handle(parent) {
            return Err(Resp::InvalidParentObject);
        }

        let (source_path, filename, is_dir) = {
            let item = self.items.get(&handle).ok_or(Resp::GeneralError)?;
            let info = item.info.as_ref().ok_or(Resp::GeneralError)?;
            (item.path.clone(), info.filename.clone(), item.is_association())
        };
        let parent_path = self.path_for_handle(parent)?;
        let destination = parent_path.join(&filename);

        if is_dir && self.by_path.contains_key(&destination) {
            return Err(Resp::InvalidParentObject);
        }

        // Watches come off before the rename so we do not chase our own
        // MOVED_FROM/MOVED_TO pair.
        self.remove_watch_recursively(handle);

        if move_physically && fs::rename(&source_path, &destination).is_err() {
            self.add_watch_recursively(handle);
            return Err(Resp::InvalidParentObject);
        }

        self.by_path.remove(&source_path);
        if let Some(puoid) = self.puoids.remove(&source_path) {
            self.puoids.insert(destination.clone(), puoid);
        }
        self.by_path.insert(destination.clone(), handle);
        self.unlink_child(handle);
        self.link_child(handle, parent);
        {
            let item = self.items.get_mut(&handle).ok_or(Resp::GeneralError)?;
            item.path = destination.clone();
            item.parent = Some(parent);
            if let Some(info) = item.info.as_mut() {
                info.parent_object = parent;
            }
        }
        let children: Vec<ObjHandle> = self
            .items
            .get(&handle)
            .map(|item| item.children.clone())
            .unwrap_or_default();
        for child in children {
            self.adjust_moved_items_path(&destination, child);
        }
        self.add_watch_recursively(handle);
        Ok(())
    }

    fn adjust_moved_items_path(&mut self, new_ancestor: &Path, handle: ObjHandle) {
        let (old_path, filename, children) = match self.items.get(&handle) {
            Some(item) => (
                item.path.clone(),
                item.info
                    .as_ref()
                    .map(|info| info.filename.clone())
                    .unwrap_or_default(),
                item.children.clone(),
            ),
            None => return,
        };
        let new_path = new_ancestor.join(filename);
        self.by_path.remove(&old_path);
        if let Some(puoid) = self.puoids.remove(&old_path) {
            self.puoids.insert(new_path.clone(), puoid);
        }
        self.by_path.insert(new_path.clone(), handle);
        if let Some(item) = self.items.get_mut(&handle) {
            item.path = new_path.clone();
        }
        for child in children {
            self.adjust_moved_items_path(&new_path, child);
        }
    }

    /* ===================================================================
     * Content I/O
     * =================================================================== */

    /// Reads exactly `buf.len()` bytes at `offset`. One open per call;
    /// segmentation happens at the container layer.
    pub fn read_data(&self, handle: ObjHandle, offset: u64, buf: &mut [u8]) -> OpResult<()> {
        let item = self.items.get(&handle).ok_or(Resp::InvalidObjectHandle)?;
        let mut file = File::open(&item.path).map_err(|_| Resp::AccessDenied)?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        if size < offset + buf.len() as u64 {
            warn!("short file {}", item.path.display());
            return Err(Resp::GeneralError);
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Resp::GeneralError)?;
        file.read_exact(buf).map_err(|_| Resp::GeneralError)?;
        Ok(())
    }

    /// SendObject write path. The first segment opens the file and rewinds;
    /// the final `(None, last)` call truncates at the write position,
    /// closes, and puts the cached modification time back.
    pub fn write_data(
        &mut self,
        handle: ObjHandle,
        data: Option<&[u8]>,
        first_segment: bool,
        last_segment: bool,
    ) -> OpResult<()> {
        if !self.check_handle(handle) {
            return Err(Resp::InvalidObjectHandle);
        }

        if last_segment && data.is_none() {
            self.write_object = HANDLE_ROOT;
            if let Some(mut file) = self.data_file.take() {
                let pos = file.stream_position().unwrap_or(0);
                let _ = file.flush();
                let _ = file.set_len(pos);
                drop(file);
                self.restore_cached_mtime(handle);
                self.refresh_after_write(handle);
            }
            return Ok(());
        }

        self.write_object = handle;
        let path = self.path_for_handle(handle).map_err(|_| Resp::GeneralError)?;
        if first_segment {
            let existed = path.exists();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|_| Resp::GeneralError)?;
            if !existed {
                chown_to_real_ids(&file, &path);
            }
            // The file was typically preallocated by createFile; overwrite
            // from offset zero.
            let mut file = file;
            file.seek(SeekFrom::Start(0)).map_err(|_| Resp::GeneralError)?;
            self.data_file = Some(file);
            self.restore_cached_mtime(handle);
        }

        if let (Some(file), Some(mut remaining)) = (self.data_file.as_mut(), data) {
            while !remaining.is_empty() {
                match file.write(remaining) {
                    Ok(written) => remaining = &remaining[written..],
                    Err(_) => {
                        warn!("write failed for {}", path.display());
                        return Err(Resp::GeneralError);
                    }
                }
            }
        }
        Ok(())
    }

    /// SendPartialObject64 write path: explicit offset, mtime preserved on
    /// close, no truncation.
    pub fn write_partial_data(
        &mut self,
        handle: ObjHandle,
        offset: u64,
        data: &[u8],
        first_segment: bool,
        last_segment: bool,
    ) -> OpResult<()> {
        if !self.check_handle(handle) {
            return Err(Resp::InvalidObjectHandle);
        }
        let path = self.path_for_handle(handle)?;

        let mut code = Ok(());
        if first_segment {
            trace!("open for writing {}", path.display());
            self.write_object = handle;
            self.data_file = None;
            let existed = path.exists();
            match OpenOptions::new().read(true).write(true).create(true).open(&path) {
                Ok(file) => {
                    if !existed {
                        chown_to_real_ids(&file, &path);
                    }
                    self.data_file = Some(file);
                }
                Err(_) => code = Err(Resp::GeneralError),
            }
        }

        if code.is_ok() {
            if let Some(file) = self.data_file.as_mut() {
                if self.write_object != handle {
                    code = Err(Resp::GeneralError);
                } else if file.seek(SeekFrom::Start(offset)).is_err() {
                    code = Err(Resp::GeneralError);
                } else {
                    let mut remaining = data;
                    while !remaining.is_empty() {
                        match file.write(remaining) {
                            Ok(written) => remaining = &remaining[written..],
                            Err(_) => {
                                code = Err(Resp::GeneralError);
                                break;
                            }
                        }
                    }
                }
            }
        }

        if code.is_err() || last_segment {
            if let Some(mut file) = self.data_file.take() {
                let _ = file.flush();
                drop(file);
                self.restore_cached_mtime(handle);
                self.refresh_after_write(handle);
            }
            self.write_object = HANDLE_ROOT;
        }
        code
    }

    pub fn truncate_item(&mut self, handle: ObjHandle, size: u64) -> OpResult<()> {
        let item = self.items.get_mut(&handle).ok_or(Resp::InvalidObjectHandle)?;
        let info = item.info.as_mut().ok_or(Resp::GeneralError)?;
        if info.object_format == FORMAT_ASSOCIATION {
            return Err(Resp::GeneralError);
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&item.path)
            .map_err(|_| Resp::GeneralError)?;
        file.set_len(size).map_err(|_| Resp::GeneralError)?;
        info.compressed_size = size;
        Ok(())
    }

    fn restore_cached_mtime(&self, handle: ObjHandle) {
        if let Some(item) = self.items.get(&handle) {
            if let Some(info) = item.info.as_ref() {
                if let Some(timestamp) = datetime_to_timestamp(&info.modification_date) {
                    set_file_mtime(&item.path, timestamp);
                }
            }
        }
    }

    fn refresh_after_write(&mut self, handle: ObjHandle) {
        if let Some(item) = self.items.get_mut(&handle) {
            if let Some(info) = item.info.as_mut() {
                info.compressed_size = file_size(&item.path);
                info.modification_date = modified_date(&item.path);
                info.capture_date = info.modification_date.clone();
            }
        }
    }

    /* ===================================================================
     * Object references
     * =================================================================== */

    pub fn get_references(&mut self, handle: ObjHandle) -> OpResult<Vec<ObjHandle>> {
        if !self.items.contains_key(&handle) {
            self.remove_invalid_object_references(handle);
            return Err(Resp::InvalidObjectHandle);
        }
        let Some(references) = self.references.get(&handle).cloned() else {
            return Ok(Vec::new());
        };
        // drop references to objects that have since disappeared
        let live: Vec<ObjHandle> = references
            .into_iter()
            .filter(|reference| self.items.contains_key(reference))
            .collect();
        self.references.insert(handle, live.clone());
        Ok(live)
    }

    pub fn set_references(&mut self, handle: ObjHandle, references: &[ObjHandle]) -> OpResult<()> {
        if !self.items.contains_key(&handle) {
            return Err(Resp::InvalidObjectHandle);
        }
        for reference in references {
            if !self.items.contains_key(reference) {
                return Err(Resp::InvalidObjectReference);
            }
        }
        self.references.insert(handle, references.to_vec());
        Ok(())
    }

    fn remove_invalid_object_references(&mut self, handle: ObjHandle) {
        self.references.remove(&handle);
        for references in self.references.values_mut() {
            references.retain(|&reference| reference != handle);
        }
    }

    /* ===================================================================
     * Property values
     * =================================================================== */

    pub fn get_object_property_value(
        &mut self,
        handle: ObjHandle,
        desc: &ObjPropDesc,
    ) -> OpResult<MtpData> {
        let info = {
            if !self.items.contains_key(&handle) {
                return Err(Resp::InvalidObjectHandle);
            }
            self.refresh_object_info(handle);
            self.item_info(handle)?.clone()
        };

        let value = match desc.code {
            properties::OBJ_PROP_ASSOCIATION_DESC => MtpData::UINT32(0),
            properties::OBJ_PROP_ASSOCIATION_TYPE => MtpData::UINT16(info.association_type),
            properties::OBJ_PROP_PARENT_OBJECT => MtpData::UINT32(info.parent_object),
            properties::OBJ_PROP_OBJECT_SIZE => MtpData::UINT64(info.compressed_size),
            properties::OBJ_PROP_STORAGE_ID => MtpData::UINT32(info.storage_id),
            properties::OBJ_PROP_OBJECT_FORMAT => MtpData::UINT16(info.object_format),
            properties::OBJ_PROP_PROTECTION_STATUS => MtpData::UINT16(info.protection_status),
            properties::OBJ_PROP_ALLOWED_FOLDER_CONTENTS => MtpData::AINT16(Vec::new()),
            properties::OBJ_PROP_DATE_MODIFIED => MtpData::STR(info.modification_date),
            properties::OBJ_PROP_DATE_CREATED | properties::OBJ_PROP_DATE_ADDED => {
                MtpData::STR(info.capture_date)
            }
            properties::OBJ_PROP_OBJECT_FILE_NAME => MtpData::STR(info.filename),
            properties::OBJ_PROP_REP_SAMPLE_FORMAT => {
                MtpData::UINT16(ObjectFormatCode::Jfif.value())
            }
            properties::OBJ_PROP_REP_SAMPLE_SIZE => MtpData::UINT32(THUMB_MAX_SIZE),
            properties::OBJ_PROP_REP_SAMPLE_HEIGHT => MtpData::UINT32(THUMB_HEIGHT),
            properties::OBJ_PROP_REP_SAMPLE_WIDTH => MtpData::UINT32(THUMB_WIDTH),
            properties::OBJ_PROP_VIDEO_FOURCC_CODEC => MtpData::UINT32(FOURCC_WMV3),
            properties::OBJ_PROP_CORRUPT_UNPLAYABLE | properties::OBJ_PROP_HIDDEN => {
                MtpData::UINT8(0)
            }
            properties::OBJ_PROP_PERSISTENT_UNIQUE_ID => {
                let item = self.items.get(&handle).ok_or(Resp::GeneralError)?;
                MtpData::UINT128(item.puoid)
            }
            properties::OBJ_PROP_NON_CONSUMABLE => MtpData::UINT8(0),
            properties::OBJ_PROP_REP_SAMPLE_DATA => self.representative_sample(handle, &info),
            _ => return Err(Resp::ObjectPropNotSupported),
        };
        Ok(value)
    }

    fn representative_sample(&mut self, handle: ObjHandle, info: &ObjectInfo) -> MtpData {
        let Some(item) = self.items.get(&handle) else {
            return MtpData::AUINT8(Vec::new());
        };
        let path = item.path.clone();
        if !is_thumbnailable_image(&path) {
            return MtpData::AUINT8(Vec::new());
        }
        let Some(mime) = mime_for_format(info.object_format) else {
            return MtpData::AUINT8(Vec::new());
        };
        let Some(thumb_path) = self
            .thumbnailer
            .request_thumbnail(&path.to_string_lossy(), mime)
        else {
            trace!("{} has no thumbnail yet", path.display());
            return MtpData::AUINT8(Vec::new());
        };

        let Ok(file) = File::open(&thumb_path) else {
            return MtpData::AUINT8(Vec::new());
        };
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        if size == 0 || size > THUMB_FILE_CAP {
            warn!("thumbnail {} is unusable ({} bytes)", thumb_path.display(), size);
            return MtpData::AUINT8(Vec::new());
        }
        match unsafe { Mmap::map(&file) } {
            Ok(map) => MtpData::AUINT8(map.to_vec()),
            Err(_) => MtpData::AUINT8(Vec::new()),
        }
    }

    /// One-pass property retrieval for every child of an association.
    pub fn get_child_property_values(
        &mut self,
        handle: ObjHandle,
        descs: &[ObjPropDesc],
    ) -> OpResult<Vec<(ObjHandle, Vec<MtpData>)>> {
        if !self.check_handle(handle) {
            return Err(Resp::InvalidObjectHandle);
        }
        if !self.items.get(&handle).map(|i| i.is_association()).unwrap_or(false) {
            return Err(Resp::InvalidObjectHandle);
        }
        let children: Vec<ObjHandle> = self
            .items
            .get(&handle)
            .map(|item| item.children.clone())
            .unwrap_or_default();

        let mut values = Vec::with_capacity(children.len());
        for child in children {
            let mut child_values = Vec::with_capacity(descs.len());
            for desc in descs {
                child_values.push(
                    self.get_object_property_value(child, desc)
                        .unwrap_or(MtpData::UNDEF),
                );
            }
            values.push((child, child_values));
        }
        Ok(values)
    }

    /// Only the filename is materialized on the filesystem; everything else
    /// belongs to the metadata collaborators.
    pub fn set_object_property_value(
        &mut self,
        handle: ObjHandle,
        entries: &[(&ObjPropDesc, MtpData)],
    ) -> OpResult<()> {
        if !self.items.contains_key(&handle) {
            return Err(Resp::GeneralError);
        }
        for (desc, value) in entries {
            if desc.code != properties::OBJ_PROP_OBJECT_FILE_NAME {
                continue;
            }
            let new_name = value.as_str().ok_or(Resp::InvalidObjectPropValue)?.to_owned();
            let (old_path, parent) = {
                let item = self.items.get(&handle).ok_or(Resp::GeneralError)?;
                (item.path.clone(), item.parent)
            };
            if !is_file_name_valid(&new_name) {
                warn!("bad file name {:?} in property write", new_name);
                return Err(Resp::InvalidObjectPropValue);
            }
            let parent_path = old_path.parent().ok_or(Resp::GeneralError)?.to_owned();
            let new_path = parent_path.join(&new_name);
            if self.by_path.contains_key(&new_path) {
                return Err(Resp::InvalidObjectPropValue);
            }
            if fs::rename(&old_path, &new_path).is_err() {
                return Err(Resp::GeneralError);
            }

            self.by_path.remove(&old_path);
            let puoid = self.puoids.remove(&old_path);
            self.by_path.insert(new_path.clone(), handle);
            {
                let item = self.items.get_mut(&handle).ok_or(Resp::GeneralError)?;
                item.path = new_path.clone();
                if let Some(puoid) = puoid.or(Some(item.puoid)) {
                    self.puoids.insert(new_path.clone(), puoid);
                }
            }
            if let Some(item) = self.items.get_mut(&handle) {
                if let Some(info) = item.info.as_mut() {
                    info.filename = new_name.clone();
                }
            }
            self.remove_watch_recursively(handle);
            self.add_watch_recursively(handle);
            let children: Vec<ObjHandle> = self
                .items
                .get(&handle)
                .map(|item| item.children.clone())
                .unwrap_or_default();
            for child in children {
                self.adjust_moved_items_path(&new_path, child);
            }
            let _ = parent;
        }
        Ok(())
    }

    /* ===================================================================
     * Change tracking
     * =================================================================== */

    fn push_event(&mut self, code: StandardEventCode, params: Vec<u32>) {
        self.pending_events.push(Event { code, params });
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    fn add_watch(&mut self, handle: ObjHandle) {
        let Some(item) = self.items.get(&handle) else { return };
        if !item.is_association() {
            return;
        }
        let path = item.path.clone();
        if let Some(wd) = self.inotify.add_watch(&path) {
            if let Some(item) = self.items.get_mut(&handle) {
                item.wd = Some(wd);
            }
            self.watch_map.insert(wd, handle);
        }
    }

    fn remove_watch(&mut self, handle: ObjHandle) {
        let wd = match self.items.get_mut(&handle) {
            Some(item) => item.wd.take(),
            None => None,
        };
        if let Some(wd) = wd {
            self.inotify.remove_watch(wd);
            self.watch_map.remove(&wd);
        }
    }

    fn add_watch_recursively(&mut self, handle: ObjHandle) {
        if !self.items.get(&handle).map(|i| i.is_association()).unwrap_or(false) {
            return;
        }
        self.add_watch(handle);
        let children: Vec<ObjHandle> = self
            .items
            .get(&handle)
            .map(|item| item.children.clone())
            .unwrap_or_default();
        for child in children {
            self.add_watch_recursively(child);
        }
    }

    fn remove_watch_recursively(&mut self, handle: ObjHandle) {
        if !self.items.get(&handle).map(|i| i.is_association()).unwrap_or(false) {
            return;
        }
        self.remove_watch(handle);
        let children: Vec<ObjHandle> = self
            .items
            .get(&handle)
            .map(|item| item.children.clone())
            .unwrap_or_default();
        for child in children {
            self.remove_watch_recursively(child);
        }
    }

    /// Drains the inotify queue, pairing MOVED_FROM/MOVED_TO by cookie and
    /// translating the rest into object events. Called from the responder
    /// loop.
    pub fn process_fs_events(&mut self, alloc: &mut HandleAllocator, now: Instant) {
        let events = self.inotify.drain();
        for event in events {
            self.handle_inotify_event(&event, alloc);
        }

        // a lone MOVED_FROM whose pair never arrived is an external delete
        let expired = self
            .pending_move
            .as_ref()
            .map(|pending| now.duration_since(pending.since) >= MOVE_PAIR_TIMEOUT)
            .unwrap_or(false);
        if expired {
            if let Some(pending) = self.pending_move.take() {
                self.handle_fs_delete(pending.wd, &pending.name);
            }
        }
    }

    fn handle_inotify_event(&mut self, event: &InotifyEvent, alloc: &mut HandleAllocator) {
        let name = match event.name.as_ref() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return,
        };

        // an unpaired MOVED_FROM followed by any event with a different
        // cookie means the object left the storage
        if let Some(pending) = self.pending_move.take() {
            if pending.cookie == event.cookie && event.mask.contains(AddWatchFlags::IN_MOVED_TO) {
                self.pending_move = Some(pending);
            } else {
                self.handle_fs_delete(pending.wd, &pending.name);
            }
        }

        if event.mask.contains(AddWatchFlags::IN_CREATE) {
            self.handle_fs_create(event.wd, &name, alloc);
        }
        if event.mask.contains(AddWatchFlags::IN_DELETE) {
            self.handle_fs_delete(event.wd, &name);
        }
        if event.mask.contains(AddWatchFlags::IN_MOVED_TO) {
            match self.pending_move.take() {
                // a cookie pair is a move/rename within the storage
                Some(pending) => {
                    self.handle_fs_move(pending.wd, &pending.name, event.wd, &name)
                }
                // otherwise something was moved in from outside
                None => self.handle_fs_create(event.wd, &name, alloc),
            }
        }
        if event.mask.contains(AddWatchFlags::IN_MOVED_FROM) {
            // nothing to do with it until its pair or a timeout shows up
            self.pending_move = Some(PendingMovedFrom {
                wd: event.wd,
                cookie: event.cookie,
                name,
                since: Instant::now(),
            });
            return;
        }
        if event.mask.contains(AddWatchFlags::IN_CLOSE_WRITE) {
            self.handle_fs_modify(event.wd, &name);
        }
    }

    fn watched_child_path(&self, wd: WatchDescriptor, name: &str) -> Option<(ObjHandle, PathBuf)> {
        let parent = *self.watch_map.get(&wd)?;
        let parent_item = self.items.get(&parent)?;
        if parent_item.wd != Some(wd) {
            return None;
        }
        Some((parent, parent_item.path.join(name)))
    }

    fn handle_fs_create(&mut self, wd: WatchDescriptor, name: &str, alloc: &mut HandleAllocator) {
        let Some((_, path)) = self.watched_child_path(wd, name) else { return };
        if self.by_path.contains_key(&path) {
            return;
        }
        trace!("external create {}", path.display());
        let _ = self.add_to_storage(&path, None, true, false, None, alloc);
        self.send_storage_info_changed();
    }

    fn handle_fs_delete(&mut self, wd: WatchDescriptor, name: &str) {
        let Some((_, path)) = self.watched_child_path(wd, name) else { return };
        if let Some(&handle) = self.by_path.get(&path) {
            trace!("external delete {}", path.display());
            let _ = self.delete_item_helper(handle, false, true);
        }
        self.send_storage_info_changed();
    }

    fn handle_fs_move(
        &mut self,
        from_wd: WatchDescriptor,
        from_name: &str,
        to_wd: WatchDescriptor,
        to_name: &str,
    ) {
        if from_wd == to_wd && from_name == to_name {
            return;
        }
        let Some((from_parent, old_path)) = self.watched_child_path(from_wd, from_name) else {
            return;
        };
        let Some((to_parent, new_path)) = self.watched_child_path(to_wd, to_name) else {
            return;
        };
        let Some(&moved) = self.by_path.get(&old_path) else { return };

        if self.by_path.contains_key(&new_path) {
            // the destination is already known; the source entry just goes
            let _ = self.delete_item_helper(moved, false, true);
            return;
        }

        trace!("external move {} -> {}", old_path.display(), new_path.display());
        if from_parent == to_parent {
            // rename in place
            self.by_path.remove(&old_path);
            if let Some(puoid) = self.puoids.remove(&old_path) {
                self.puoids.insert(new_path.clone(), puoid);
            }
            self.by_path.insert(new_path.clone(), moved);
            if let Some(item) = self.items.get_mut(&moved) {
                item.path = new_path.clone();
                if let Some(info) = item.info.as_mut() {
                    info.filename = to_name.to_owned();
                }
            }
            let children: Vec<ObjHandle> = self
                .items
                .get(&moved)
                .map(|item| item.children.clone())
                .unwrap_or_default();
            for child in children {
                self.adjust_moved_items_path(&new_path, child);
            }
            self.remove_watch_recursively(moved);
            self.add_watch_recursively(moved);
        } else if self.move_within(moved, to_parent, false).is_err() {
            return;
        }

        // the cached dataset is stale either way
        if let Some(item) = self.items.get_mut(&moved) {
            item.info = None;
        }
        self.refresh_object_info(moved);

        let from_enabled = self.events_enabled(from_parent).unwrap_or(false);
        if from_enabled {
            let _ = self.set_events_enabled(to_parent, true);
        }
        self.push_event(StandardEventCode::ObjectInfoChanged, vec![moved]);
    }

    fn handle_fs_modify(&mut self, wd: WatchDescriptor, name: &str) {
        let Some((_, path)) = self.watched_child_path(wd, name) else { return };
        let Some(&changed) = self.by_path.get(&path) else { return };
        // our own in-progress write; the host that asked for it does not
        // need to hear about it
        if changed == self.write_object {
            return;
        }

        let previous = self.items.get(&changed).and_then(|item| item.info.clone());
        if let Some(item) = self.items.get_mut(&changed) {
            item.info = None;
        }
        self.refresh_object_info(changed);
        let current = self.items.get(&changed).and_then(|item| item.info.clone());
        if previous != current {
            self.push_event(StandardEventCode::ObjectInfoChanged, vec![changed]);
        }
        self.send_storage_info_changed();
    }

    /// StorageInfoChanged is emitted on whole-percent free-space movement
    /// so large writes do not flood the interrupt pipe.
    fn send_storage_info_changed(&mut self) {
        let Ok(info) = self.storage_info() else { return };
        if info.max_capacity == 0 {
            return;
        }
        let old_percent = 100 * self.reported_free_space / info.max_capacity;
        let new_percent = 100 * info.free_space / info.max_capacity;
        if old_percent != new_percent {
            trace!("freeSpace changed: {}% -> {}%", old_percent, new_percent);
            self.reported_free_space = info.free_space;
            let id = self.storage_id.0;
            self.push_event(StandardEventCode::StorageInfoChanged, vec![id]);
        }
    }

    /* ===================================================================
     * Thumbnails
     * =================================================================== */

    pub fn thumbnail_deadline(&self) -> Option<Instant> {
        self.thumbnailer.next_deadline()
    }

    /// Flushes due thumbnail batches and turns completions into events.
    pub fn process_thumbnails(&mut self, now: Instant) {
        let ready = self.thumbnailer.tick(now);
        for (source, thumb) in ready {
            let Some(&handle) = self.by_path.get(Path::new(&source)) else { continue };
            let thumb_size = file_size(&thumb).min(u32::MAX as u64) as u32;
            if let Some(item) = self.items.get_mut(&handle) {
                if let Some(info) = item.info.as_mut() {
                    info.thumb_compressed_size = thumb_size;
                }
            }
            self.push_event(StandardEventCode::ObjectInfoChanged, vec![handle]);
            self.push_event(
                StandardEventCode::ObjectPropChanged,
                vec![handle, properties::OBJ_PROP_REP_SAMPLE_DATA as u32],
            );
        }
    }

    pub fn suspend_thumbnailing(&mut self) {
        self.thumbnailer.suspend_thumbnailing();
    }

    pub fn resume_thumbnailing(&mut self) {
        self.thumbnailer.resume_thumbnailing();
    }

    /* ===================================================================
     * Persistent databases
     * =================================================================== */

    fn populate_puoids(&mut self) {
        let mut file = match File::open(&self.puoid_db_path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let read = |file: &mut File, puoids: &mut HashMap<PathBuf, u128>| -> std::io::Result<u128> {
            let largest = file.read_u128::<LittleEndian>()?;
            let count = file.read_u32::<LittleEndian>()?;
            for _ in 0..count {
                let len = file.read_u32::<LittleEndian>()? as usize;
                let mut name = vec![0u8; len];
                file.read_exact(&mut name)?;
                let puoid = file.read_u128::<LittleEndian>()?;
                let path = PathBuf::from(String::from_utf8_lossy(&name).into_owned());
                puoids.insert(path, puoid);
            }
            Ok(largest)
        };
        match read(&mut file, &mut self.puoids) {
            Ok(largest) => self.largest_puoid = largest,
            Err(err) => warn!(
                "could not read {}: {}",
                self.puoid_db_path.display(),
                err
            ),
        }
    }

    fn remove_unused_puoids(&mut self) {
        let by_path = &self.by_path;
        self.puoids.retain(|path, _| by_path.contains_key(path));
    }

    pub fn store_puoids(&self) {
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&self.puoid_db_path)?;
            file.write_u128::<LittleEndian>(self.largest_puoid)?;
            file.write_u32::<LittleEndian>(self.puoids.len() as u32)?;
            for (path, puoid) in &self.puoids {
                let name = path.to_string_lossy();
                file.write_u32::<LittleEndian>(name.len() as u32)?;
                file.write_all(name.as_bytes())?;
                file.write_u128::<LittleEndian>(*puoid)?;
            }
            Ok(())
        };
        if let Err(err) = write() {
            warn!("could not store {}: {}", self.puoid_db_path.display(), err);
        }
    }

    fn populate_object_references(&mut self) {
        let mut file = match File::open(&self.refs_db_path) {
            Ok(file) => file,
            Err(_) => return,
        };
        let mut read = || -> std::io::Result<()> {
            let count = file.read_u32::<LittleEndian>()?;
            for _ in 0..count {
                let puoid = file.read_u128::<LittleEndian>()?;
                let ref_count = file.read_u32::<LittleEndian>()?;
                let mut references = Vec::with_capacity(ref_count as usize);
                for _ in 0..ref_count {
                    let reference = file.read_u128::<LittleEndian>()?;
                    if let Some(&handle) = self.puoid_to_handle.get(&reference) {
                        references.push(handle);
                    }
                }
                if let Some(&handle) = self.puoid_to_handle.get(&puoid) {
                    self.references.insert(handle, references);
                }
            }
            Ok(())
        };
        if let Err(err) = read() {
            warn!("could not read {}: {}", self.refs_db_path.display(), err);
        }
    }

    /// References persist keyed by PUOID since handles do not survive a
    /// restart.
    pub fn store_object_references(&self) {
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&self.refs_db_path)?;
            let entries: Vec<(u128, Vec<u128>)> = self
                .references
                .iter()
                .filter_map(|(handle, references)| {
                    let item = self.items.get(handle)?;
                    let refs: Vec<u128> = references
                        .iter()
                        .filter_map(|reference| self.items.get(reference).map(|i| i.puoid))
                        .collect();
                    Some((item.puoid, refs))
                })
                .collect();
            file.write_u32::<LittleEndian>(entries.len() as u32)?;
            for (puoid, references) in entries {
                file.write_u128::<LittleEndian>(puoid)?;
                file.write_u32::<LittleEndian>(references.len() as u32)?;
                for reference in references {
                    file.write_u128::<LittleEndian>(reference)?;
                }
            }
            Ok(())
        };
        if let Err(err) = write() {
            warn!("could not store {}: {}", self.refs_db_path.display(), err);
        }
    }

    /// Persist graph state; called on teardown.
    pub fn shutdown(&mut self) {
        self.store_puoids();
        self.store_object_references();
    }
}

/* =======================================================================
 * Filesystem helpers
 * ======================================================================= */

fn create_file(path: &Path, info: &ObjectInfo) -> OpResult<()> {
    let existed = path.exists();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|err| {
            warn!("failed to create file {}: {}", path.display(), err);
            match err.kind() {
                std::io::ErrorKind::PermissionDenied => Resp::AccessDenied,
                _ => Resp::GeneralError,
            }
        })?;

    if !existed {
        chown_to_real_ids(&file, path);
    }

    // Size to the declared content length up front; unknown sizes start
    // empty.
    let size = info.compressed_size;
    if size > 0 {
        if let Err(err) = nix::fcntl::fallocate(
            file.as_raw_fd(),
            nix::fcntl::FallocateFlags::empty(),
            0,
            size as i64,
        ) {
            warn!("failed to size {} to {}: {}", path.display(), size, err);
        }
    } else if let Err(err) = file.set_len(0) {
        warn!("failed to truncate {}: {}", path.display(), err);
    }
    drop(file);

    trace!("created file {} with size {}", path.display(), size);

    if let Some(timestamp) = datetime_to_timestamp(&info.modification_date) {
        set_file_mtime(path, timestamp);
    }
    Ok(())
}

fn create_directory(path: &Path) -> OpResult<()> {
    if !path.is_dir() {
        fs::create_dir_all(path).map_err(|err| {
            warn!("failed to create directory {}: {}", path.display(), err);
            Resp::GeneralError
        })?;
    }
    trace!("created directory {}", path.display());
    Ok(())
}

/// New files get the real (not effective) uid/gid so they stay usable when
/// the daemon runs with elevated effective ids.
fn chown_to_real_ids(file: &File, path: &Path) {
    if let Err(err) = nix::unistd::fchown(
        file.as_raw_fd(),
        Some(nix::unistd::getuid()),
        Some(nix::unistd::getgid()),
    ) {
        warn!("failed to set ownership of {}: {}", path.display(), err);
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path)
        .map(|meta| if meta.is_file() { meta.len() } else { 0 })
        .unwrap_or(0)
}

fn file_mtime(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs() as i64)
}

fn set_file_mtime(path: &Path, timestamp: i64) {
    let tv = nix::sys::time::TimeVal::new(timestamp, 0);
    if let Err(err) = nix::sys::stat::utimes(path, &tv, &tv) {
        warn!("could not set mtime of {}: {}", path.display(), err);
    }
}

/// MTP datetime string for a file's mtime, local time with utc offset
/// ("yyyymmddThhmmss+hhmm").
fn modified_date(path: &Path) -> String {
    match file_mtime(path) {
        Some(timestamp) => datetime_from_timestamp(timestamp),
        None => String::new(),
    }
}

pub(crate) fn datetime_from_timestamp(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(datetime) => datetime.format("%Y%m%dT%H%M%S%z").to_string(),
        None => String::new(),
    }
}

/// Accepts "yyyymmddThhmmss[.s]", with optional "Z" or "+/-hhmm" suffix.
pub(crate) fn datetime_to_timestamp(datetime: &str) -> Option<i64> {
    if datetime.len() < 15 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&datetime[..15], "%Y%m%dT%H%M%S").ok()?;
    let mut rest = &datetime[15..];
    if let Some(stripped) = rest.strip_prefix('.') {
        // a single decisecond digit; checked but otherwise ignored
        let digit = stripped.chars().next()?;
        if !digit.is_ascii_digit() {
            return None;
        }
        rest = &stripped[1..];
    }
    match rest {
        "" => Local
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp()),
        "Z" => Some(Utc.from_utc_datetime(&naive).timestamp()),
        offset if offset.len() == 5 => {
            let east = match offset.as_bytes()[0] {
                b'+' => true,
                b'-' => false,
                _ => return None,
            };
            let hours: i64 = offset[1..3].parse().ok()?;
            let minutes: i64 = offset[3..5].parse().ok()?;
            if hours > 23 || minutes > 59 {
                return None;
            }
            let mut shift = (hours * 60 + minutes) * 60;
            if !east {
                shift = -shift;
            }
            Some(naive.and_utc().timestamp() - shift)
        }
        _ => None,
    }
}

/// MTP object format derived from the file name extension. Unlisted
/// extensions map to Undefined, which lets hosts download anything.
pub fn format_by_extension(path: &Path) -> u16 {
    use ObjectFormatCode::*;
    let ext = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_lowercase(),
        None => return FORMAT_UNDEFINED,
    };
    let format = match ext.as_str() {
        "wav" => Wav,
        "mp3" => Mp3,
        "ogg" => Ogg,
        "txt" => Text,
        "htm" | "html" => Html,
        "wmv" => Wmv,
        "avi" => Avi,
        "mpg" | "mpeg" => Mpeg,
        "asf" => Asf,
        "bmp" | "dib" => Bmp,
        "gif" => Gif,
        "jpg" | "jpeg" => ExifJpeg,
        "jfif" | "jfi" => Jfif,
        "png" => Png,
        "tif" | "tiff" => Tiff,
        "jp2" | "jpg2" => Jp2,
        "jpx" => Jpx,
        "pcd" => Pcd,
        "pict" | "pct" | "pic" => Pict,
        "crw" => Ciff,
        "fpx" => FlashPix,
        "pbm" | "pcx" | "pgm" | "ppm" | "xpm" | "xwd" => UnknownImage,
        "wma" => Wma,
        "aac" => Aac,
        "aa" | "aax" => Audible,
        "flac" => Flac,
        "aif" | "aiff" => Aiff,
        "mp4" | "m4a" => Mp4Container,
        "3gp" => ThreeGpContainer,
        "pls" => PlsPlaylist,
        "m3u" | "m3u8" => M3uPlaylist,
        "mpl" | "mpls" => MplPlaylist,
        "asx" => AsxPlaylist,
        "wpl" => WplPlaylist,
        "pla" => AbstractAvPlaylist,
        "alb" => AbstractAudioAlbum,
        "xml" => XmlDocument,
        "mrk" => Dpof,
        _ => return FORMAT_UNDEFINED,
    };
    format.value()
}

/// MIME types for formats the thumbnailer can process.
pub fn mime_for_format(format: u16) -> Option<&'static str> {
    use ObjectFormatCode::*;
    let code: Option<ObjectFormatCode> = num_traits::FromPrimitive::from_u16(format);
    match code? {
        Bmp => Some("image/bmp"),
        Gif => Some("image/gif"),
        ExifJpeg | Jfif => Some("image/jpeg"),
        Png => Some("image/png"),
        Tiff => Some("image/tiff"),
        UnknownImage => Some("application/octet-stream"),
        _ => None,
    }
}

fn is_thumbnailable_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .as_deref(),
        Some("bmp" | "gif" | "jpeg" | "jpg" | "png")
    )
}

/// Filenames may not contain `< > : " / \ | ? *` or control characters,
/// and may not consist solely of dots.
pub fn is_file_name_valid(name: &str) -> bool {
    if name.is_empty() || name.chars().all(|ch| ch == '.') {
        return false;
    }
    !name.chars().any(|ch| {
        matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || (ch as u32) < 0x20
    })
}

/// Qualifies the PUOID database name so removable media do not collide.
/// Derived from the filesystem id reported by statvfs.
fn filesystem_uuid(path: &Path) -> String {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => format!("{:016x}", stat.filesystem_id()),
        Err(_) => "unknown".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_validation() {
        assert!(is_file_name_valid("song1.mp3"));
        assert!(is_file_name_valid("a b c.txt"));
        assert!(!is_file_name_valid("a/b"));
        assert!(!is_file_name_valid("a\\b"));
        assert!(!is_file_name_valid("a?b"));
        assert!(!is_file_name_valid(".."));
        assert!(!is_file_name_valid(""));
        assert!(!is_file_name_valid("a\x01b"));
    }

    #[test]
    fn datetime_round_trip() {
        let formatted = datetime_from_timestamp(1_700_000_000);
        let parsed = datetime_to_timestamp(&formatted).unwrap();
        assert_eq!(parsed, 1_700_000_000);
    }

    #[test]
    fn datetime_variants() {
        assert_eq!(
            datetime_to_timestamp("19700101T000000Z"),
            Some(0)
        );
        assert_eq!(
            datetime_to_timestamp("19700101T010000+0100"),
            Some(0)
        );
        assert_eq!(
            datetime_to_timestamp("19700101T000000.5Z"),
            Some(0)
        );
        assert_eq!(datetime_to_timestamp("garbage"), None);
        assert_eq!(datetime_to_timestamp("19700101T0000"), None);
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(
            format_by_extension(Path::new("/x/song.MP3")),
            ObjectFormatCode::Mp3.value()
        );
        assert_eq!(
            format_by_extension(Path::new("/x/pic.jpg")),
            ObjectFormatCode::ExifJpeg.value()
        );
        assert_eq!(format_by_extension(Path::new("/x/blob.bin")), FORMAT_UNDEFINED);
        assert_eq!(format_by_extension(Path::new("/x/noext")), FORMAT_UNDEFINED);
    }
}
