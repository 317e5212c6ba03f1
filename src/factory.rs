use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::warn;

use crate::data::MtpData;
use crate::dataset::{ObjectInfo, StorageInfo};
use crate::event::Event;
use crate::format::{ObjHandle, StorageId, StorageType};
use crate::properties::ObjPropDesc;
use crate::response::StandardResponseCode as Resp;
use crate::storage::{FsStorage, HandleAllocator};
use crate::thumbnailer::ThumbnailerService;
use crate::OpResult;

/// Description of one storage to export, consumed at factory build time.
pub struct StorageConfig {
    pub path: PathBuf,
    pub storage_type: StorageType,
    pub volume_label: String,
    pub description: String,
    pub exclude_paths: Vec<String>,
}

/// Owns every storage, assigns storage ids and object handles, and routes
/// per-handle operations to the storage holding the handle.
pub struct StorageFactory {
    storages: Vec<FsStorage>,
    alloc: HandleAllocator,
    ready: HashSet<StorageId>,
    next_storage_number: u16,
    db_root: PathBuf,
}

impl StorageFactory {
    /// `db_root` overrides the `$HOME/.local/mtp` database directory.
    pub fn new(db_root: Option<PathBuf>) -> StorageFactory {
        let db_root = db_root.unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
            PathBuf::from(home).join(".local/mtp")
        });
        StorageFactory {
            storages: Vec::new(),
            alloc: HandleAllocator::default(),
            ready: HashSet::new(),
            next_storage_number: 0,
            db_root,
        }
    }

    pub fn add_storage(
        &mut self,
        config: StorageConfig,
        thumb_service: Box<dyn ThumbnailerService>,
    ) -> std::io::Result<StorageId> {
        self.next_storage_number += 1;
        let storage_id = StorageId::new(self.next_storage_number, 1);
        let mut storage = FsStorage::new(
            storage_id,
            config.storage_type,
            &config.path,
            &config.volume_label,
            &config.description,
            &self.db_root,
            thumb_service,
        )?;
        for exclude in &config.exclude_paths {
            storage.exclude_path(exclude);
        }
        self.alloc.seed_puoid(storage.largest_puoid());
        self.storages.push(storage);
        Ok(storage_id)
    }

    /// Walks every storage; the returned ids get StoreAdded-style readiness
    /// reporting from the responder.
    pub fn enumerate_storages(&mut self) -> Vec<StorageId> {
        let mut ready = Vec::new();
        for index in 0..self.storages.len() {
            let id = self.storages[index].storage_id();
            match self.storages[index].enumerate(&mut self.alloc) {
                Ok(()) => {
                    self.ready.insert(id);
                    ready.push(id);
                }
                Err(code) => warn!("enumeration of {} failed: {:?}", id, code),
            }
        }
        ready
    }

    pub fn storage_is_ready(&self) -> bool {
        !self.storages.is_empty() && self.ready.len() == self.storages.len()
    }

    pub fn storage_ids(&self) -> Vec<StorageId> {
        self.storages.iter().map(|s| s.storage_id()).collect()
    }

    fn storage_index(&self, storage_id: StorageId) -> Option<usize> {
        self.storages
            .iter()
            .position(|s| s.storage_id() == storage_id)
    }

    fn storage_mut(&mut self, storage_id: StorageId) -> OpResult<&mut FsStorage> {
        self.storages
            .iter_mut()
            .find(|s| s.storage_id() == storage_id)
            .ok_or(Resp::InvalidStorageId)
    }

    fn storage_of_handle(&self, handle: ObjHandle) -> OpResult<usize> {
        self.storages
            .iter()
            .position(|s| s.check_handle(handle))
            .ok_or(Resp::InvalidObjectHandle)
    }

    fn storage_of_handle_mut(&mut self, handle: ObjHandle) -> OpResult<&mut FsStorage> {
        self.storages
            .iter_mut()
            .find(|s| s.check_handle(handle))
            .ok_or(Resp::InvalidObjectHandle)
    }

    pub fn check_storage(&self, storage_id: StorageId) -> OpResult<()> {
        self.storage_index(storage_id)
            .map(|_| ())
            .ok_or(Resp::InvalidStorageId)
    }

    pub fn check_handle(&self, handle: ObjHandle) -> OpResult<()> {
        self.storage_of_handle(handle).map(|_| ())
    }

    pub fn storage_info(&mut self, storage_id: StorageId) -> OpResult<StorageInfo> {
        self.storage_mut(storage_id)?.storage_info()
    }

    /// GetObjectHandles / GetNumObjects. A wildcard storage id collects
    /// from every storage.
    pub fn object_handles(
        &mut self,
        storage_id: StorageId,
        format_code: u16,
        association: ObjHandle,
    ) -> OpResult<Vec<ObjHandle>> {
        if storage_id != StorageId::all() {
            let index = self
                .storage_index(storage_id)
                .ok_or(Resp::InvalidStorageId)?;
            return self.storages[index].object_handles(format_code, association);
        }

        let mut handles = Vec::new();
        let mut matched = false;
        for storage in &self.storages {
            match storage.object_handles(format_code, association) {
                Ok(mut found) => {
                    matched = true;
                    handles.append(&mut found);
                }
                // a non-root association lives in exactly one storage
                Err(Resp::InvalidParentObject)
                    if association != 0x0000_0000 && association != 0xFFFF_FFFF => {}
                Err(err) => return Err(err),
            }
        }
        if !matched && association != 0x0000_0000 && association != 0xFFFF_FFFF {
            return Err(Resp::InvalidParentObject);
        }
        Ok(handles)
    }

    pub fn object_info(&mut self, handle: ObjHandle) -> OpResult<ObjectInfo> {
        self.storage_of_handle_mut(handle)?
            .object_info(handle)
            .map(Clone::clone)
    }

    pub fn path(&self, handle: ObjHandle) -> OpResult<PathBuf> {
        let index = self.storage_of_handle(handle)?;
        self.storages[index].path_for_handle(handle)
    }

    pub fn events_enabled(&self, handle: ObjHandle) -> OpResult<bool> {
        let index = self.storage_of_handle(handle)?;
        self.storages[index].events_enabled(handle)
    }

    pub fn set_events_enabled(&mut self, handle: ObjHandle, enabled: bool) -> OpResult<()> {
        self.storage_of_handle_mut(handle)?
            .set_events_enabled(handle, enabled)
    }

    pub fn add_item(
        &mut self,
        storage_id: StorageId,
        parent: ObjHandle,
        info: &ObjectInfo,
    ) -> OpResult<(StorageId, ObjHandle, ObjHandle)> {
        let index = if parent != 0x0000_0000 && parent != 0xFFFF_FFFF {
            self.storage_of_handle(parent)?
        } else if storage_id.0 == 0 {
            // storage id 0 leaves the choice to the responder
            if self.storages.is_empty() {
                return Err(Resp::InvalidStorageId);
            }
            0
        } else {
            self.storage_index(storage_id)
                .ok_or(Resp::InvalidStorageId)?
        };
        let alloc = &mut self.alloc;
        let storage = &mut self.storages[index];
        let (parent, handle) = storage.add_item(parent, info, alloc)?;
        Ok((storage.storage_id(), parent, handle))
    }

    pub fn delete_item(&mut self, handle: ObjHandle, format_code: u16) -> OpResult<()> {
        if handle == 0xFFFF_FFFF {
            let mut result = Ok(());
            for storage in &mut self.storages {
                if let Err(err) = storage.delete_item(handle, format_code) {
                    result = Err(err);
                }
            }
            return result;
        }
        self.storage_of_handle_mut(handle)?
            .delete_item(handle, format_code)
    }

    pub fn copy_object(
        &mut self,
        handle: ObjHandle,
        parent: ObjHandle,
        destination: StorageId,
    ) -> OpResult<ObjHandle> {
        let source = self.storage_of_handle(handle)?;
        let target = self
            .storage_index(destination)
            .ok_or(Resp::InvalidStorageId)?;

        if source == target {
            let alloc = &mut self.alloc;
            return self.storages[source].copy_within(handle, parent, alloc);
        }

        // Cross-storage copy keeps the source handle; split the vector to
        // borrow both storages at once.
        let free = self.storages[target].storage_info()?.free_space;
        let needed = self.storages[source].item_info(handle)?.compressed_size;
        if free < needed {
            return Err(Resp::StoreFull);
        }

        let (src, dst) = pick_two(&mut self.storages, source, target);
        dst.copy_handle_from(src, handle, parent, &mut self.alloc)?;
        Ok(handle)
    }

    pub fn move_object(
        &mut self,
        handle: ObjHandle,
        parent: ObjHandle,
        destination: StorageId,
    ) -> OpResult<()> {
        let source = self.storage_of_handle(handle)?;
        let target = self
            .storage_index(destination)
            .ok_or(Resp::InvalidStorageId)?;

        if source == target {
            return self.storages[source].move_within(handle, parent, true);
        }

        // cross-storage move is a copy followed by source deletion
        let (src, dst) = pick_two(&mut self.storages, source, target);
        dst.copy_handle_from(src, handle, parent, &mut self.alloc)?;
        self.storages[source].delete_item(handle, 0)
    }

    pub fn read_data(&self, handle: ObjHandle, offset: u64, buf: &mut [u8]) -> OpResult<()> {
        let index = self.storage_of_handle(handle)?;
        self.storages[index].read_data(handle, offset, buf)
    }

    pub fn write_data(
        &mut self,
        handle: ObjHandle,
        data: Option<&[u8]>,
        first_segment: bool,
        last_segment: bool,
    ) -> OpResult<()> {
        self.storage_of_handle_mut(handle)?
            .write_data(handle, data, first_segment, last_segment)
    }

    pub fn write_partial_data(
        &mut self,
        handle: ObjHandle,
        offset: u64,
        data: &[u8],
        first_segment: bool,
        last_segment: bool,
    ) -> OpResult<()> {
        self.storage_of_handle_mut(handle)?
            .write_partial_data(handle, offset, data, first_segment, last_segment)
    }

    pub fn truncate_item(&mut self, handle: ObjHandle, size: u64) -> OpResult<()> {
        self.storage_of_handle_mut(handle)?.truncate_item(handle, size)
    }

    pub fn get_references(&mut self, handle: ObjHandle) -> OpResult<Vec<ObjHandle>> {
        self.storage_of_handle_mut(handle)?.get_references(handle)
    }

    pub fn set_references(
        &mut self,
        handle: ObjHandle,
        references: &[ObjHandle],
    ) -> OpResult<()> {
        // references may span storages in principle; the original keeps
        // them in the storage owning the referring object
        self.storage_of_handle_mut(handle)?
            .set_references(handle, references)
    }

    pub fn get_object_property_value(
        &mut self,
        handle: ObjHandle,
        desc: &ObjPropDesc,
    ) -> OpResult<MtpData> {
        self.storage_of_handle_mut(handle)?
            .get_object_property_value(handle, desc)
    }

    pub fn get_child_property_values(
        &mut self,
        handle: ObjHandle,
        descs: &[ObjPropDesc],
    ) -> OpResult<Vec<(ObjHandle, Vec<MtpData>)>> {
        self.storage_of_handle_mut(handle)?
            .get_child_property_values(handle, descs)
    }

    pub fn set_object_property_value(
        &mut self,
        handle: ObjHandle,
        entries: &[(&ObjPropDesc, MtpData)],
    ) -> OpResult<()> {
        self.storage_of_handle_mut(handle)?
            .set_object_property_value(handle, entries)
    }

    /// Events buffered by the storages since the last drain.
    pub fn take_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        for storage in &mut self.storages {
            events.append(&mut storage.take_events());
        }
        events
    }

    pub fn process_fs_events(&mut self, now: Instant) {
        let alloc = &mut self.alloc;
        for storage in &mut self.storages {
            storage.process_fs_events(alloc, now);
        }
    }

    pub fn process_thumbnails(&mut self, now: Instant) {
        for storage in &mut self.storages {
            storage.process_thumbnails(now);
        }
    }

    pub fn thumbnail_deadline(&self) -> Option<Instant> {
        self.storages
            .iter()
            .filter_map(|storage| storage.thumbnail_deadline())
            .min()
    }

    pub fn session_open_changed(&mut self, open: bool) {
        if !open {
            for storage in &mut self.storages {
                storage.disable_object_events();
            }
        }
    }

    pub fn suspend(&mut self) {
        for storage in &mut self.storages {
            storage.suspend_thumbnailing();
        }
    }

    pub fn resume(&mut self) {
        for storage in &mut self.storages {
            storage.resume_thumbnailing();
        }
    }

    pub fn shutdown(&mut self) {
        for storage in &mut self.storages {
            storage.shutdown();
        }
    }

    /// Looks up the storage root a path belongs to; test support.
    pub fn handle_for_path(&self, path: &Path) -> Option<ObjHandle> {
        self.storages
            .iter()
            .find_map(|storage| storage.handle_for_path(path))
    }
}

/// Disjoint mutable+shared borrow of two entries of the storage vector.
fn pick_two(storages: &mut [FsStorage], source: usize, target: usize) -> (&FsStorage, &mut FsStorage) {
    if source < target {
        let (head, tail) = storages.split_at_mut(target);
        (&head[source], &mut tail[0])
    } else {
        let (head, tail) = storages.split_at_mut(source);
        (&tail[0], &mut head[target])
    }
}
