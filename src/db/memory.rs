//! In-memory [`ResourceDb`] implementation.
//!
//! Backs the test suite and developer environments. Every trait call locks
//! one mutex, which gives each call the atomicity the pipeline's per-step
//! transaction boundaries require. Blob readers and writers hold their own
//! handle on the shared state, standing in for the dedicated connection a
//! relational implementation would open.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    BlobReader, BlobWriter, BootSource, Component, DbError, LockGuard, ResourceDb,
};
use crate::model::{
    BootResource, Extra, FileId, FileKind, LargeFile, LargeFileId, LargeObjectId, ResourceFile,
    ResourceId, ResourceKind, ResourceSet, SetId,
};

const DEFAULT_BLOCK_SIZE: usize = 1 << 16;

#[derive(Default)]
struct Tables {
    next_id: u64,
    resources: BTreeMap<u64, BootResource>,
    sets: BTreeMap<u64, ResourceSet>,
    files: BTreeMap<u64, ResourceFile>,
    largefiles: BTreeMap<u64, LargeFile>,
    objects: BTreeMap<u64, Vec<u8>>,
    config: BTreeMap<String, String>,
    sources: Vec<BootSource>,
    errors: BTreeMap<&'static str, String>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn largefile_referenced(&self, id: LargeFileId) -> bool {
        self.files.values().any(|f| f.largefile_id == Some(id))
    }

    fn delete_largefile_if_unreferenced(&mut self, id: LargeFileId) -> bool {
        if self.largefile_referenced(id) {
            return false;
        }
        if let Some(largefile) = self.largefiles.remove(&id.0) {
            self.objects.remove(&largefile.object_id.0);
            true
        } else {
            false
        }
    }

    fn delete_file(&mut self, id: FileId) -> Result<(), DbError> {
        let file = self.files.remove(&id.0).ok_or(DbError::NotFound {
            entity: "resource file",
            key: id.to_string(),
        })?;
        if let Some(largefile_id) = file.largefile_id {
            self.delete_largefile_if_unreferenced(largefile_id);
        }
        Ok(())
    }

    fn delete_set(&mut self, id: SetId) -> Result<(), DbError> {
        self.sets.remove(&id.0).ok_or(DbError::NotFound {
            entity: "resource set",
            key: id.to_string(),
        })?;
        let files: Vec<FileId> = self
            .files
            .values()
            .filter(|f| f.set_id == id)
            .map(|f| f.id)
            .collect();
        for file in files {
            self.delete_file(file)?;
        }
        Ok(())
    }

    fn delete_resource(&mut self, id: ResourceId) -> Result<(), DbError> {
        self.resources.remove(&id.0).ok_or(DbError::NotFound {
            entity: "boot resource",
            key: id.to_string(),
        })?;
        let sets: Vec<SetId> = self
            .sets
            .values()
            .filter(|s| s.resource_id == id)
            .map(|s| s.id)
            .collect();
        for set in sets {
            self.delete_set(set)?;
        }
        Ok(())
    }
}

/// Shared in-memory store handle; clones refer to the same state.
#[derive(Clone)]
pub struct MemoryDb {
    tables: Arc<Mutex<Tables>>,
    locks: Arc<Mutex<BTreeSet<String>>>,
    block_size: usize,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Small block sizes make chunking behavior observable in tests.
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            locks: Arc::new(Mutex::new(BTreeSet::new())),
            block_size,
        }
    }
}

struct MemoryLockGuard {
    name: String,
    locks: Arc<Mutex<BTreeSet<String>>>,
}

impl LockGuard for MemoryLockGuard {}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.name);
    }
}

struct MemoryBlobReader {
    tables: Arc<Mutex<Tables>>,
    object: LargeObjectId,
    offset: usize,
    block_size: usize,
}

impl BlobReader for MemoryBlobReader {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, DbError> {
        let tables = self.tables.lock();
        let content = tables.objects.get(&self.object.0).ok_or(DbError::NotFound {
            entity: "large object",
            key: self.object.to_string(),
        })?;
        if self.offset >= content.len() {
            return Ok(None);
        }
        let end = usize::min(self.offset + self.block_size, content.len());
        let chunk = Bytes::copy_from_slice(&content[self.offset..end]);
        self.offset = end;
        Ok(Some(chunk))
    }
}

struct MemoryBlobWriter {
    tables: Arc<Mutex<Tables>>,
    object: LargeObjectId,
}

impl BlobWriter for MemoryBlobWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), DbError> {
        let mut tables = self.tables.lock();
        let content = tables
            .objects
            .get_mut(&self.object.0)
            .ok_or(DbError::NotFound {
                entity: "large object",
                key: self.object.to_string(),
            })?;
        content.extend_from_slice(chunk);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), DbError> {
        Ok(())
    }
}

impl ResourceDb for MemoryDb {
    fn resources(&self, kind: Option<ResourceKind>) -> Vec<BootResource> {
        self.tables
            .lock()
            .resources
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .cloned()
            .collect()
    }

    fn get_resource(&self, id: ResourceId) -> Option<BootResource> {
        self.tables.lock().resources.get(&id.0).cloned()
    }

    fn find_resource(
        &self,
        kinds: &[ResourceKind],
        name: &str,
        architecture: &str,
    ) -> Option<BootResource> {
        self.tables
            .lock()
            .resources
            .values()
            .find(|r| kinds.contains(&r.kind) && r.name == name && r.architecture == architecture)
            .cloned()
    }

    fn create_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        architecture: &str,
        extra: Extra,
    ) -> BootResource {
        let mut tables = self.tables.lock();
        let id = ResourceId(tables.next_id());
        let resource = BootResource {
            id,
            kind,
            name: name.to_string(),
            architecture: architecture.to_string(),
            extra,
        };
        tables.resources.insert(id.0, resource.clone());
        resource
    }

    fn update_resource(&self, resource: &BootResource) -> Result<(), DbError> {
        let mut tables = self.tables.lock();
        match tables.resources.get_mut(&resource.id.0) {
            Some(row) => {
                *row = resource.clone();
                Ok(())
            }
            None => Err(DbError::NotFound {
                entity: "boot resource",
                key: resource.id.to_string(),
            }),
        }
    }

    fn delete_resource(&self, id: ResourceId) -> Result<(), DbError> {
        self.tables.lock().delete_resource(id)
    }

    fn get_set(&self, id: SetId) -> Option<ResourceSet> {
        self.tables.lock().sets.get(&id.0).cloned()
    }

    fn sets_of(&self, resource: ResourceId) -> Vec<ResourceSet> {
        self.tables
            .lock()
            .sets
            .values()
            .filter(|s| s.resource_id == resource)
            .cloned()
            .collect()
    }

    fn find_set(&self, resource: ResourceId, version: &str) -> Option<ResourceSet> {
        self.tables
            .lock()
            .sets
            .values()
            .find(|s| s.resource_id == resource && s.version == version)
            .cloned()
    }

    fn create_set(&self, resource: ResourceId, version: &str, label: &str) -> ResourceSet {
        let mut tables = self.tables.lock();
        let id = SetId(tables.next_id());
        let set = ResourceSet {
            id,
            resource_id: resource,
            version: version.to_string(),
            label: label.to_string(),
        };
        tables.sets.insert(id.0, set.clone());
        set
    }

    fn update_set(&self, set: &ResourceSet) -> Result<(), DbError> {
        let mut tables = self.tables.lock();
        match tables.sets.get_mut(&set.id.0) {
            Some(row) => {
                *row = set.clone();
                Ok(())
            }
            None => Err(DbError::NotFound {
                entity: "resource set",
                key: set.id.to_string(),
            }),
        }
    }

    fn delete_set(&self, id: SetId) -> Result<(), DbError> {
        self.tables.lock().delete_set(id)
    }

    fn any_sets(&self) -> bool {
        !self.tables.lock().sets.is_empty()
    }

    fn get_file(&self, id: FileId) -> Option<ResourceFile> {
        self.tables.lock().files.get(&id.0).cloned()
    }

    fn files_of(&self, set: SetId) -> Vec<ResourceFile> {
        self.tables
            .lock()
            .files
            .values()
            .filter(|f| f.set_id == set)
            .cloned()
            .collect()
    }

    fn find_file(&self, set: SetId, filename: &str) -> Option<ResourceFile> {
        self.tables
            .lock()
            .files
            .values()
            .find(|f| f.set_id == set && f.filename == filename)
            .cloned()
    }

    fn create_file(
        &self,
        set: SetId,
        filename: &str,
        filetype: FileKind,
        extra: Extra,
    ) -> ResourceFile {
        let mut tables = self.tables.lock();
        let id = FileId(tables.next_id());
        let file = ResourceFile {
            id,
            set_id: set,
            filename: filename.to_string(),
            filetype,
            extra,
            largefile_id: None,
        };
        tables.files.insert(id.0, file.clone());
        file
    }

    fn update_file(&self, file: &ResourceFile) -> Result<(), DbError> {
        let mut tables = self.tables.lock();
        match tables.files.get_mut(&file.id.0) {
            Some(row) => {
                *row = file.clone();
                Ok(())
            }
            None => Err(DbError::NotFound {
                entity: "resource file",
                key: file.id.to_string(),
            }),
        }
    }

    fn delete_file(&self, id: FileId) -> Result<(), DbError> {
        self.tables.lock().delete_file(id)
    }

    fn get_largefile(&self, id: LargeFileId) -> Option<LargeFile> {
        self.tables.lock().largefiles.get(&id.0).cloned()
    }

    fn find_largefile_by_sha256(&self, sha256: &str) -> Option<LargeFile> {
        self.tables
            .lock()
            .largefiles
            .values()
            .find(|l| l.sha256 == sha256)
            .cloned()
    }

    fn create_largefile(&self, sha256: &str, total_size: u64) -> LargeFile {
        let mut tables = self.tables.lock();
        let id = LargeFileId(tables.next_id());
        let object_id = LargeObjectId(tables.next_id());
        tables.objects.insert(object_id.0, Vec::new());
        let largefile = LargeFile {
            id,
            sha256: sha256.to_string(),
            total_size,
            object_id,
        };
        tables.largefiles.insert(id.0, largefile.clone());
        largefile
    }

    fn delete_largefile_if_unreferenced(&self, id: LargeFileId) -> bool {
        self.tables.lock().delete_largefile_if_unreferenced(id)
    }

    fn largeobject_size(&self, id: LargeObjectId) -> u64 {
        self.tables
            .lock()
            .objects
            .get(&id.0)
            .map_or(0, |content| content.len() as u64)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn open_largeobject_read(&self, id: LargeObjectId) -> Result<Box<dyn BlobReader>, DbError> {
        if !self.tables.lock().objects.contains_key(&id.0) {
            return Err(DbError::NotFound {
                entity: "large object",
                key: id.to_string(),
            });
        }
        Ok(Box::new(MemoryBlobReader {
            tables: Arc::clone(&self.tables),
            object: id,
            offset: 0,
            block_size: self.block_size,
        }))
    }

    fn open_largeobject_write(&self, id: LargeObjectId) -> Result<Box<dyn BlobWriter>, DbError> {
        if !self.tables.lock().objects.contains_key(&id.0) {
            return Err(DbError::NotFound {
                entity: "large object",
                key: id.to_string(),
            });
        }
        Ok(Box::new(MemoryBlobWriter {
            tables: Arc::clone(&self.tables),
            object: id,
        }))
    }

    fn get_config(&self, key: &str) -> Option<String> {
        self.tables.lock().config.get(key).cloned()
    }

    fn set_config(&self, key: &str, value: &str) {
        self.tables
            .lock()
            .config
            .insert(key.to_string(), value.to_string());
    }

    fn boot_sources(&self) -> Vec<BootSource> {
        self.tables.lock().sources.clone()
    }

    fn add_boot_source(&self, source: BootSource) {
        self.tables.lock().sources.push(source);
    }

    fn register_persistent_error(&self, component: Component, message: String) {
        self.tables.lock().errors.insert(component.as_str(), message);
    }

    fn discard_persistent_error(&self, component: Component) {
        self.tables.lock().errors.remove(component.as_str());
    }

    fn persistent_error(&self, component: Component) -> Option<String> {
        self.tables.lock().errors.get(component.as_str()).cloned()
    }

    fn try_lock(&self, name: &str) -> Option<Box<dyn LockGuard>> {
        let mut locks = self.locks.lock();
        if locks.contains(name) {
            return None;
        }
        locks.insert(name.to_string());
        Some(Box::new(MemoryLockGuard {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
        }))
    }

    fn is_locked(&self, name: &str) -> bool {
        self.locks.lock().contains(name)
    }

    fn in_transaction(&self) -> bool {
        // Every call is its own atomic unit; nothing is ever left open.
        false
    }
}
