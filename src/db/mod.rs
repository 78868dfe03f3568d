//! Storage seam.
//!
//! The relational engine, its pool and its transaction primitives live with
//! the host process; this module defines the trait surface the import
//! pipeline and the republication endpoint are written against, plus the
//! in-memory implementation used by tests and developer environments.
//!
//! Calls are individually atomic. The pipeline's multi-step phases each map
//! to one call or to a short call sequence that tolerates being interleaved
//! with readers, because completeness is only ever flipped on by a
//! successful write-plus-checksum.

pub mod memory;

pub use memory::MemoryDb;

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use snafu::Snafu;

use crate::model::{
    BootResource, Extra, FileId, FileKind, LargeFile, LargeFileId, LargeObjectId, ResourceFile,
    ResourceId, ResourceIdentity, ResourceKind, ResourceSet, SetId,
};

/// Name of the advisory lock serializing imports region-wide.
pub const IMPORT_IMAGES_LOCK: &str = "import_images";

/// Keys of the global configuration table used by this crate.
pub mod config_keys {
    pub const BOOT_IMAGES_AUTO_IMPORT: &str = "boot_images_auto_import";
    pub const COMMISSIONING_OSYSTEM: &str = "commissioning_osystem";
    pub const COMMISSIONING_DISTRO_SERIES: &str = "commissioning_distro_series";
    pub const DEFAULT_OSYSTEM: &str = "default_osystem";
    pub const DEFAULT_DISTRO_SERIES: &str = "default_distro_series";
}

/// Persistent warning slots surfaced on the admin UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Component {
    BootImages,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::BootImages => "boot-images",
        }
    }
}

/// An upstream catalog source row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootSource {
    pub url: String,
    /// Path to an on-disk keyring, when the operator supplied one.
    pub keyring_path: Option<PathBuf>,
    /// Raw keyring bytes, materialized to a run-scoped file before use.
    pub keyring_data: Option<Vec<u8>>,
    pub selections: Vec<ImageSelection>,
}

/// A declarative "I want these images" row attached to a source.
/// `"*"` entries match anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSelection {
    pub os: String,
    pub release: String,
    pub arches: Vec<String>,
    pub labels: Vec<String>,
}

impl ImageSelection {
    pub fn matches(&self, os: &str, arch: &str, release: &str, label: &str) -> bool {
        fn any(values: &[String], wanted: &str) -> bool {
            values.iter().any(|v| v == "*" || v == wanted)
        }
        self.os == os && self.release == release && any(&self.arches, arch) && any(&self.labels, label)
    }
}

#[derive(Debug, Snafu)]
pub enum DbError {
    /// A row the caller held a handle to no longer exists.
    #[snafu(display("{entity} {key} not found"))]
    NotFound { entity: &'static str, key: String },

    /// The large-object facility failed underneath us.
    #[snafu(display("large object I/O error: {source}"))]
    Blob { source: io::Error },
}

/// Held advisory lock; released on drop, on every path.
pub trait LockGuard: Send {}

/// Chunked reader over one large object.
///
/// A reader owns whatever connection it needs, independent of any request
/// transaction, so its lifetime may exceed the handler that created it.
/// Dropping the reader releases the connection.
pub trait BlobReader: Send {
    /// Next chunk of at most `block_size` bytes; `None` at end of object.
    fn next_chunk(&mut self) -> Result<Option<Bytes>, DbError>;
}

/// Chunked writer into one large object. Closed exactly once; a writer
/// dropped without [`BlobWriter::close`] leaves a partial blob behind,
/// which is fine: the referring file is deleted on checksum mismatch and
/// the blob becomes orphan and reclaimable.
pub trait BlobWriter: Send {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), DbError>;
    fn close(self: Box<Self>) -> Result<(), DbError>;
}

/// The tables of the catalog model plus the ambient persisted state the
/// import machinery needs: global config, boot sources, persistent
/// warnings and the named advisory lock.
pub trait ResourceDb: Send + Sync + 'static {
    // Resources.
    fn resources(&self, kind: Option<ResourceKind>) -> Vec<BootResource>;
    fn get_resource(&self, id: ResourceId) -> Option<BootResource>;
    fn find_resource(
        &self,
        kinds: &[ResourceKind],
        name: &str,
        architecture: &str,
    ) -> Option<BootResource>;
    fn create_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        architecture: &str,
        extra: Extra,
    ) -> BootResource;
    fn update_resource(&self, resource: &BootResource) -> Result<(), DbError>;
    /// Deletes the resource, cascading sets and files; largefiles whose
    /// last reference drops are reclaimed with their blobs.
    fn delete_resource(&self, id: ResourceId) -> Result<(), DbError>;

    // Sets.
    fn get_set(&self, id: SetId) -> Option<ResourceSet>;
    /// Sets of a resource in ascending insertion order.
    fn sets_of(&self, resource: ResourceId) -> Vec<ResourceSet>;
    fn find_set(&self, resource: ResourceId, version: &str) -> Option<ResourceSet>;
    fn create_set(&self, resource: ResourceId, version: &str, label: &str) -> ResourceSet;
    fn update_set(&self, set: &ResourceSet) -> Result<(), DbError>;
    fn delete_set(&self, id: SetId) -> Result<(), DbError>;
    fn any_sets(&self) -> bool;

    // Files.
    fn get_file(&self, id: FileId) -> Option<ResourceFile>;
    fn files_of(&self, set: SetId) -> Vec<ResourceFile>;
    fn find_file(&self, set: SetId, filename: &str) -> Option<ResourceFile>;
    fn create_file(
        &self,
        set: SetId,
        filename: &str,
        filetype: FileKind,
        extra: Extra,
    ) -> ResourceFile;
    fn update_file(&self, file: &ResourceFile) -> Result<(), DbError>;
    /// Deletes the file; a largefile left with no referring files is
    /// reclaimed together with its blob.
    fn delete_file(&self, id: FileId) -> Result<(), DbError>;

    // Largefiles and blobs.
    fn get_largefile(&self, id: LargeFileId) -> Option<LargeFile>;
    fn find_largefile_by_sha256(&self, sha256: &str) -> Option<LargeFile>;
    /// Creates the descriptor together with a fresh empty large object.
    fn create_largefile(&self, sha256: &str, total_size: u64) -> LargeFile;
    /// Reclaims the largefile and its blob unless a file still refers to
    /// it. Returns whether it was removed.
    fn delete_largefile_if_unreferenced(&self, id: LargeFileId) -> bool;
    fn largeobject_size(&self, id: LargeObjectId) -> u64;
    fn block_size(&self) -> usize;
    fn open_largeobject_read(&self, id: LargeObjectId) -> Result<Box<dyn BlobReader>, DbError>;
    fn open_largeobject_write(&self, id: LargeObjectId) -> Result<Box<dyn BlobWriter>, DbError>;

    // Global config.
    fn get_config(&self, key: &str) -> Option<String>;
    fn set_config(&self, key: &str, value: &str);

    // Boot sources.
    fn boot_sources(&self) -> Vec<BootSource>;
    fn add_boot_source(&self, source: BootSource);

    // Persistent warnings.
    fn register_persistent_error(&self, component: Component, message: String);
    fn discard_persistent_error(&self, component: Component);
    fn persistent_error(&self, component: Component) -> Option<String>;

    // Advisory locking and transaction introspection.
    fn try_lock(&self, name: &str) -> Option<Box<dyn LockGuard>>;
    fn is_locked(&self, name: &str) -> bool;
    fn in_transaction(&self) -> bool;

    // Derived catalog operations.

    /// True once the blob holds exactly the declared number of bytes.
    /// Writers only commit after the checksum matched, so size equality is
    /// the completeness test.
    fn largefile_complete(&self, largefile: &LargeFile) -> bool {
        self.largeobject_size(largefile.object_id) == largefile.total_size
    }

    /// A set is complete when it has files and every file's blob is fully
    /// materialized.
    fn set_complete(&self, set: &ResourceSet) -> bool {
        let files = self.files_of(set.id);
        !files.is_empty()
            && files.iter().all(|file| {
                file.largefile_id
                    .and_then(|id| self.get_largefile(id))
                    .is_some_and(|largefile| self.largefile_complete(&largefile))
            })
    }

    /// The complete set with the highest insertion id, if any. Only
    /// resources for which this returns `Some` are published downstream.
    fn get_latest_complete_set(&self, resource: ResourceId) -> Option<ResourceSet> {
        self.sets_of(resource)
            .into_iter()
            .rev()
            .find(|set| self.set_complete(set))
    }

    /// Look up or create the resource for an upstream product, promoting a
    /// generated resource to synced in place (same id) and overwriting
    /// `extra` with the passthrough subset. Returns the resource and
    /// whether it already existed as synced.
    fn get_or_create_resource(
        &self,
        name: &str,
        architecture: &str,
        extra: Extra,
    ) -> Result<(BootResource, bool), DbError> {
        let found = self.find_resource(
            &[ResourceKind::Synced, ResourceKind::Generated],
            name,
            architecture,
        );
        match found {
            None => Ok((
                self.create_resource(ResourceKind::Synced, name, architecture, extra),
                false,
            )),
            Some(mut resource) => {
                let was_synced = resource.kind == ResourceKind::Synced;
                resource.kind = ResourceKind::Synced;
                resource.extra = extra;
                self.update_resource(&resource)?;
                Ok((resource, was_synced))
            }
        }
    }

    /// Resources suitable for seeding the commissioning defaults: Ubuntu
    /// resources holding a complete set, ordered by name.
    fn commissioning_resources(&self) -> Vec<BootResource> {
        let mut resources: Vec<_> = self
            .resources(None)
            .into_iter()
            .filter(|resource| {
                resource.name.starts_with("ubuntu/")
                    && self.get_latest_complete_set(resource.id).is_some()
            })
            .collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        resources
    }

    /// The formatted identity of every synced resource; the import
    /// pipeline's deletion snapshot.
    fn synced_identities(&self) -> std::collections::BTreeSet<String> {
        self.resources(Some(ResourceKind::Synced))
            .into_iter()
            .map(|resource| ResourceIdentity::of(&resource).to_string())
            .collect()
    }
}
