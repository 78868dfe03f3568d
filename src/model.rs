//! Catalog entities: resources, sets, files and their blob descriptors.
//!
//! A [`BootResource`] is a named OS artifact family; each dated revision of
//! it is a [`ResourceSet`]; each artifact within a revision is a
//! [`ResourceFile`] referencing exactly one deduplicated [`LargeFile`],
//! which owns the opaque byte container in the store's large-object
//! facility.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(ResourceId);
id_type!(SetId);
id_type!(FileId);
id_type!(LargeFileId);
id_type!(LargeObjectId);

/// How a boot resource came to exist in the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Mirrored from an upstream simple-streams source.
    Synced,
    /// Produced by the region itself. May be promoted to `Synced` when an
    /// upstream starts offering the same product.
    Generated,
    /// Uploaded by an operator; lives outside the synced namespace.
    Uploaded,
}

/// Artifact types understood by the importer. Anything else coming from
/// upstream is skipped silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    RootImage,
    RootDd,
    Squashfs,
    BootKernel,
    BootInitrd,
    BootDtb,
    ArchiveTarXz,
}

impl FileKind {
    pub fn parse(ftype: &str) -> Option<Self> {
        match ftype {
            "root-image.gz" => Some(FileKind::RootImage),
            "root-dd" => Some(FileKind::RootDd),
            "squashfs" => Some(FileKind::Squashfs),
            "boot-kernel" => Some(FileKind::BootKernel),
            "boot-initrd" => Some(FileKind::BootInitrd),
            "boot-dtb" => Some(FileKind::BootDtb),
            "archive.tar.xz" => Some(FileKind::ArchiveTarXz),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::RootImage => "root-image.gz",
            FileKind::RootDd => "root-dd",
            FileKind::Squashfs => "squashfs",
            FileKind::BootKernel => "boot-kernel",
            FileKind::BootInitrd => "boot-initrd",
            FileKind::BootDtb => "boot-dtb",
            FileKind::ArchiveTarXz => "archive.tar.xz",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque key/value passthrough carried on resources and files; re-emitted
/// verbatim on the downstream catalog.
pub type Extra = BTreeMap<String, String>;

/// A named OS artifact family.
///
/// `name` is `"<os>/<series>"` for synced and generated resources and a
/// freeform series name for uploaded ones. `architecture` is always
/// `"<arch>/<subarch>"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub name: String,
    pub architecture: String,
    pub extra: Extra,
}

impl BootResource {
    /// Split `architecture` into `(arch, subarch)`.
    pub fn split_arch(&self) -> (&str, &str) {
        self.architecture
            .split_once('/')
            .unwrap_or((self.architecture.as_str(), "generic"))
    }
}

/// A dated revision of a [`BootResource`]. `version` is the upstream
/// version string, unique per resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceSet {
    pub id: SetId,
    pub resource_id: ResourceId,
    pub version: String,
    pub label: String,
}

/// One artifact within a [`ResourceSet`].
///
/// `largefile_id` is only transiently absent while the importer reconciles
/// the blob reference; a persisted file always points at a largefile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceFile {
    pub id: FileId,
    pub set_id: SetId,
    pub filename: String,
    pub filetype: FileKind,
    pub extra: Extra,
    pub largefile_id: Option<LargeFileId>,
}

/// Digest-keyed blob descriptor, shared by reference between any files
/// whose content digests match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LargeFile {
    pub id: LargeFileId,
    /// Lowercase hex SHA-256 of the fully-written content.
    pub sha256: String,
    /// Declared size; the blob is complete once exactly this many bytes
    /// have been written.
    pub total_size: u64,
    pub object_id: LargeObjectId,
}

/// External identity of a resource: the `(os, arch, subarch, series)`
/// tuple used on the wire and in URLs. Uploaded resources take
/// `os == "custom"` with `series` equal to the stored resource name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceIdentity {
    pub os: String,
    pub arch: String,
    pub subarch: String,
    pub series: String,
}

impl ResourceIdentity {
    pub fn of(resource: &BootResource) -> Self {
        let (arch, subarch) = resource.split_arch();
        let (os, series) = match resource.kind {
            ResourceKind::Uploaded => ("custom", resource.name.as_str()),
            _ => resource
                .name
                .split_once('/')
                .unwrap_or(("custom", resource.name.as_str())),
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            subarch: subarch.to_string(),
            series: series.to_string(),
        }
    }

    /// The `(name, architecture)` pair under which this identity is stored.
    pub fn storage_keys(os: &str, arch: &str, subarch: &str, series: &str) -> (String, String) {
        let name = if os == "custom" {
            series.to_string()
        } else {
            format!("{}/{}", os, series)
        };
        (name, format!("{}/{}", arch, subarch))
    }

    /// Downstream product name, `maas:boot:<os>:<arch>:<subarch>:<series>`.
    pub fn product_name(&self) -> String {
        format!(
            "maas:boot:{}:{}:{}:{}",
            self.os, self.arch, self.subarch, self.series
        )
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.os, self.arch, self.subarch, self.series
        )
    }
}
