//! Adapts raw upstream catalog enumeration to the import pipeline.
//!
//! Filtering happens here, in order: the pedigree must be wanted by the
//! product mapping; only the latest upstream version is ever seen (the
//! reader is configured with `max_items = 1`); a squashfs image
//! supersedes a gzipped root image offered under the same version; and
//! unknown filetypes are dropped silently.

use super::{ImportError, ResourceImporter, UpstreamSnafu};
use crate::model::FileKind;
use crate::streams::upstream::{CatalogItem, MirrorReader, ProductMapping, ProductVersion};
use crate::streams::ReaderConfig;
use snafu::ResultExt;

pub struct MirrorWriter<'a> {
    importer: &'a mut ResourceImporter,
    mapping: &'a ProductMapping,
}

impl<'a> MirrorWriter<'a> {
    pub fn new(importer: &'a mut ResourceImporter, mapping: &'a ProductMapping) -> Self {
        Self { importer, mapping }
    }

    /// Feed one product version's items through the filters into the
    /// pipeline.
    pub fn write_version(&mut self, version: ProductVersion) -> Result<(), ImportError> {
        let Some(first) = version.items.first() else {
            return Ok(());
        };
        if !self.mapping.contains(&first.data) {
            return Ok(());
        }
        let has_squashfs = version
            .items
            .iter()
            .any(|item| item.data.get("ftype") == Some(FileKind::Squashfs.as_str()));
        for item in version.items {
            let CatalogItem { data, content, .. } = item;
            match data.get("ftype").and_then(FileKind::parse) {
                // Unknown filetypes are skipped silently.
                None => {}
                // When both are offered under one version, only the
                // squashfs image is inserted.
                Some(FileKind::RootImage) if has_squashfs => {}
                Some(_) => self.importer.insert(&data, content)?,
            }
        }
        Ok(())
    }
}

/// Drive one mirror's catalog through the writer into the importer.
pub async fn sync_source(
    reader: &dyn MirrorReader,
    config: &ReaderConfig,
    importer: &mut ResourceImporter,
    mapping: &ProductMapping,
) -> Result<(), ImportError> {
    let versions = reader.read_latest(config).await.context(UpstreamSnafu)?;
    let mut writer = MirrorWriter::new(importer, mapping);
    for version in versions {
        writer.write_version(version)?;
    }
    Ok(())
}
