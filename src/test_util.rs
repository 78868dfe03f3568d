//! Shared fakes for exercising the import and republication machinery
//! without real mirrors, racks or a relational store.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;

use crate::config::Config;
use crate::db::{BootSource, MemoryDb, ResourceDb};
use crate::import::ImportContext;
use crate::rack::{BootImage, RackClient, RackError, RackImporter, RackRegistry};
use crate::streams::upstream::{
    CatalogItem, ContentOpener, MirrorReader, ProductData, ProductSpec, ProductVersion,
    ReaderFactory, StagedSource, UpstreamError,
};
use crate::streams::ReaderConfig;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One artifact offered by a [`FakeMirror`] product.
#[derive(Clone, Debug)]
pub struct FakeItem {
    pub ftype: String,
    pub content: Bytes,
    /// What the catalog claims; normally the truth, but tests can lie to
    /// provoke checksum mismatches.
    pub declared_sha256: String,
    pub declared_size: u64,
    pub extra: BTreeMap<String, String>,
}

/// One product version offered by a [`FakeMirror`].
#[derive(Clone, Debug)]
pub struct FakeProduct {
    pub os: String,
    pub arch: String,
    pub subarch: String,
    pub release: String,
    pub label: String,
    pub version_name: String,
    pub extra: BTreeMap<String, String>,
    pub items: Vec<FakeItem>,
}

impl FakeProduct {
    pub fn new(os: &str, architecture: &str, release: &str, version_name: &str) -> Self {
        let (arch, subarch) = architecture
            .split_once('/')
            .unwrap_or((architecture, "generic"));
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
            subarch: subarch.to_string(),
            release: release.to_string(),
            label: "release".to_string(),
            version_name: version_name.to_string(),
            extra: BTreeMap::new(),
            items: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_item(mut self, ftype: &str, content: &[u8]) -> Self {
        self.items.push(FakeItem {
            ftype: ftype.to_string(),
            content: Bytes::copy_from_slice(content),
            declared_sha256: sha256_hex(content),
            declared_size: content.len() as u64,
            extra: BTreeMap::new(),
        });
        self
    }

    /// An item whose declared digest disagrees with its actual bytes.
    pub fn with_corrupt_item(mut self, ftype: &str, content: &[u8], declared_sha256: &str) -> Self {
        self.items.push(FakeItem {
            ftype: ftype.to_string(),
            content: Bytes::copy_from_slice(content),
            declared_sha256: declared_sha256.to_string(),
            declared_size: content.len() as u64,
            extra: BTreeMap::new(),
        });
        self
    }

    fn spec(&self) -> ProductSpec {
        ProductSpec {
            os: self.os.clone(),
            arch: self.arch.clone(),
            release: self.release.clone(),
            label: self.label.clone(),
        }
    }

    fn item_data(&self, item: &FakeItem) -> ProductData {
        let mut map = serde_json::Map::new();
        let fields = [
            ("os", &self.os),
            ("arch", &self.arch),
            ("subarch", &self.subarch),
            ("release", &self.release),
            ("label", &self.label),
            ("version_name", &self.version_name),
            ("ftype", &item.ftype),
            ("sha256", &item.declared_sha256),
        ];
        for (key, value) in fields {
            map.insert(key.to_string(), serde_json::Value::String(value.clone()));
        }
        map.insert(
            "size".to_string(),
            serde_json::Value::Number(item.declared_size.into()),
        );
        for (key, value) in self.extra.iter().chain(item.extra.iter()) {
            map.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        ProductData(map)
    }
}

struct BytesOpener {
    content: Bytes,
    fail: bool,
}

#[async_trait]
impl ContentOpener for BytesOpener {
    async fn open(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        if self.fail {
            return Err(io::Error::other("fake mirror refused the payload"));
        }
        Ok(Box::new(std::io::Cursor::new(self.content.to_vec())))
    }
}

/// In-memory opener for driving the pipeline directly in tests.
pub fn bytes_opener(content: &[u8]) -> Box<dyn ContentOpener> {
    Box::new(BytesOpener {
        content: Bytes::copy_from_slice(content),
        fail: false,
    })
}

/// An upstream mirror serving canned products from memory.
#[derive(Clone, Default)]
pub struct FakeMirror {
    pub products: Vec<FakeProduct>,
    /// Fail every payload open, for exercising write-phase error paths.
    pub fail_content: bool,
}

impl FakeMirror {
    pub fn new(products: Vec<FakeProduct>) -> Self {
        Self {
            products,
            fail_content: false,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MirrorReader for FakeMirror {
    async fn describe(&self) -> Result<Vec<ProductSpec>, UpstreamError> {
        Ok(self.products.iter().map(FakeProduct::spec).collect())
    }

    async fn read_latest(
        &self,
        _config: &ReaderConfig,
    ) -> Result<Vec<ProductVersion>, UpstreamError> {
        Ok(self
            .products
            .iter()
            .map(|product| ProductVersion {
                product_name: format!(
                    "{}:{}:{}:{}",
                    product.os, product.release, product.arch, product.subarch
                ),
                version_name: product.version_name.clone(),
                items: product
                    .items
                    .iter()
                    .map(|item| CatalogItem {
                        item_name: item.ftype.clone(),
                        data: product.item_data(item),
                        content: Box::new(BytesOpener {
                            content: item.content.clone(),
                            fail: self.fail_content,
                        }),
                    })
                    .collect(),
            })
            .collect())
    }
}

/// Hands the same [`FakeMirror`] out for every source URL.
pub struct FakeReaderFactory {
    mirror: FakeMirror,
}

impl FakeReaderFactory {
    pub fn single(mirror: FakeMirror) -> Self {
        Self { mirror }
    }
}

impl ReaderFactory for FakeReaderFactory {
    fn open(&self, _source: &StagedSource, _config: &ReaderConfig) -> Box<dyn MirrorReader> {
        Box::new(self.mirror.clone())
    }
}

enum FakeRackMode {
    V2,
    LegacyOnly,
    Unreachable,
}

/// A rack controller answering image-list RPCs from memory.
pub struct FakeRack {
    images: Vec<BootImage>,
    mode: FakeRackMode,
}

impl FakeRack {
    pub fn with_images(images: Vec<BootImage>) -> Self {
        Self {
            images,
            mode: FakeRackMode::V2,
        }
    }

    pub fn empty() -> Self {
        Self::with_images(Vec::new())
    }

    /// A rack predating the v2 command.
    pub fn legacy_only(images: Vec<BootImage>) -> Self {
        Self {
            images,
            mode: FakeRackMode::LegacyOnly,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            images: Vec::new(),
            mode: FakeRackMode::Unreachable,
        }
    }
}

#[async_trait]
impl RackClient for FakeRack {
    async fn list_boot_images_v2(&self) -> Result<Vec<BootImage>, RackError> {
        match self.mode {
            FakeRackMode::V2 => Ok(self.images.clone()),
            FakeRackMode::LegacyOnly => Err(RackError::UnhandledCommand {
                command: "ListBootImagesV2".to_string(),
            }),
            FakeRackMode::Unreachable => Err(RackError::Unreachable {
                reason: "connection refused".to_string(),
            }),
        }
    }

    async fn list_boot_images(&self) -> Result<Vec<BootImage>, RackError> {
        match self.mode {
            FakeRackMode::Unreachable => Err(RackError::Unreachable {
                reason: "connection refused".to_string(),
            }),
            _ => Ok(self.images.clone()),
        }
    }
}

pub struct StaticRacks {
    racks: Vec<Arc<dyn RackClient>>,
}

impl StaticRacks {
    pub fn new(racks: Vec<FakeRack>) -> Self {
        Self {
            racks: racks
                .into_iter()
                .map(|rack| Arc::new(rack) as Arc<dyn RackClient>)
                .collect(),
        }
    }
}

impl RackRegistry for StaticRacks {
    fn connected_clients(&self) -> Vec<Arc<dyn RackClient>> {
        self.racks.clone()
    }
}

/// Counts fan-out invocations.
#[derive(Default)]
pub struct RecordingRackImporter {
    runs: AtomicUsize,
}

impl RecordingRackImporter {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RackImporter for RecordingRackImporter {
    async fn import_boot_images(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

/// A source row pointing at the fake mirror, with match-all selections.
pub fn fake_boot_source() -> BootSource {
    BootSource {
        url: "http://mirror.test/streams/v1/index.sjson".to_string(),
        keyring_path: None,
        keyring_data: Some(b"fake keyring".to_vec()),
        selections: Vec::new(),
    }
}

/// Config pointed at scratch space, safe for parallel test runs.
pub fn test_config() -> Config {
    Config {
        gnupg_home: std::env::temp_dir().join("bootstream-test-gnupg"),
        ..Config::default()
    }
}

/// A full import context over an in-memory store and a fake mirror.
/// `MemoryDb` is a shared handle: clones see the same state.
pub fn import_context(db: MemoryDb, mirror: FakeMirror) -> ImportContext {
    if db.boot_sources().is_empty() {
        db.add_boot_source(fake_boot_source());
    }
    ImportContext {
        db: Arc::new(db),
        factory: Arc::new(FakeReaderFactory::single(mirror)),
        rack_importer: Arc::new(RecordingRackImporter::default()),
        config: test_config(),
    }
}
