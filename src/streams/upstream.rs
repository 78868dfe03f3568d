//! Upstream mirror seam.
//!
//! The signed-catalog parser and fetcher are a library input; the import
//! pipeline only sees the [`MirrorReader`] trait, which enumerates the
//! latest version of every product a mirror offers, together with lazy
//! openers for the item payloads. Payload bytes are not touched until the
//! pipeline's write phase asks for them.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use snafu::Snafu;
use tokio::io::AsyncRead;

use super::ReaderConfig;
use crate::db::ImageSelection;
use crate::model::Extra;

#[derive(Debug, Snafu)]
pub enum UpstreamError {
    /// Network-level failure talking to the mirror.
    #[snafu(display("failed to fetch {url}: {source}"))]
    Fetch { url: String, source: io::Error },

    /// The catalog signature did not verify against the configured keyring.
    #[snafu(display("signature verification failed for {url}: {reason}"))]
    Signature { url: String, reason: String },

    /// The per-fetch deadline elapsed.
    #[snafu(display("deadline exceeded fetching {url}"))]
    DeadlineExceeded { url: String },

    /// The catalog parsed but did not carry the fields imports require.
    #[snafu(display("malformed catalog entry: {reason}"))]
    Malformed { reason: String },
}

/// Flattened product data for one catalog item: the product-, version- and
/// item-level fields merged, the way downstream consumers see them.
#[derive(Clone, Debug, Default)]
pub struct ProductData(pub serde_json::Map<String, serde_json::Value>);

impl ProductData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_str())
    }

    /// Required field accessor; absence is a malformed upstream entry.
    pub fn require(&self, key: &'static str) -> Result<&str, UpstreamError> {
        self.get(key).ok_or(UpstreamError::Malformed {
            reason: format!("missing field {key}"),
        })
    }

    /// Declared item size. Upstream emits it as either a number or a
    /// decimal string.
    pub fn size(&self) -> Option<u64> {
        match self.0.get("size") {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Passthrough subset stored on the resource row.
    pub fn resource_extra(&self) -> Extra {
        self.extra_subset(&["kflavor", "subarches"])
    }

    /// Passthrough subset stored on the file row.
    pub fn file_extra(&self) -> Extra {
        self.extra_subset(&["kpackage", "di_version"])
    }

    fn extra_subset(&self, keys: &[&str]) -> Extra {
        keys.iter()
            .filter_map(|key| {
                self.get(key)
                    .map(|value| (key.to_string(), value.to_string()))
            })
            .collect()
    }
}

/// Declared checksums of one item, keyed by algorithm.
pub fn item_checksums(data: &ProductData) -> std::collections::BTreeMap<String, String> {
    ["sha256", "sha512", "md5"]
        .iter()
        .filter_map(|algorithm| {
            data.get(algorithm)
                .map(|value| (algorithm.to_string(), value.to_string()))
        })
        .collect()
}

/// Lazy handle on one item's payload bytes. Opening is deferred until a
/// write worker is ready to stream, and each open starts from offset zero:
/// the unit of retry is the whole file.
#[async_trait]
pub trait ContentOpener: Send + Sync {
    async fn open(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// One item under a product version.
pub struct CatalogItem {
    pub item_name: String,
    pub data: ProductData,
    pub content: Box<dyn ContentOpener>,
}

/// The latest version of one product, with all its items. This is the
/// unit the mirror writer filters on.
pub struct ProductVersion {
    pub product_name: String,
    pub version_name: String,
    pub items: Vec<CatalogItem>,
}

/// A product a mirror claims to offer, before any payload is considered.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProductSpec {
    pub os: String,
    pub arch: String,
    pub release: String,
    pub label: String,
}

/// The declarative want-list built from the merged image descriptions of
/// all sources; the mirror writer drops any pedigree outside it.
#[derive(Clone, Debug, Default)]
pub struct ProductMapping {
    wanted: BTreeSet<ProductSpec>,
}

impl ProductMapping {
    pub fn map_products<I: IntoIterator<Item = ProductSpec>>(specs: I) -> Self {
        Self {
            wanted: specs.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wanted.is_empty()
    }

    pub fn contains(&self, data: &ProductData) -> bool {
        let spec = ProductSpec {
            os: data.get("os").unwrap_or_default().to_string(),
            arch: data.get("arch").unwrap_or_default().to_string(),
            release: data.get("release").unwrap_or_default().to_string(),
            label: data.get("label").unwrap_or_default().to_string(),
        };
        self.wanted.contains(&spec)
    }
}

/// Filter one source's described products down to what its selections ask
/// for.
pub fn select_products(specs: Vec<ProductSpec>, selections: &[ImageSelection]) -> Vec<ProductSpec> {
    specs
        .into_iter()
        .filter(|spec| {
            selections.is_empty()
                || selections
                    .iter()
                    .any(|s| s.matches(&spec.os, &spec.arch, &spec.release, &spec.label))
        })
        .collect()
}

/// A boot source with its keyring already materialized on disk for this
/// run; what the reader factory gets handed.
#[derive(Clone, Debug)]
pub struct StagedSource {
    pub url: String,
    pub keyring_path: Option<PathBuf>,
    pub selections: Vec<ImageSelection>,
}

/// Reader over one upstream mirror.
#[async_trait]
pub trait MirrorReader: Send + Sync {
    /// The image-description pass: what products does this mirror offer.
    async fn describe(&self) -> Result<Vec<ProductSpec>, UpstreamError>;

    /// Enumerate the latest version of each product with lazy content
    /// openers, honoring `config.max_items` and the fetch deadline.
    async fn read_latest(
        &self,
        config: &ReaderConfig,
    ) -> Result<Vec<ProductVersion>, UpstreamError>;
}

/// Builds a reader for one staged source. The indirection keeps the
/// catalog-parsing library out of the pipeline's type signatures.
pub trait ReaderFactory: Send + Sync {
    fn open(&self, source: &StagedSource, config: &ReaderConfig) -> Box<dyn MirrorReader>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(fields: serde_json::Value) -> ProductData {
        match fields {
            serde_json::Value::Object(map) => ProductData(map),
            _ => unreachable!(),
        }
    }

    #[test]
    fn mapping_matches_on_full_tuple() {
        let mapping = ProductMapping::map_products([ProductSpec {
            os: "ubuntu".into(),
            arch: "amd64".into(),
            release: "focal".into(),
            label: "release".into(),
        }]);
        assert!(mapping.contains(&data(json!({
            "os": "ubuntu", "arch": "amd64", "release": "focal", "label": "release",
        }))));
        assert!(!mapping.contains(&data(json!({
            "os": "ubuntu", "arch": "arm64", "release": "focal", "label": "release",
        }))));
    }

    #[test]
    fn size_accepts_number_or_string() {
        assert_eq!(data(json!({ "size": 100 })).size(), Some(100));
        assert_eq!(data(json!({ "size": "200" })).size(), Some(200));
        assert_eq!(data(json!({})).size(), None);
    }

    #[test]
    fn selections_filter_described_products() {
        let specs = vec![
            ProductSpec {
                os: "ubuntu".into(),
                arch: "amd64".into(),
                release: "focal".into(),
                label: "release".into(),
            },
            ProductSpec {
                os: "ubuntu".into(),
                arch: "s390x".into(),
                release: "focal".into(),
                label: "release".into(),
            },
        ];
        let selections = vec![ImageSelection {
            os: "ubuntu".into(),
            release: "focal".into(),
            arches: vec!["amd64".into()],
            labels: vec!["*".into()],
        }];
        let selected = select_products(specs, &selections);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].arch, "amd64");
    }
}
