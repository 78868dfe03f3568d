//! Simple-streams catalog documents and helpers.
//!
//! The same document shapes are consumed from upstream mirrors and
//! re-emitted by the republication endpoint, so a downstream consumer can
//! point the standard tooling at this region and see an ordinary mirror.

pub mod upstream;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::Extra;

/// Content id of the download catalog republished by the region.
pub const DOWNLOAD_CONTENT_ID: &str = "maas:v2:download";

/// Datatype tag carried on the download catalog.
pub const DOWNLOAD_DATATYPE: &str = "image-downloads";

/// Path of the download catalog below the endpoint root.
pub const DOWNLOAD_PATH: &str = "streams/v1/maas:v2:download.json";

pub const INDEX_FORMAT: &str = "index:1.0";
pub const PRODUCTS_FORMAT: &str = "products:1.0";

/// Top-level catalog document (`index.json`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDocument {
    pub index: BTreeMap<String, IndexEntry>,
    pub updated: String,
    pub format: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub datatype: String,
    pub path: String,
    pub updated: String,
    pub products: Vec<String>,
    pub format: String,
}

/// Full product catalog document (`maas:v2:download.json`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductsDocument {
    pub datatype: String,
    pub updated: String,
    pub content_id: String,
    pub products: BTreeMap<String, Product>,
    pub format: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    pub versions: BTreeMap<String, VersionItems>,
    pub os: String,
    pub arch: String,
    pub subarch: String,
    pub release: String,
    pub version: String,
    pub krel: String,
    pub label: String,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionItems {
    pub items: BTreeMap<String, Item>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    pub path: String,
    pub ftype: String,
    pub sha256: String,
    pub size: u64,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Catalog timestamp in the conventional simple-streams form, e.g.
/// `Thu, 01 Aug 2026 12:00:00 +0000`.
pub fn timestamp() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S +0000").to_string()
}

/// Serialize a catalog document to its canonical byte form: sorted keys,
/// trailing newline.
pub fn dump_data<T: Serialize>(document: &T) -> Vec<u8> {
    let mut data = serde_json::to_vec(document).expect("catalog documents always serialize");
    data.push(b'\n');
    data
}

/// Split a mirror URL into `(mirror_root, relative_path)`. A URL already
/// naming a `streams/v1/...` leaf keeps that leaf as the path; anything
/// else gets the default index path appended.
pub fn path_from_mirror_url(url: &str) -> (String, String) {
    if let Some(position) = url.find("streams/v1/") {
        let (root, path) = url.split_at(position);
        if !path.ends_with('/') {
            return (root.to_string(), path.to_string());
        }
    }
    let root = if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    };
    (root, "streams/v1/index.sjson".to_string())
}

/// How catalog signatures are checked for one source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SigningPolicy {
    /// Plain `.json` catalogs are accepted unsigned.
    AcceptUnsigned,
    /// Signed catalogs are verified against this keyring, when present,
    /// or the system default keyring otherwise.
    Verify { keyring: Option<PathBuf> },
}

/// Policy for a catalog at `path`, mirroring the upstream convention that
/// only `.json` leaves come unsigned.
pub fn signing_policy_for(path: &str, keyring: Option<PathBuf>) -> SigningPolicy {
    if path.ends_with(".json") {
        SigningPolicy::AcceptUnsigned
    } else {
        SigningPolicy::Verify { keyring }
    }
}

/// Resolved per-run reader settings, threaded through the upstream
/// adapter instead of process-global environment variables.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// How many versions to consider per product. Imports always use 1:
    /// only the latest upstream version of each product is mirrored.
    pub max_items: usize,
    pub user_agent: String,
    pub deadline: Duration,
    pub policy: SigningPolicy,
}

impl ReaderConfig {
    pub fn new(user_agent: String, deadline: Duration, policy: SigningPolicy) -> Self {
        Self {
            max_items: 1,
            user_agent,
            deadline,
            policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_url_keeps_explicit_stream_path() {
        let (root, path) =
            path_from_mirror_url("http://images.example.com/v3/streams/v1/index.sjson");
        assert_eq!(root, "http://images.example.com/v3/");
        assert_eq!(path, "streams/v1/index.sjson");
    }

    #[test]
    fn mirror_url_defaults_to_signed_index() {
        let (root, path) = path_from_mirror_url("http://images.example.com/v3");
        assert_eq!(root, "http://images.example.com/v3/");
        assert_eq!(path, "streams/v1/index.sjson");
    }

    #[test]
    fn unsigned_policy_only_for_plain_json() {
        assert_eq!(
            signing_policy_for("streams/v1/index.json", None),
            SigningPolicy::AcceptUnsigned
        );
        assert!(matches!(
            signing_policy_for("streams/v1/index.sjson", None),
            SigningPolicy::Verify { .. }
        ));
    }

    #[test]
    fn dump_data_is_newline_terminated_json() {
        let document = IndexDocument {
            index: BTreeMap::new(),
            updated: "now".to_string(),
            format: INDEX_FORMAT.to_string(),
        };
        let data = dump_data(&document);
        assert_eq!(data.last(), Some(&b'\n'));
        let parsed: IndexDocument = serde_json::from_slice(&data).unwrap();
        assert_eq!(parsed, document);
    }

    #[test]
    fn timestamp_has_conventional_shape() {
        let ts = timestamp();
        assert!(ts.ends_with("+0000"));
        assert_eq!(ts.matches(':').count(), 2);
    }
}
