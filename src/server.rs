//! The republication endpoint rack controllers sync from.
//!
//! A small anonymous HTTP surface under [`STREAM_PREFIX`]: the catalog
//! index, the download catalog, and the file routes streaming blob bytes.
//! Only resources holding a complete set are ever published, so the
//! endpoint can run concurrently with an import; completeness is only
//! flipped on by a successful write-plus-checksum.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::oneshot;
use tokio::sync::oneshot::{Receiver, Sender};
use warp::filters::BoxedFilter;
use warp::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use warp::http::Response;
use warp::hyper::Body;
use warp::{Filter, Rejection, Reply};

use crate::db::{BlobReader, BootSource, ResourceDb};
use crate::model::{BootResource, ResourceIdentity, ResourceKind};
use crate::streams::{
    dump_data, timestamp, IndexDocument, IndexEntry, Item, Product, ProductsDocument,
    VersionItems, DOWNLOAD_CONTENT_ID, DOWNLOAD_DATATYPE, DOWNLOAD_PATH, INDEX_FORMAT,
    PRODUCTS_FORMAT,
};

/// URL prefix of the endpoint. Declared to the access middleware so
/// everything below it bypasses authentication: rack controllers sync
/// anonymously.
pub const STREAM_PREFIX: &str = "/images-stream/";

/// Descriptor of this region's own endpoint, handed to rack controllers
/// as their (sole, unsigned) boot source.
pub fn stream_endpoint(region_url: &str) -> BootSource {
    BootSource {
        url: format!(
            "{}{}streams/v1/index.json",
            region_url.trim_end_matches('/'),
            STREAM_PREFIX
        ),
        keyring_path: None,
        keyring_data: Some(Vec::new()),
        selections: Vec::new(),
    }
}

/// The endpoint's HTTP server, bound and torn down the same way as the
/// other long-lived services.
pub struct Server {
    address: SocketAddr,
    trigger_cancel: Sender<()>,
    cancel_signal: Option<Receiver<()>>,
}

impl Server {
    pub fn new(address: SocketAddr) -> Server {
        let (trigger_cancel, cancel_signal) = oneshot::channel::<()>();
        Server {
            address,
            trigger_cancel,
            cancel_signal: Some(cancel_signal),
        }
    }

    pub fn stop(self) {
        let _ = self.trigger_cancel.send(());
    }

    /// Bind and serve in the background.
    pub async fn run(mut self, db: Arc<dyn ResourceDb>) -> Self {
        let rx = self
            .cancel_signal
            .take()
            .expect("run can only be called once");
        let (_, server) =
            warp::serve(routes(db)).bind_with_graceful_shutdown(self.address, async move {
                let _ = rx.await;
            });
        tokio::spawn(server);
        self
    }
}

pub fn routes(db: Arc<dyn ResourceDb>) -> BoxedFilter<(impl Reply,)> {
    let handle = db;
    let with_db = warp::any().map(move || Arc::clone(&handle));
    let streams = warp::get()
        .and(warp::path!("images-stream" / "streams" / "v1" / String))
        .and(with_db.clone())
        .and_then(streams_handler);
    let files = warp::get()
        .and(warp::path!(
            "images-stream" / String / String / String / String / String / String
        ))
        .and(with_db)
        .and_then(files_handler);
    streams.or(files).boxed()
}

/// Resources eligible for publication: those with a latest complete set.
fn complete_resources(db: &dyn ResourceDb) -> Vec<BootResource> {
    db.resources(None)
        .into_iter()
        .filter(|resource| db.get_latest_complete_set(resource.id).is_some())
        .collect()
}

/// Build the `index.json` document.
pub fn product_index(db: &dyn ResourceDb) -> IndexDocument {
    let updated = timestamp();
    let products = complete_resources(db)
        .iter()
        .map(|resource| ResourceIdentity::of(resource).product_name())
        .collect();
    let mut index = std::collections::BTreeMap::new();
    index.insert(
        DOWNLOAD_CONTENT_ID.to_string(),
        IndexEntry {
            datatype: DOWNLOAD_DATATYPE.to_string(),
            path: DOWNLOAD_PATH.to_string(),
            updated: updated.clone(),
            products,
            format: PRODUCTS_FORMAT.to_string(),
        },
    );
    IndexDocument {
        index,
        updated,
        format: INDEX_FORMAT.to_string(),
    }
}

/// Build the `maas:v2:download.json` document.
pub fn product_download(db: &dyn ResourceDb) -> ProductsDocument {
    let products = complete_resources(db)
        .iter()
        .map(|resource| {
            (
                ResourceIdentity::of(resource).product_name(),
                product_data(db, resource),
            )
        })
        .collect();
    ProductsDocument {
        datatype: DOWNLOAD_DATATYPE.to_string(),
        updated: timestamp(),
        content_id: DOWNLOAD_CONTENT_ID.to_string(),
        products,
        format: PRODUCTS_FORMAT.to_string(),
    }
}

fn product_data(db: &dyn ResourceDb, resource: &BootResource) -> Product {
    let identity = ResourceIdentity::of(resource);
    let mut versions = std::collections::BTreeMap::new();
    let mut label = None;
    for set in db.sets_of(resource.id).into_iter().rev() {
        if !db.set_complete(&set) {
            continue;
        }
        // The label follows the latest complete set; older sets may carry
        // a different one when the operator switched streams.
        if label.is_none() {
            label = Some(set.label.clone());
        }
        let items = db
            .files_of(set.id)
            .into_iter()
            .filter_map(|file| {
                let largefile = file.largefile_id.and_then(|id| db.get_largefile(id))?;
                let item = Item {
                    path: format!("{}/{}/{}", identity, set.version, file.filename),
                    ftype: file.filetype.as_str().to_string(),
                    sha256: largefile.sha256,
                    size: largefile.total_size,
                    extra: file.extra.clone(),
                };
                Some((file.filename, item))
            })
            .collect();
        versions.insert(set.version.clone(), VersionItems { items });
    }
    Product {
        versions,
        os: identity.os.clone(),
        arch: identity.arch.clone(),
        subarch: identity.subarch.clone(),
        release: identity.series.clone(),
        version: identity.series.clone(),
        krel: identity.series.clone(),
        label: label.unwrap_or_default(),
        extra: resource.extra.clone(),
    }
}

fn json_response(data: Vec<u8>) -> Response<Body> {
    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(data))
        .expect("static response parts are valid")
}

async fn streams_handler(
    filename: String,
    db: Arc<dyn ResourceDb>,
) -> Result<Response<Body>, Rejection> {
    match filename.as_str() {
        "index.json" => Ok(json_response(dump_data(&product_index(&*db)))),
        "maas:v2:download.json" => Ok(json_response(dump_data(&product_download(&*db)))),
        _ => Err(warp::reject::not_found()),
    }
}

async fn files_handler(
    os: String,
    arch: String,
    subarch: String,
    series: String,
    version: String,
    filename: String,
    db: Arc<dyn ResourceDb>,
) -> Result<Response<Body>, Rejection> {
    let (name, architecture) = ResourceIdentity::storage_keys(&os, &arch, &subarch, &series);
    let resource = db
        .find_resource(
            &[
                ResourceKind::Synced,
                ResourceKind::Generated,
                ResourceKind::Uploaded,
            ],
            &name,
            &architecture,
        )
        .ok_or_else(warp::reject::not_found)?;
    let set = db
        .find_set(resource.id, &version)
        .ok_or_else(warp::reject::not_found)?;
    let file = db
        .find_file(set.id, &filename)
        .ok_or_else(warp::reject::not_found)?;
    let largefile = file
        .largefile_id
        .and_then(|id| db.get_largefile(id))
        .ok_or_else(warp::reject::not_found)?;
    let reader = db
        .open_largeobject_read(largefile.object_id)
        .map_err(|_| warp::reject::not_found())?;
    Response::builder()
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, largefile.total_size.to_string())
        .body(Body::wrap_stream(blob_stream(reader)))
        .map_err(|_| warp::reject::not_found())
}

/// Lazy, finite chunk stream over one blob.
///
/// The reader owns its own store connection, so the stream may outlive
/// the handler that created it; dropping the stream (peer disconnect or
/// completion) closes the reader deterministically. Chunk reads run on
/// the blocking pool so the blob I/O never occupies the reactor.
fn blob_stream(
    reader: Box<dyn BlobReader>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
    async_stream::stream! {
        let mut reader = reader;
        loop {
            let outcome = tokio::task::spawn_blocking(move || {
                let chunk = reader.next_chunk();
                (reader, chunk)
            })
            .await;
            match outcome {
                Ok((returned, Ok(Some(chunk)))) => {
                    reader = returned;
                    yield Ok(chunk);
                }
                Ok((_, Ok(None))) => break,
                Ok((_, Err(error))) => {
                    yield Err(io::Error::other(error.to_string()));
                    break;
                }
                Err(join_error) => {
                    yield Err(io::Error::other(join_error.to_string()));
                    break;
                }
            }
        }
    }
}
