//! The import side: two-phase mirror synchronization.
//!
//! [`pipeline::ResourceImporter`] materializes upstream catalog entries
//! metadata-first, queues payload writes, and reconciles what upstream no
//! longer offers. [`writer::MirrorWriter`] adapts raw catalog entries to
//! the pipeline. [`coordinator`] wraps a whole run: the region-wide
//! advisory lock, keyring staging, defaults seeding and the rack fan-out.

pub mod coordinator;
pub mod pipeline;
pub mod writer;

pub use coordinator::{
    import_resources, import_resources_now, is_import_running, ImportContext, ImportOutcome,
};
pub use pipeline::{FinalizeOutcome, ResourceImporter};
pub use writer::{sync_source, MirrorWriter};

use std::path::PathBuf;

use snafu::Snafu;

use crate::db::DbError;
use crate::streams::upstream::UpstreamError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ImportError {
    #[snafu(display("store error: {source}"))]
    Db { source: DbError },

    #[snafu(display("upstream error: {source}"))]
    Upstream { source: UpstreamError },

    /// Reading an item's payload failed mid-stream. The file is the unit
    /// of retry; the next run downloads it from scratch.
    #[snafu(display("failed to read item content: {source}"))]
    ContentRead { source: std::io::Error },

    /// The keyring tooling could not be staged for this run.
    #[snafu(display("failed staging keyring material at {}: {source}", path.display()))]
    KeyringStaging {
        path: PathBuf,
        source: std::io::Error,
    },
}
