//! The import pipeline: metadata first, bytes later.
//!
//! Upstream metadata is landed in the store as it is enumerated, so new
//! sets appear to operators as soon as possible; the large payloads are
//! queued and written afterwards by a small bounded worker pool. A set is
//! not published until every payload has been written and checksummed, so
//! readers never observe a half-imported set as usable.
//!
//! There is deliberately no outer transaction around a run. Each entry's
//! metadata lands atomically on its own, each payload write commits on its
//! own, and the destructive finalization steps each manage themselves;
//! this keeps every individual store interaction short.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;

use super::{ContentReadSnafu, DbSnafu, ImportError, UpstreamSnafu};
use crate::db::ResourceDb;
use crate::model::{FileId, FileKind, LargeFile, ResourceFile, ResourceIdentity, ResourceKind};
use crate::streams::upstream::{item_checksums, ContentOpener, ProductData, UpstreamError};

/// What finalization decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The run went through reconciliation, payload writes and cleanup.
    Finalized,
    /// The safety gate tripped: nothing upstream overlapped with anything
    /// already synced, which is indistinguishable from a broken upstream
    /// enumeration. The store was left untouched.
    Aborted,
}

/// One import run over the catalog store.
///
/// Construction snapshots the identities of every synced resource; each
/// inserted entry removes its identity from the snapshot, and whatever
/// remains at finalization is reconciled away.
pub struct ResourceImporter {
    db: Arc<dyn ResourceDb>,
    write_threads: usize,
    resources_to_delete: BTreeSet<String>,
    initial_resources_to_delete: BTreeSet<String>,
    content_to_finalize: VecDeque<(FileId, Box<dyn ContentOpener>)>,
}

impl ResourceImporter {
    pub fn new(db: Arc<dyn ResourceDb>, write_threads: usize) -> Self {
        let resources_to_delete = db.synced_identities();
        // Frozen copy, compared against at finalization: if the set never
        // shrank and nothing was queued, the run inserted nothing at all
        // and must not be allowed to delete everything.
        let initial_resources_to_delete = resources_to_delete.clone();
        Self {
            db,
            write_threads: write_threads.max(1),
            resources_to_delete,
            initial_resources_to_delete,
            content_to_finalize: VecDeque::new(),
        }
    }

    /// Number of payload writes queued so far.
    pub fn queued_writes(&self) -> usize {
        self.content_to_finalize.len()
    }

    fn prevent_resource_deletion(&mut self, identity: &ResourceIdentity) {
        self.resources_to_delete.remove(&identity.to_string());
    }

    /// Land one catalog entry's metadata.
    ///
    /// Only metadata is stored here; payload content is queued and written
    /// during [`ResourceImporter::finalize`]. Skipping finalization leaves
    /// the metadata present but none of the touched sets complete.
    pub fn insert(
        &mut self,
        data: &ProductData,
        content: Box<dyn ContentOpener>,
    ) -> Result<(), ImportError> {
        let os = data.require("os").context(UpstreamSnafu)?;
        let release = data.require("release").context(UpstreamSnafu)?;
        let arch = data.require("arch").context(UpstreamSnafu)?;
        let subarch = data.require("subarch").context(UpstreamSnafu)?;
        let name = format!("{}/{}", os, release);
        let architecture = format!("{}/{}", arch, subarch);

        let (resource, was_synced) = self
            .db
            .get_or_create_resource(&name, &architecture, data.resource_extra())
            .context(DbSnafu)?;
        if was_synced {
            // Present upstream, so it survives reconciliation.
            self.prevent_resource_deletion(&ResourceIdentity::of(&resource));
        }
        let was_complete = self.db.get_latest_complete_set(resource.id).is_some();

        let version = data.require("version_name").context(UpstreamSnafu)?;
        let label = data.get("label").unwrap_or_default();
        let set = match self.db.find_set(resource.id, version) {
            Some(mut set) => {
                set.label = label.to_string();
                self.db.update_set(&set).context(DbSnafu)?;
                set
            }
            None => self.db.create_set(resource.id, version, label),
        };
        debug!(
            message = "Got boot resource set.",
            resource = %name, version = %set.version
        );

        let ftype = data.require("ftype").context(UpstreamSnafu)?;
        let filetype = FileKind::parse(ftype).ok_or(UpstreamError::Malformed {
            reason: format!("unknown filetype {ftype}"),
        })
        .context(UpstreamSnafu)?;
        // Synced resources name the file after its type, the way upstream
        // mirrors publish them.
        let filename = ftype;
        let mut rfile = match self.db.find_file(set.id, filename) {
            Some(file) => file,
            None => self
                .db
                .create_file(set.id, filename, filetype, data.file_extra()),
        };
        rfile.filetype = filetype;
        rfile.extra = data.file_extra();

        let checksums = item_checksums(data);
        let sha256 = checksums
            .get("sha256")
            .ok_or(UpstreamError::Malformed {
                reason: "missing sha256 checksum".to_string(),
            })
            .context(UpstreamSnafu)?;
        let total_size = data
            .size()
            .ok_or(UpstreamError::Malformed {
                reason: "missing size".to_string(),
            })
            .context(UpstreamSnafu)?;

        // Reconcile the blob reference. A largefile with a stale digest is
        // detached now and reclaimed only after the file points elsewhere,
        // since the file must never hold a dangling reference.
        let mut prev_largefile: Option<LargeFile> = None;
        let mut largefile = rfile.largefile_id.and_then(|id| self.db.get_largefile(id));
        if let Some(existing) = largefile.take() {
            if existing.sha256 == *sha256 {
                largefile = Some(existing);
            } else {
                warn!(
                    message = "Hash mismatch for resource file; replacing content.",
                    file = %rfile.filename, set = %set.version, resource = %name
                );
                prev_largefile = Some(existing);
            }
        }
        if largefile.is_none() {
            largefile = self.db.find_largefile_by_sha256(sha256);
            if let Some(found) = &largefile {
                if found.total_size != total_size {
                    warn!(
                        message = "Existing large file disagrees with upstream declared size.",
                        sha256 = %found.sha256,
                        declared = total_size,
                        stored = found.total_size
                    );
                }
            }
        }
        let needs_saving = largefile.is_none();
        let largefile = match largefile {
            Some(largefile) => largefile,
            None => {
                let largefile = self.db.create_largefile(sha256, total_size);
                debug!(message = "New large file created.", sha256 = %largefile.sha256);
                largefile
            }
        };

        rfile.largefile_id = Some(largefile.id);
        self.db.update_file(&rfile).context(DbSnafu)?;

        if was_complete && self.db.get_latest_complete_set(resource.id).is_none() {
            error!(
                message = "Resource has no complete resource set!",
                resource = %name, architecture = %architecture
            );
        }

        if let Some(prev) = prev_largefile {
            // The file no longer refers to it; with the reference gone the
            // stale blob may drop to zero referrers and be reclaimed.
            self.db.delete_largefile_if_unreferenced(prev.id);
        }

        if needs_saving {
            self.content_to_finalize.push_back((rfile.id, content));
        } else {
            debug!(
                message = "Boot image already up-to-date.",
                file = %self.file_log_identifier(&rfile)
            );
        }
        Ok(())
    }

    fn file_log_identifier(&self, file: &ResourceFile) -> String {
        let set = self.db.get_set(file.set_id);
        let resource = set
            .as_ref()
            .and_then(|set| self.db.get_resource(set.resource_id));
        match (resource, set) {
            (Some(resource), Some(set)) => format!(
                "{}/{}/{}",
                ResourceIdentity::of(&resource),
                set.version,
                file.filename
            ),
            _ => format!("file {}", file.id),
        }
    }

    /// Finalize the run: safety gate, reconciliation, payload writes, set
    /// cleanup, in that order.
    pub async fn finalize(mut self) -> Result<FinalizeOutcome, ImportError> {
        debug!(
            message = "Finalizing import run.",
            deletions = self.resources_to_delete.len(),
            queued_writes = self.content_to_finalize.len()
        );
        if self.resources_to_delete == self.initial_resources_to_delete
            && self.content_to_finalize.is_empty()
        {
            error!(
                message =
                    "Finalization of imported images skipped, else all synced images would be deleted.",
                resources = ?self.resources_to_delete
            );
            return Ok(FinalizeOutcome::Aborted);
        }
        self.resource_cleaner()?;
        self.perform_writes().await;
        self.resource_set_cleaner()?;
        Ok(FinalizeOutcome::Finalized)
    }

    /// Delete every synced resource upstream no longer offers.
    fn resource_cleaner(&self) -> Result<(), ImportError> {
        for identity in &self.resources_to_delete {
            let mut parts = identity.splitn(4, '/');
            let (Some(os), Some(arch), Some(subarch), Some(series)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let (name, architecture) = ResourceIdentity::storage_keys(os, arch, subarch, series);
            if let Some(resource) =
                self.db
                    .find_resource(&[ResourceKind::Synced], &name, &architecture)
            {
                debug!(message = "Deleting boot image.", identity = %identity);
                self.db.delete_resource(resource.id).context(DbSnafu)?;
            }
        }
        Ok(())
    }

    /// Drain the payload queue with a bounded pool: one worker per queued
    /// file, at most `write_threads` in flight. Workers share nothing but
    /// the queue; a failed write never takes the run down.
    async fn perform_writes(&mut self) {
        let mut pending = std::mem::take(&mut self.content_to_finalize);
        let mut workers: JoinSet<()> = JoinSet::new();
        loop {
            while workers.len() < self.write_threads {
                let Some((file_id, opener)) = pending.pop_front() else {
                    break;
                };
                let db = Arc::clone(&self.db);
                workers.spawn(write_content(db, file_id, opener));
            }
            match workers.join_next().await {
                Some(Ok(())) => {}
                Some(Err(join_error)) => {
                    error!(message = "Boot image writer task failed.", error = %join_error);
                }
                None => break,
            }
        }
    }

    /// Keep only the newest complete set per synced resource, then drop
    /// resources left with no sets at all.
    fn resource_set_cleaner(&self) -> Result<(), ImportError> {
        for resource in self.db.resources(Some(ResourceKind::Synced)) {
            let mut found_complete = false;
            for set in self.db.sets_of(resource.id).into_iter().rev() {
                if !self.db.set_complete(&set) {
                    // All sets should be complete by now; the stragglers
                    // cannot become complete anymore.
                    debug!(
                        message = "Deleting incomplete resourceset.",
                        resource = %resource.name, version = %set.version
                    );
                    self.db.delete_set(set.id).context(DbSnafu)?;
                } else if !found_complete {
                    found_complete = true;
                } else {
                    debug!(
                        message = "Deleting obsolete resourceset.",
                        resource = %resource.name, version = %set.version
                    );
                    self.db.delete_set(set.id).context(DbSnafu)?;
                }
            }
        }
        for resource in self.db.resources(Some(ResourceKind::Synced)) {
            if self.db.sets_of(resource.id).is_empty() {
                debug!(message = "Deleting empty resource.", resource = %resource.name);
                self.db.delete_resource(resource.id).context(DbSnafu)?;
            }
        }
        Ok(())
    }
}

/// Stream one queued payload into its blob, verifying the digest.
///
/// On digest mismatch the file is deleted (possibly cascading the
/// largefile) and the import carries on; on read failure the file is left
/// incomplete for set cleanup to reclaim. Either way the next run retries
/// the whole file.
async fn write_content(db: Arc<dyn ResourceDb>, file_id: FileId, opener: Box<dyn ContentOpener>) {
    let Some(file) = db.get_file(file_id) else {
        // Deleted while queued; nothing to write anymore.
        return;
    };
    let Some(largefile) = file.largefile_id.and_then(|id| db.get_largefile(id)) else {
        return;
    };
    debug!(message = "Finalizing boot image.", file = %file.filename, sha256 = %largefile.sha256);
    match stream_blob(&*db, &largefile, &*opener).await {
        Ok(digest) if digest == largefile.sha256 => {
            debug!(message = "Finalized boot image.", file = %file.filename);
        }
        Ok(digest) => {
            error!(
                message = "Failed to finalize boot image. Unexpected checksum.",
                file = %file.filename,
                found = %digest,
                expected = %largefile.sha256
            );
            if let Err(error) = db.delete_file(file_id) {
                error!(message = "Failed deleting corrupt boot image file.", error = %error);
            }
        }
        Err(error) => {
            error!(
                message = "Failed to write boot image content.",
                file = %file.filename, error = %error
            );
        }
    }
}

async fn stream_blob(
    db: &dyn ResourceDb,
    largefile: &LargeFile,
    opener: &dyn ContentOpener,
) -> Result<String, ImportError> {
    let mut body = opener.open().await.context(ContentReadSnafu)?;
    let mut sink = db
        .open_largeobject_write(largefile.object_id)
        .context(DbSnafu)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; db.block_size()];
    loop {
        let read = body.read(&mut buffer).await.context(ContentReadSnafu)?;
        if read == 0 {
            break;
        }
        sink.write_chunk(&buffer[..read]).context(DbSnafu)?;
        hasher.update(&buffer[..read]);
    }
    sink.close().context(DbSnafu)?;
    Ok(hex::encode(hasher.finalize()))
}
