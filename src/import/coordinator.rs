//! Wraps a whole import run.
//!
//! One import per region: a try-style advisory lock gates the run and is
//! released on every exit path. Keyrings are staged into a run-scoped
//! temp directory and the resulting paths threaded through the reader
//! configuration; nothing touches process-global state.

use std::sync::Arc;

use snafu::ResultExt;

use super::pipeline::{FinalizeOutcome, ResourceImporter};
use super::writer::sync_source;
use super::{ImportError, KeyringStagingSnafu};
use crate::config::Config;
use crate::db::{config_keys, BootSource, ResourceDb, IMPORT_IMAGES_LOCK};
use crate::rack::RackImporter;
use crate::streams::upstream::{
    select_products, ProductMapping, ProductSpec, ReaderFactory, StagedSource,
};
use crate::streams::{path_from_mirror_url, signing_policy_for, ReaderConfig};

/// Everything a run needs, bundled so call sites and the timer services
/// share one handle.
pub struct ImportContext {
    pub db: Arc<dyn ResourceDb>,
    pub factory: Arc<dyn ReaderFactory>,
    pub rack_importer: Arc<dyn RackImporter>,
    pub config: Config,
}

/// How a run ended, lock contention and empty upstreams included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The pipeline finalized; rack controllers should re-sync.
    Finalized,
    /// Nothing happened: the lock was held elsewhere, upstream had no
    /// descriptions, or the pipeline's safety gate tripped.
    Skipped,
}

/// True while an import holds the region-wide lock.
pub fn is_import_running(db: &dyn ResourceDb) -> bool {
    db.is_locked(IMPORT_IMAGES_LOCK)
}

/// Start an import and return immediately. Errors are logged, never
/// surfaced; a finalized run triggers the rack-controller importer.
pub fn import_resources(ctx: Arc<ImportContext>) {
    tokio::spawn(async move {
        match import_resources_now(&ctx).await {
            Ok(ImportOutcome::Finalized) => {
                let importer = Arc::clone(&ctx.rack_importer);
                tokio::spawn(async move { importer.import_boot_images().await });
            }
            Ok(ImportOutcome::Skipped) => {}
            Err(error) => {
                error!(message = "Importing boot resources failed.", error = %error);
            }
        }
    });
}

/// Run one import to completion.
///
/// Must not be called inside a store transaction: the run manages its own
/// short transactions throughout and keeping one open across upstream
/// fetches would hold it for the whole download.
pub async fn import_resources_now(ctx: &ImportContext) -> Result<ImportOutcome, ImportError> {
    assert!(
        !ctx.db.in_transaction(),
        "import_resources_now() must not be called within a preexisting transaction; \
         it manages its own"
    );
    let Some(_lock) = ctx.db.try_lock(IMPORT_IMAGES_LOCK) else {
        debug!("Skipping import as another import is already running.");
        return Ok(ImportOutcome::Skipped);
    };
    run_locked(ctx).await
}

async fn run_locked(ctx: &ImportContext) -> Result<ImportOutcome, ImportError> {
    std::fs::create_dir_all(&ctx.config.gnupg_home).context(KeyringStagingSnafu {
        path: ctx.config.gnupg_home.clone(),
    })?;
    ensure_boot_source_definition(&*ctx.db);

    // Scoped to the run; dropped (and deleted) on every path out.
    let keyrings = tempfile::Builder::new()
        .prefix("keyrings")
        .tempdir()
        .context(KeyringStagingSnafu {
            path: std::env::temp_dir(),
        })?;
    let staged = stage_sources(keyrings.path(), ctx.db.boot_sources())?;
    info!(
        message = "Started importing of boot images.",
        sources = staged.len()
    );

    let descriptions = download_all_image_descriptions(ctx, &staged).await;
    if descriptions.is_empty() {
        warn!("Unable to import boot images, no image descriptions available.");
        return Ok(ImportOutcome::Skipped);
    }
    let mapping = ProductMapping::map_products(descriptions);

    let mut importer = ResourceImporter::new(Arc::clone(&ctx.db), ctx.config.write_threads);
    for source in &staged {
        info!(message = "Importing images from source.", url = %source.url);
        let config = reader_config_for(ctx, source);
        let reader = ctx.factory.open(source, &config);
        sync_source(&*reader, &config, &mut importer, &mapping).await?;
    }
    let outcome = importer.finalize().await?;

    set_global_default_releases(&*ctx.db);
    info!(
        message = "Finished importing of boot images.",
        sources = staged.len()
    );
    Ok(match outcome {
        FinalizeOutcome::Finalized => ImportOutcome::Finalized,
        FinalizeOutcome::Aborted => ImportOutcome::Skipped,
    })
}

/// Seed the default source row when the operator configured none, so a
/// fresh region has something to import from.
fn ensure_boot_source_definition(db: &dyn ResourceDb) -> bool {
    if !db.boot_sources().is_empty() {
        return false;
    }
    info!("No boot sources configured; adding the default image source.");
    db.add_boot_source(BootSource {
        url: "http://images.maas.io/ephemeral-v3/daily/".to_string(),
        keyring_path: Some("/usr/share/keyrings/ubuntu-cloudimage-keyring.gpg".into()),
        keyring_data: None,
        selections: vec![crate::db::ImageSelection {
            os: "ubuntu".to_string(),
            release: "focal".to_string(),
            arches: vec!["amd64".to_string()],
            labels: vec!["*".to_string()],
        }],
    });
    true
}

/// Materialize each source's keyring bytes into the run's scratch
/// directory; sources carrying an on-disk keyring path keep it.
fn stage_sources(
    dir: &std::path::Path,
    sources: Vec<BootSource>,
) -> Result<Vec<StagedSource>, ImportError> {
    sources
        .into_iter()
        .enumerate()
        .map(|(index, source)| {
            let keyring_path = match &source.keyring_data {
                Some(data) => {
                    let path = dir.join(format!("keyring-{index}.gpg"));
                    std::fs::write(&path, data)
                        .context(KeyringStagingSnafu { path: path.clone() })?;
                    Some(path)
                }
                None => source.keyring_path.clone(),
            };
            Ok(StagedSource {
                url: source.url,
                keyring_path,
                selections: source.selections,
            })
        })
        .collect()
}

fn reader_config_for(ctx: &ImportContext, source: &StagedSource) -> ReaderConfig {
    let (_root, path) = path_from_mirror_url(&source.url);
    ReaderConfig::new(
        ctx.config.user_agent.clone(),
        ctx.config.upstream_deadline,
        signing_policy_for(&path, source.keyring_path.clone()),
    )
}

/// The image-description pass across all sources. Per-source failures are
/// logged and skipped: one unreachable mirror must not block the others.
async fn download_all_image_descriptions(
    ctx: &ImportContext,
    staged: &[StagedSource],
) -> Vec<ProductSpec> {
    let mut all = Vec::new();
    for source in staged {
        let config = reader_config_for(ctx, source);
        let reader = ctx.factory.open(source, &config);
        match reader.describe().await {
            Ok(specs) => all.extend(select_products(specs, &source.selections)),
            Err(error) => {
                error!(
                    message = "Unable to download image descriptions.",
                    url = %source.url, error = %error
                );
            }
        }
    }
    all
}

/// Seed the commissioning and deployment defaults from the first
/// commissioning-capable resource, once, when the operator never chose.
fn set_global_default_releases(db: &dyn ResourceDb) {
    let mut commissioning = None;
    if db.get_config(config_keys::COMMISSIONING_DISTRO_SERIES).is_none() {
        let resources = db.commissioning_resources();
        if let Some((osystem, release)) = resources
            .first()
            .and_then(|resource| resource.name.split_once('/'))
        {
            db.set_config(config_keys::COMMISSIONING_OSYSTEM, osystem);
            db.set_config(config_keys::COMMISSIONING_DISTRO_SERIES, release);
        }
        commissioning = Some(resources);
    }
    if db.get_config(config_keys::DEFAULT_DISTRO_SERIES).is_none() {
        let resources = commissioning.unwrap_or_else(|| db.commissioning_resources());
        if let Some((osystem, release)) = resources
            .first()
            .and_then(|resource| resource.name.split_once('/'))
        {
            db.set_config(config_keys::DEFAULT_OSYSTEM, osystem);
            db.set_config(config_keys::DEFAULT_DISTRO_SERIES, release);
        }
    }
}
