//! Periodic services: automatic imports and import-progress reporting.
//!
//! Each service is a spawned task looping on a timer, firing once
//! immediately at startup and then every interval. A tick never takes the
//! host down: everything a tick does is absorbed into log entries, and a
//! running tick is the only outstanding one (the timer does not stack
//! overlapping invocations).

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::db::{config_keys, Component, ResourceDb};
use crate::import::{import_resources, ImportContext};
use crate::rack::{any_rack_has_images, RackRegistry};

/// Handle to a started service; stopping is graceful.
pub struct ServiceHandle {
    trigger_cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    pub async fn stop(self) {
        let _ = self.trigger_cancel.send(());
        let _ = self.task.await;
    }
}

fn spawn_interval_service<F, Fut>(period: std::time::Duration, mut tick: F) -> ServiceHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (trigger_cancel, mut cancel_signal) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut cancel_signal => break,
                _ = interval.tick() => tick().await,
            }
        }
    });
    ServiceHandle {
        trigger_cancel,
        task,
    }
}

/// Periodically kicks off an import when automatic imports are enabled.
pub struct ImportResourcesService {
    ctx: Arc<ImportContext>,
}

impl ImportResourcesService {
    pub fn new(ctx: Arc<ImportContext>) -> Self {
        Self { ctx }
    }

    pub fn start(self) -> ServiceHandle {
        let period = self.ctx.config.import_interval;
        spawn_interval_service(period, move || {
            let ctx = Arc::clone(&self.ctx);
            async move { Self::maybe_import_resources(ctx).await }
        })
    }

    async fn maybe_import_resources(ctx: Arc<ImportContext>) {
        if !Self::auto_import_enabled(&ctx) {
            debug!("Skipping periodic import of boot resources; it has been disabled.");
            return;
        }
        // Fire and forget; the run logs its own failures and the advisory
        // lock keeps concurrent runs out.
        import_resources(ctx);
    }

    /// The configured flag, with one extra suppression: a developer
    /// environment holding no resource sets never auto-imports, so a
    /// workstation does not start pulling gigabytes on a timer.
    fn auto_import_enabled(ctx: &ImportContext) -> bool {
        let auto = !matches!(
            ctx.db
                .get_config(config_keys::BOOT_IMAGES_AUTO_IMPORT)
                .as_deref(),
            Some("false") | Some("0")
        );
        auto && !(ctx.config.dev_environment && !ctx.db.any_sets())
    }
}

/// Periodically reports whether boot-image imports have made progress,
/// via a persistent warning on the admin UI.
pub struct ImportProgressService {
    db: Arc<dyn ResourceDb>,
    racks: Arc<dyn RackRegistry>,
    config: Config,
}

impl ImportProgressService {
    pub fn new(db: Arc<dyn ResourceDb>, racks: Arc<dyn RackRegistry>, config: Config) -> Self {
        Self { db, racks, config }
    }

    pub fn start(self) -> ServiceHandle {
        let period = self.config.progress_interval;
        let service = Arc::new(self);
        spawn_interval_service(period, move || {
            let service = Arc::clone(&service);
            async move { service.check_boot_images().await }
        })
    }

    pub async fn check_boot_images(&self) {
        if !self.db.resources(None).is_empty() {
            // The region has boot resources; the racks will too, soon
            // enough. Nothing to warn about.
            self.db.discard_persistent_error(Component::BootImages);
            return;
        }
        let images_url = self.config.images_url();
        let warning = if any_rack_has_images(&*self.racks, self.config.rack_deadline).await {
            warning_rack_has_boot_images(&images_url)
        } else {
            warning_rack_has_no_boot_images(&images_url)
        };
        self.db
            .register_persistent_error(Component::BootImages, warning);
    }
}

pub fn warning_rack_has_boot_images(images_url: &str) -> String {
    format!(
        "One or more of your rack controller(s) currently has boot images, \
         but your region controller does not. Machines will not be able to \
         provision until you import boot images into the region. Visit the \
         <a href=\"{images_url}\">boot images</a> page to start the import."
    )
}

pub fn warning_rack_has_no_boot_images(images_url: &str) -> String {
    format!(
        "Boot image import process not started. Machines will not be able \
         to provision without boot images. Visit the \
         <a href=\"{images_url}\">boot images</a> page to start the import."
    )
}
