//! Rack controller RPC seam.
//!
//! The region invokes exactly two commands against each connected rack:
//! the current image-listing command with a transparent fallback to the
//! legacy one for racks that predate it, and the post-import trigger that
//! makes racks re-sync from the region's endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum RackError {
    /// The rack does not implement the requested command.
    #[snafu(display("unhandled command {command}"))]
    UnhandledCommand { command: String },

    /// The rack could not be reached or the call failed in transit.
    #[snafu(display("rack unreachable: {reason}"))]
    Unreachable { reason: String },
}

/// One boot image as reported by a rack controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootImage {
    pub osystem: String,
    pub release: String,
    pub architecture: String,
}

/// RPC client for a single connected rack controller.
#[async_trait]
pub trait RackClient: Send + Sync {
    async fn list_boot_images_v2(&self) -> Result<Vec<BootImage>, RackError>;
    async fn list_boot_images(&self) -> Result<Vec<BootImage>, RackError>;
}

/// The set of currently-connected rack controllers.
pub trait RackRegistry: Send + Sync {
    fn connected_clients(&self) -> Vec<Arc<dyn RackClient>>;
}

/// Post-import fan-out: tells every rack to pull the fresh catalog.
#[async_trait]
pub trait RackImporter: Send + Sync {
    async fn import_boot_images(&self);
}

/// Ask one rack for its local images, falling back to the legacy command
/// when the modern one is unhandled. Any failure counts as "no images";
/// an unreachable rack must not block the progress report.
async fn rack_images(client: Arc<dyn RackClient>) -> Vec<BootImage> {
    match client.list_boot_images_v2().await {
        Ok(images) => images,
        Err(RackError::UnhandledCommand { .. }) => {
            client.list_boot_images().await.unwrap_or_default()
        }
        Err(_) => Vec::new(),
    }
}

/// True if any currently-connected rack reports at least one image within
/// the deadline. Racks still pending at the deadline are ignored.
pub async fn any_rack_has_images(registry: &dyn RackRegistry, deadline: Duration) -> bool {
    let queries = registry
        .connected_clients()
        .into_iter()
        .map(|client| async move { !rack_images(client).await.is_empty() });
    let all = futures::future::join_all(queries);
    matches!(
        tokio::time::timeout(deadline, all).await,
        Ok(results) if results.iter().any(|has_images| *has_images)
    )
}
