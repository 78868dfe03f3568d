use std::path::PathBuf;
use std::time::Duration;

/// How often the auto-import service fires.
pub const IMPORT_SERVICE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// How often the import progress service fires.
pub const PROGRESS_SERVICE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Deadline for asking connected rack controllers about their local images.
pub const RACK_QUERY_DEADLINE: Duration = Duration::from_secs(90);

/// Runtime settings for the import and republication core.
///
/// Configuration loading lives with the host process; this struct is the
/// already-resolved form that gets threaded through the coordinator, the
/// services and the upstream reader instead of process-global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute base URL of this region controller, used to build the
    /// links embedded in persistent warnings and the endpoint descriptor
    /// handed to rack controllers.
    pub region_url: String,

    /// Number of concurrent writers draining the blob queue.
    pub write_threads: usize,

    /// Deadline for a single upstream catalog fetch.
    pub upstream_deadline: Duration,

    /// Deadline for the whole rack image query fan-out.
    pub rack_deadline: Duration,

    /// Interval of the auto-import service.
    pub import_interval: Duration,

    /// Interval of the progress service.
    pub progress_interval: Duration,

    /// Scratch home for the keyring tooling, created on demand before a run.
    pub gnupg_home: PathBuf,

    /// True on developer workstations. A developer environment with no
    /// existing resource sets never auto-imports, so a workstation does not
    /// pull gigabytes on a timer.
    pub dev_environment: bool,

    /// User agent presented to upstream mirrors.
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_url: "http://localhost:5240".to_string(),
            write_threads: 2,
            upstream_deadline: Duration::from_secs(5 * 60),
            rack_deadline: RACK_QUERY_DEADLINE,
            import_interval: IMPORT_SERVICE_PERIOD,
            progress_interval: PROGRESS_SERVICE_PERIOD,
            gnupg_home: std::env::temp_dir().join("bootstream-gnupg"),
            dev_environment: false,
            user_agent: concat!("bootstream/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Absolute URL of the images admin page, embedded in warnings.
    pub fn images_url(&self) -> String {
        format!("{}/images/", self.region_url.trim_end_matches('/'))
    }
}
