//! Container engine collaborator.

use std::{
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use drydock_error::GenericError;
use snafu::Snafu;

/// Container engine errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum EngineError {
    /// The engine could not be reached.
    #[snafu(display("Container engine is unavailable: {}", source))]
    Unavailable {
        /// Error source.
        source: GenericError,
    },

    /// The targeted container or image does not exist.
    #[snafu(display("'{}' does not exist.", target))]
    NotFound {
        /// Name of the missing container or image.
        target: String,
    },

    /// The engine rejected or failed a request.
    #[snafu(display("Container engine failed to {}: {}", operation, source))]
    Api {
        /// Operation that failed, such as `stop container`.
        operation: &'static str,

        /// Error source.
        source: GenericError,
    },
}

impl EngineError {
    /// Returns `true` if the error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

/// A container known to the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerHandle {
    /// Engine-assigned identifier.
    pub id: String,

    /// Container name.
    pub name: String,
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Health of a container, as reported by the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthState {
    /// No health check is defined.
    None,

    /// The health check has not passed yet.
    Starting,

    /// The health check passes.
    Healthy,

    /// The health check fails.
    Unhealthy,
}

/// Status of a container.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ContainerStatus {
    /// Whether the container is running.
    pub running: bool,

    /// Reported health.
    pub health: HealthState,
}

/// Result of a command executed inside a container.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExecOutcome {
    /// Exit code, when the engine reports one.
    pub exit_code: Option<i64>,

    /// Combined standard output and standard error.
    pub output: String,
}

impl ExecOutcome {
    /// Returns `true` if the command exited with code zero.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A bind mount.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mount {
    /// Host path.
    pub host: PathBuf,

    /// Container path.
    pub container: String,
}

impl Mount {
    /// Creates a new `Mount`.
    pub fn new<H, C>(host: H, container: C) -> Self
    where
        H: Into<PathBuf>,
        C: Into<String>,
    {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }

    /// Returns the mount in `host:container` form.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host.display(), self.container)
    }
}

/// A link to another container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    /// Name of the linked container.
    pub container: String,

    /// Alias of the linked container.
    pub alias: String,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.alias)
    }
}

/// A container port published on the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortBinding {
    /// Port inside the container, TCP.
    pub container_port: u16,

    /// Host address to bind.
    pub host_ip: IpAddr,

    /// Host port to bind.
    pub host_port: u16,
}

/// Engine-executed health probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HealthProbe {
    /// Shell command, exiting zero when healthy.
    pub command: String,

    /// Time between two probe runs.
    pub interval: Duration,

    /// Time after which a probe run is considered failed.
    pub timeout: Duration,

    /// Consecutive failures before the container is reported unhealthy.
    pub retries: u32,
}

/// Container restart policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartPolicy {
    /// Restart when the container exits with a non-zero code, at most `max_retries` times.
    OnFailure {
        /// Maximum number of restarts.
        max_retries: u32,
    },
}

/// Everything needed to create and start the service container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerRequest {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Container hostname.
    pub hostname: String,

    /// Network to attach to.
    pub network: String,

    /// Memory limit, in bytes.
    pub memory_limit: Option<u64>,

    /// Bind mounts.
    pub mounts: Vec<Mount>,

    /// Links to other containers.
    pub links: Vec<Link>,

    /// Published ports.
    pub ports: Vec<PortBinding>,

    /// Environment, as `KEY=VALUE`.
    pub environment: Vec<String>,

    /// Health probe.
    pub health_probe: HealthProbe,

    /// Restart policy.
    pub restart_policy: RestartPolicy,
}

/// A container engine.
///
/// Containers are addressed through [`ContainerHandle`]s obtained from [`run_container`][Self::run_container] or
/// [`list_containers`][Self::list_containers]. Operations on a container that no longer exists fail with
/// [`EngineError::NotFound`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Builds an image from the given context directory and tags it as `image`.
    async fn build_image(&self, context: &Path, image: &str) -> Result<(), EngineError>;

    /// Creates and starts a container.
    async fn run_container(&self, request: &ContainerRequest) -> Result<ContainerHandle, EngineError>;

    /// Lists containers in any state whose name contains `name_filter`.
    async fn list_containers(&self, name_filter: &str) -> Result<Vec<ContainerHandle>, EngineError>;

    /// Starts a container.
    async fn start(&self, container: &ContainerHandle) -> Result<(), EngineError>;

    /// Stops a container.
    async fn stop(&self, container: &ContainerHandle) -> Result<(), EngineError>;

    /// Restarts a container.
    async fn restart(&self, container: &ContainerHandle) -> Result<(), EngineError>;

    /// Forcefully removes a container along with its anonymous volumes.
    async fn remove_container(&self, container: &ContainerHandle) -> Result<(), EngineError>;

    /// Forcefully removes an image.
    async fn remove_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Fetches the current status of a container.
    async fn inspect(&self, container: &ContainerHandle) -> Result<ContainerStatus, EngineError>;

    /// Executes a command inside a container and waits for it to complete.
    async fn exec(&self, container: &ContainerHandle, command: &[String]) -> Result<ExecOutcome, EngineError>;

    /// Fetches a single resource usage snapshot.
    async fn stats(&self, container: &ContainerHandle) -> Result<serde_json::Value, EngineError>;

    /// Fetches the last `tail` lines of output.
    async fn logs(&self, container: &ContainerHandle, tail: usize) -> Result<String, EngineError>;
}
