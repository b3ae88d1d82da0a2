//! Image builds and the deploy state machine.

use std::{fmt, io, path::PathBuf, time::Duration};

use drydock_error::{generic_error, GenericError};
use snafu::{ResultExt as _, Snafu};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{
    engine::{ContainerEngine, ContainerHandle, ContainerStatus, EngineError, HealthState},
    lock::{DeployLock, LockError},
    render::render_service,
    service::{ServiceSpec, SpecError},
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Deploy errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DeployError {
    /// The service declaration is invalid.
    #[snafu(display("Invalid service configuration: {}", source))]
    Configuration {
        /// Error source.
        source: SpecError,
    },

    /// The working directory is missing, or a required directory could not be created.
    #[snafu(display("Failed to prepare directory '{}': {}", path.display(), source))]
    Directory {
        /// Directory path.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// The rendered configuration could not be written.
    #[snafu(display("Failed to write configuration '{}': {}", path.display(), source))]
    ConfigWrite {
        /// File path.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// Another deployment of the same service is in progress.
    #[snafu(display("Failed to acquire deploy lock: {}", source))]
    Lock {
        /// Error source.
        source: LockError,
    },

    /// The container engine could not be reached.
    #[snafu(display("Container engine is unavailable: {}", source))]
    EngineUnavailable {
        /// Error source.
        source: EngineError,
    },

    /// The engine failed to create or start the container.
    #[snafu(display("Failed to create container '{}': {}", container, source))]
    ContainerCreate {
        /// Container name.
        container: String,

        /// Error source.
        source: EngineError,
    },

    /// The container status could not be fetched while waiting for it to become healthy.
    #[snafu(display("Failed to inspect container '{}': {}", container, source))]
    HealthCheck {
        /// Container name.
        container: String,

        /// Error source.
        source: EngineError,
    },

    /// The container stopped running before it became healthy.
    #[snafu(display("Container '{}' exited before becoming healthy.", container))]
    ContainerExited {
        /// Container name.
        container: String,
    },

    /// The container did not become healthy in time.
    #[snafu(display("Container '{}' did not become healthy within {:?}.", container, waited))]
    HealthGateTimeout {
        /// Container name.
        container: String,

        /// Configured bound.
        waited: Duration,
    },

    /// The post-deployment initialization command failed.
    #[snafu(display("Initialization of container '{}' failed: {}", container, source))]
    PostDeployCommand {
        /// Container name.
        container: String,

        /// Error source.
        source: GenericError,
    },

    /// The image could not be built.
    #[snafu(display("Failed to build image '{}': {}", image, source))]
    ImageBuild {
        /// Image reference.
        image: String,

        /// Error source.
        source: EngineError,
    },
}

/// Deploy options.
#[derive(Clone, Debug)]
pub struct DeployOptions {
    /// Whether to wait for the container to become healthy and initialize it.
    pub wait: bool,

    /// Time between two status polls.
    pub poll_interval: Duration,

    /// Bound on the health gate. When unset, the service's declared bound applies, and without one the gate waits
    /// until the container either becomes healthy or exits.
    pub max_wait: Option<Duration>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            wait: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

/// State of a deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeploymentState {
    /// Nothing has been done yet.
    NotDeployed,

    /// The container is being created.
    Starting,

    /// Waiting for the container to become healthy.
    HealthChecking,

    /// The container is healthy and initialized.
    Initialized,

    /// The deployment failed.
    Failed,
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentState::NotDeployed => "not_deployed",
            DeploymentState::Starting => "starting",
            DeploymentState::HealthChecking => "health_checking",
            DeploymentState::Initialized => "initialized",
            DeploymentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful deployment.
#[derive(Clone, Debug)]
pub struct DeployReport {
    /// Final state: `Starting` when not waiting, `Initialized` otherwise.
    pub state: DeploymentState,

    /// The deployed container.
    pub container: ContainerHandle,
}

struct StateTracker {
    service: String,
    current: DeploymentState,
}

impl StateTracker {
    fn new(service: String) -> Self {
        Self {
            service,
            current: DeploymentState::NotDeployed,
        }
    }

    fn transition(&mut self, next: DeploymentState) {
        info!(service = %self.service, from = %self.current, to = %next, "Deployment state changed.");
        self.current = next;
    }

    fn fail<T>(&mut self, error: DeployError) -> Result<T, DeployError> {
        self.transition(DeploymentState::Failed);
        Err(error)
    }
}

/// Drives builds and deployments of a single service.
pub struct Orchestrator<'a, E: ?Sized> {
    spec: &'a ServiceSpec,
    engine: &'a E,
}

impl<'a, E> Orchestrator<'a, E>
where
    E: ContainerEngine + ?Sized,
{
    /// Creates a new `Orchestrator`.
    pub fn new(spec: &'a ServiceSpec, engine: &'a E) -> Self {
        Self { spec, engine }
    }

    /// Builds the service image from the working directory.
    ///
    /// # Errors
    ///
    /// If the engine fails to build the image, an error is returned.
    pub async fn build(&self) -> Result<(), DeployError> {
        let image = self.spec.image_reference();
        info!(service = %self.spec.container_name(), "Building image '{}'...", image);

        self.engine
            .build_image(self.spec.workdir(), &image)
            .await
            .context(ImageBuild { image: image.clone() })?;

        info!(service = %self.spec.container_name(), "Built image '{}'.", image);
        Ok(())
    }

    /// Deploys the service.
    ///
    /// The configuration is rendered before anything else so that an invalid declaration aborts without side effects.
    /// The deploy lock is then taken, the required directories are created, the configuration is written, and the
    /// container is created and started. Unless `options.wait` is unset, the container is then polled until it is
    /// reported healthy, at which point its initialization command runs exactly once.
    ///
    /// # Errors
    ///
    /// If any step fails, or the container exits before it becomes healthy, an error is returned.
    pub async fn deploy(&self, options: &DeployOptions) -> Result<DeployReport, DeployError> {
        let container_name = self.spec.container_name();
        let mut state = StateTracker::new(container_name.clone());

        let rendered = render_service(self.spec).context(Configuration)?;

        let workdir = self.spec.workdir();
        tokio::fs::metadata(workdir).await.context(Directory {
            path: workdir.to_path_buf(),
        })?;
        let _lock = DeployLock::try_acquire(self.spec.lock_path()).context(Lock)?;

        state.transition(DeploymentState::Starting);

        if let Err(e) = self.prepare_host(rendered.as_ref().map(|r| (r.host_path(self.spec), r.contents()))).await {
            return state.fail(e);
        }

        let request = self.spec.container_request();
        debug!(service = %container_name, image = %request.image, "Creating container '{}'...", container_name);

        let container = match self.engine.run_container(&request).await {
            Ok(container) => container,
            Err(source @ EngineError::Unavailable { .. }) => return state.fail(DeployError::EngineUnavailable { source }),
            Err(source) => {
                return state.fail(DeployError::ContainerCreate {
                    container: container_name,
                    source,
                })
            }
        };
        info!(service = %container_name, id = %container.id, "Started container '{}'.", container.name);

        if !options.wait {
            info!(service = %container_name, "Not waiting for container to become healthy. Initialization is skipped.");
            return Ok(DeployReport {
                state: DeploymentState::Starting,
                container,
            });
        }

        state.transition(DeploymentState::HealthChecking);

        let max_wait = options.max_wait.or(self.spec.health_gate_timeout());
        if let Err(e) = self.health_gate(&container, options.poll_interval, max_wait).await {
            return state.fail(e);
        }

        if let Err(e) = self.initialize(&container).await {
            return state.fail(e);
        }

        state.transition(DeploymentState::Initialized);
        Ok(DeployReport {
            state: DeploymentState::Initialized,
            container,
        })
    }

    async fn prepare_host(&self, rendered: Option<(PathBuf, &str)>) -> Result<(), DeployError> {
        for path in self.spec.required_directories() {
            match tokio::fs::create_dir(&path).await {
                Ok(()) => debug!(directory = %path.display(), "Created directory."),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(directory = %path.display(), "Directory already exists.")
                }
                Err(source) => return Err(DeployError::Directory { path, source }),
            }
        }

        if let Some((path, contents)) = rendered {
            tokio::fs::write(&path, contents)
                .await
                .context(ConfigWrite { path: path.clone() })?;
            debug!(path = %path.display(), "Wrote rendered configuration.");
        }

        Ok(())
    }

    async fn health_gate(
        &self, container: &ContainerHandle, poll_interval: Duration, max_wait: Option<Duration>,
    ) -> Result<(), DeployError> {
        let started = Instant::now();

        loop {
            sleep(poll_interval).await;

            let status = match self.engine.inspect(container).await {
                Ok(status) => status,
                Err(e) if e.is_not_found() => ContainerStatus {
                    running: false,
                    health: HealthState::None,
                },
                Err(source) => {
                    return Err(DeployError::HealthCheck {
                        container: container.name.clone(),
                        source,
                    })
                }
            };

            if !status.running {
                warn!(service = %container.name, "Container exited before becoming healthy.");
                return ContainerExited {
                    container: container.name.clone(),
                }
                .fail();
            }

            if status.health == HealthState::Healthy {
                info!(service = %container.name, "Container is healthy.");
                return Ok(());
            }

            debug!(service = %container.name, health = ?status.health, "Container not yet healthy. Waiting...");

            if let Some(max_wait) = max_wait {
                if started.elapsed() >= max_wait {
                    return HealthGateTimeout {
                        container: container.name.clone(),
                        waited: max_wait,
                    }
                    .fail();
                }
            }
        }
    }

    async fn initialize(&self, container: &ContainerHandle) -> Result<(), DeployError> {
        let Some(command) = self.spec.init_command() else {
            debug!(service = %container.name, "Profile has no initialization command.");
            return Ok(());
        };

        // The command line carries credentials, so only the program is logged.
        let program = command.first().map(String::as_str).unwrap_or_default();
        info!(service = %container.name, program, "Running initialization command...");

        let outcome = self
            .engine
            .exec(container, &command)
            .await
            .map_err(GenericError::from)
            .context(PostDeployCommand {
                container: container.name.clone(),
            })?;

        if !outcome.succeeded() {
            let source = match outcome.exit_code {
                Some(code) => generic_error!("Command exited with code {}: {}", code, outcome.output.trim()),
                None => generic_error!("Command did not report an exit code: {}", outcome.output.trim()),
            };
            return Err(DeployError::PostDeployCommand {
                container: container.name.clone(),
                source,
            });
        }

        info!(service = %container.name, "Initialization command completed.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::{
        engine::ExecOutcome,
        testing::{declaration, proxy_profile, status, Call, FakeEngine, Operation},
    };

    fn search_spec(workdir: &Path) -> ServiceSpec {
        ServiceSpec::from_declaration(declaration(json!({ "kind": "search" })), workdir).unwrap()
    }

    fn exec_count(engine: &FakeEngine) -> usize {
        engine.count(|call| matches!(call, Call::Exec { .. }))
    }

    #[tokio::test]
    async fn build_tags_computed_reference() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new();

        Orchestrator::new(&spec, &engine).build().await.unwrap();

        assert_eq!(
            engine.calls(),
            vec![Call::Build {
                context: dir.path().to_path_buf(),
                image: "acme/search:8.14".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn build_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().failing(Operation::Build);

        let result = Orchestrator::new(&spec, &engine).build().await;
        assert!(matches!(result, Err(DeployError::ImageBuild { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn initializes_exactly_once_when_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().with_statuses([
            status(true, HealthState::Starting),
            status(true, HealthState::Starting),
            status(true, HealthState::Healthy),
            status(true, HealthState::Healthy),
            status(true, HealthState::Healthy),
        ]);

        let report = Orchestrator::new(&spec, &engine)
            .deploy(&DeployOptions::default())
            .await
            .unwrap();

        assert_eq!(report.state, DeploymentState::Initialized);
        assert_eq!(report.container.name, "acme-search");
        assert_eq!(exec_count(&engine), 1);
        assert_eq!(engine.count(|call| matches!(call, Call::Inspect(_))), 3);

        let exec = engine
            .calls()
            .into_iter()
            .find_map(|call| match call {
                Call::Exec { command, .. } => Some(command),
                _ => None,
            })
            .unwrap();
        assert_eq!(exec[0], "/usr/share/elasticsearch/bin/elasticsearch-users");
    }

    #[tokio::test(start_paused = true)]
    async fn exit_before_healthy_fails_without_initializing() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().with_statuses([
            status(true, HealthState::Starting),
            status(false, HealthState::Unhealthy),
            status(true, HealthState::Healthy),
        ]);

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;

        assert!(matches!(result, Err(DeployError::ContainerExited { ref container }) if container == "acme-search"));
        assert_eq!(exec_count(&engine), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exited_check_wins_over_health() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().with_statuses([status(false, HealthState::Healthy)]);

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;

        assert!(matches!(result, Err(DeployError::ContainerExited { .. })));
        assert_eq!(exec_count(&engine), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_container_counts_as_exited() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().vanished(Operation::Inspect, "acme-search");

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;
        assert!(matches!(result, Err(DeployError::ContainerExited { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn inspect_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().failing(Operation::Inspect);

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;
        assert!(matches!(result, Err(DeployError::HealthCheck { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new();
        let options = DeployOptions {
            max_wait: Some(Duration::from_secs(5)),
            ..Default::default()
        };

        let result = Orchestrator::new(&spec, &engine).deploy(&options).await;

        assert!(matches!(result, Err(DeployError::HealthGateTimeout { waited, .. }) if waited == Duration::from_secs(5)));
        assert_eq!(engine.count(|call| matches!(call, Call::Inspect(_))), 5);
        assert_eq!(exec_count(&engine), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn declared_bound_applies_without_option() {
        let dir = tempfile::tempdir().unwrap();
        let mut decl = declaration(json!({ "kind": "search" }));
        decl.health_gate_timeout = Some(3);
        let spec = ServiceSpec::from_declaration(decl, dir.path()).unwrap();
        let engine = FakeEngine::new();

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;
        assert!(matches!(result, Err(DeployError::HealthGateTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialization_is_surfaced_once() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new()
            .with_statuses([status(true, HealthState::Healthy)])
            .with_exec_outcome(ExecOutcome {
                exit_code: Some(64),
                output: "user already exists\n".to_string(),
            });

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;

        match result {
            Err(DeployError::PostDeployCommand { container, source }) => {
                assert_eq!(container, "acme-search");
                assert_eq!(source.to_string(), "Command exited with code 64: user already exists");
            }
            other => panic!("unexpected result: {:?}", other.map(|report| report.state)),
        }
        assert_eq!(exec_count(&engine), 1);
    }

    #[tokio::test]
    async fn nowait_stops_at_starting() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new();
        let options = DeployOptions {
            wait: false,
            ..Default::default()
        };

        let report = Orchestrator::new(&spec, &engine).deploy(&options).await.unwrap();

        assert_eq!(report.state, DeploymentState::Starting);
        assert_eq!(engine.count(|call| matches!(call, Call::Inspect(_))), 0);
        assert_eq!(exec_count(&engine), 0);
    }

    #[tokio::test]
    async fn directories_are_created_and_existing_ones_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data.d")).unwrap();
        std::fs::write(dir.path().join("data.d").join("keep"), b"x").unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new();
        let options = DeployOptions {
            wait: false,
            ..Default::default()
        };

        Orchestrator::new(&spec, &engine).deploy(&options).await.unwrap();

        for name in ["conf.d", "data.d", "back.d"] {
            assert!(dir.path().join(name).is_dir(), "{} missing", name);
        }
        assert!(dir.path().join("data.d").join("keep").exists());
    }

    #[tokio::test]
    async fn missing_workdir_aborts_before_container_creation() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(&dir.path().join("missing"));
        let engine = FakeEngine::new();

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;

        match result {
            Err(DeployError::Directory { path, source }) => {
                assert_eq!(path, dir.path().join("missing"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn proxy_configuration_is_written_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ServiceSpec::from_declaration(declaration(proxy_profile()), dir.path()).unwrap();
        let engine = FakeEngine::new();
        let options = DeployOptions {
            wait: false,
            ..Default::default()
        };

        Orchestrator::new(&spec, &engine).deploy(&options).await.unwrap();
        let first = std::fs::read_to_string(dir.path().join("conf.d").join("nginx.conf")).unwrap();
        assert!(first.contains("server_name www.acme.test;"));

        Orchestrator::new(&spec, &engine).deploy(&options).await.unwrap();
        let second = std::fs::read_to_string(dir.path().join("conf.d").join("nginx.conf")).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn invalid_routes_abort_before_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = proxy_profile();
        profile.as_object_mut().unwrap().remove("publish");
        let spec = ServiceSpec::from_declaration(declaration(profile), dir.path()).unwrap();
        let engine = FakeEngine::new();

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;

        assert!(matches!(result, Err(DeployError::Configuration { .. })));
        assert!(engine.calls().is_empty());
        assert!(!dir.path().join("conf.d").exists());
    }

    #[tokio::test]
    async fn creation_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());

        let engine = FakeEngine::new().failing(Operation::Run);
        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;
        assert!(matches!(result, Err(DeployError::ContainerCreate { .. })));
        assert_eq!(engine.count(|call| matches!(call, Call::Inspect(_))), 0);

        let engine = FakeEngine::new().unavailable();
        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;
        assert!(matches!(result, Err(DeployError::EngineUnavailable { .. })));
    }

    #[tokio::test]
    async fn concurrent_deploy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new();
        let _held = DeployLock::try_acquire(spec.lock_path()).unwrap();

        let result = Orchestrator::new(&spec, &engine).deploy(&DeployOptions::default()).await;

        match result {
            Err(DeployError::Directory { path, source }) => {
                assert_eq!(path, dir.path().join("missing"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(engine.calls().is_empty());
    }
}
