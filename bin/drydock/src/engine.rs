use std::{
    collections::HashMap,
    future::Future,
    io,
    path::Path,
    time::Duration,
};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions, StatsOptions,
    },
    errors::Error,
    exec::{CreateExecOptions, StartExecResults},
    image::{BuildImageOptions, RemoveImageOptions},
    models::{
        ContainerState, ContainerStateStatusEnum, HealthConfig, HealthStatusEnum, HostConfig,
        PortBinding as EnginePortBinding, RestartPolicy as EngineRestartPolicy, RestartPolicyNameEnum,
    },
    Docker,
};
use bytes::Bytes;
use drydock_core::engine::{
    ContainerEngine, ContainerHandle, ContainerRequest, ContainerStatus, EngineError, ExecOutcome, HealthProbe,
    HealthState, Mount, RestartPolicy,
};
use drydock_error::{generic_error, GenericError};
use futures::StreamExt as _;
use tracing::{debug, trace, warn};

/// Directories left out of the build context, as they hold container-owned runtime data.
const CONTEXT_EXCLUDES: &[&str] = &["data.d", "back.d"];

/// Container engine backed by the local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Creates a new `DockerEngine` using the default connection settings.
    ///
    /// The connection itself is established lazily, so an unreachable daemon surfaces on the first request.
    ///
    /// # Errors
    ///
    /// If the Docker client cannot be configured, an error will be returned.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_defaults().map_err(|e| EngineError::Unavailable { source: e.into() })?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(&self, context: &Path, image: &str) -> Result<(), EngineError> {
        let context_dir = context.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || build_context(&context_dir))
            .await
            .map_err(|e| api_error("archive build context", generic_error!("Build context task failed: {}", e)))?
            .map_err(|e| api_error("archive build context", e.into()))?;

        debug!(image, context_bytes = archive.len(), "Sending build context to engine...");

        let mut build_stream = self
            .docker
            .build_image(build_options(image), None, Some(Bytes::from(archive)));
        while let Some(result) = build_stream.next().await {
            let info = result.map_err(|e| engine_error("build image", image, e))?;
            if let Some(error) = info.error {
                return Err(api_error("build image", generic_error!("{}", error.trim_end())));
            }
            if let Some(line) = info.stream {
                trace!(image, "{}", line.trim_end());
            }
        }

        Ok(())
    }

    async fn run_container(&self, request: &ContainerRequest) -> Result<ContainerHandle, EngineError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &request.ports {
            let key = format!("{}/tcp", port.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![EnginePortBinding {
                    host_ip: Some(port.host_ip.to_string()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let RestartPolicy::OnFailure { max_retries } = request.restart_policy;

        let container_config = Config {
            hostname: Some(request.hostname.clone()),
            env: Some(request.environment.clone()),
            image: Some(request.image.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            healthcheck: Some(health_config(&request.health_probe)),
            host_config: Some(HostConfig {
                binds: Some(request.mounts.iter().map(Mount::bind).collect()),
                network_mode: Some(request.network.clone()),
                memory: request
                    .memory_limit
                    .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX)),
                links: Some(request.links.iter().map(ToString::to_string).collect()),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                restart_policy: Some(EngineRestartPolicy {
                    name: Some(RestartPolicyNameEnum::ON_FAILURE),
                    maximum_retry_count: Some(i64::from(max_retries)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| engine_error("create container", &request.image, e))?;

        debug!(container = %request.name, id = %response.id, "Created container.");

        let start = self.docker.start_container::<String>(&request.name, None);
        let remove = || {
            let remove_options = RemoveContainerOptions {
                v: true,
                force: true,
                ..Default::default()
            };
            self.docker.remove_container(&response.id, Some(remove_options))
        };
        start_or_remove(&request.name, start, remove)
            .await
            .map_err(|e| engine_error("start container", &request.name, e))?;

        Ok(ContainerHandle {
            id: response.id,
            name: request.name.clone(),
        })
    }

    async fn list_containers(&self, name_filter: &str) -> Result<Vec<ContainerHandle>, EngineError> {
        let list_options = Some(ListContainersOptions {
            all: true,
            filters: HashMap::from([("name", vec![name_filter])]),
            ..Default::default()
        });

        let containers = self
            .docker
            .list_containers(list_options)
            .await
            .map_err(|e| engine_error("list containers", name_filter, e))?;

        let handles = containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id?;
                let name = container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerHandle { id, name })
            })
            .collect();

        Ok(handles)
    }

    async fn start(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        self.docker
            .start_container::<String>(&container.id, None)
            .await
            .map_err(|e| engine_error("start container", &container.name, e))
    }

    async fn stop(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        self.docker
            .stop_container(&container.id, None)
            .await
            .map_err(|e| engine_error("stop container", &container.name, e))
    }

    async fn restart(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        self.docker
            .restart_container(&container.id, None)
            .await
            .map_err(|e| engine_error("restart container", &container.name, e))
    }

    async fn remove_container(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(&container.id, Some(options))
            .await
            .map_err(|e| engine_error("remove container", &container.name, e))
    }

    async fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        let deleted = self
            .docker
            .remove_image(reference, Some(options), None)
            .await
            .map_err(|e| engine_error("remove image", reference, e))?;

        trace!(image = reference, "Image removal reported {} deleted layer(s).", deleted.len());
        Ok(())
    }

    async fn inspect(&self, container: &ContainerHandle) -> Result<ContainerStatus, EngineError> {
        let response = self
            .docker
            .inspect_container(&container.id, None)
            .await
            .map_err(|e| engine_error("inspect container", &container.name, e))?;

        Ok(container_status(response.state.unwrap_or_default()))
    }

    async fn exec(&self, container: &ContainerHandle, command: &[String]) -> Result<ExecOutcome, EngineError> {
        let exec_options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.to_vec()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(&container.id, exec_options)
            .await
            .map_err(|e| engine_error("create exec", &container.name, e))?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|e| engine_error("start exec", &container.name, e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| engine_error("read exec output", &container.name, e))?;
                    output.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| engine_error("inspect exec", &container.name, e))?;

        Ok(ExecOutcome {
            exit_code: inspected.exit_code,
            output,
        })
    }

    async fn stats(&self, container: &ContainerHandle) -> Result<serde_json::Value, EngineError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stats_stream = self.docker.stats(&container.id, Some(options));
        let stats = match stats_stream.next().await {
            Some(result) => result.map_err(|e| engine_error("fetch stats", &container.name, e))?,
            None => {
                return Err(api_error(
                    "fetch stats",
                    generic_error!("Engine returned no statistics for '{}'.", container.name),
                ))
            }
        };

        serde_json::to_value(stats).map_err(|e| api_error("encode stats", e.into()))
    }

    async fn logs(&self, container: &ContainerHandle, tail: usize) -> Result<String, EngineError> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut log_stream = self.docker.logs(&container.id, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = log_stream.next().await {
            let chunk = chunk.map_err(|e| engine_error("fetch logs", &container.name, e))?;
            logs.push_str(&chunk.to_string());
        }

        Ok(logs)
    }
}

fn health_config(probe: &HealthProbe) -> HealthConfig {
    HealthConfig {
        test: Some(vec!["CMD-SHELL".to_string(), probe.command.clone()]),
        interval: Some(as_nanos(probe.interval)),
        timeout: Some(as_nanos(probe.timeout)),
        retries: Some(i64::from(probe.retries)),
        ..Default::default()
    }
}

fn as_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn api_error(operation: &'static str, source: GenericError) -> EngineError {
    EngineError::Api { operation, source }
}

fn engine_error(operation: &'static str, target: &str, error: Error) -> EngineError {
    match error {
        Error::DockerResponseServerError { status_code: 404, .. } => EngineError::NotFound {
            target: target.to_string(),
        },
        e @ (Error::SocketNotFoundError(_)
        | Error::HyperLegacyError { .. }
        | Error::IOError { .. }
        | Error::RequestTimeoutError) => EngineError::Unavailable { source: e.into() },
        e => api_error(operation, e.into()),
    }
}

/// Archives a working directory as an image build context.
///
/// Top-level entries are added in name order, skipping the runtime data directories.
fn build_context(workdir: &Path) -> io::Result<Vec<u8>> {
    let mut entries = std::fs::read_dir(workdir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut archive = tar::Builder::new(Vec::new());
    for entry in entries {
        let name = entry.file_name();
        if CONTEXT_EXCLUDES.iter().any(|excluded| name == **excluded) {
            continue;
        }

        let path = entry.path();
        if entry.file_type()?.is_dir() {
            archive.append_dir_all(&name, &path)?;
        } else {
            archive.append_path_with_name(&path, &name)?;
        }
    }

    archive.into_inner()
}

/// Awaits `start`, removing the freshly created container when it fails so its name can be reused.
async fn start_or_remove<S, R, RF>(container: &str, start: S, remove: R) -> Result<(), Error>
where
    S: Future<Output = Result<(), Error>>,
    R: FnOnce() -> RF,
    RF: Future<Output = Result<(), Error>>,
{
    let Err(e) = start.await else {
        return Ok(());
    };

    match remove().await {
        Ok(()) => debug!(container, "Removed container that failed to start."),
        Err(remove_error) => {
            warn!(container, error = %remove_error, "Failed to remove container that failed to start.")
        }
    }
    Err(e)
}

fn build_options(image: &str) -> BuildImageOptions<String> {
    BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        t: image.to_string(),
        nocache: true,
        rm: true,
        ..Default::default()
    }
}

/// Maps the engine's view of a container's state.
///
/// Only the `running` status counts as running: the engine also reports a container that is being restarted after a
/// crash as running.
fn container_status(state: ContainerState) -> ContainerStatus {
    let health = match state.health.and_then(|health| health.status) {
        Some(HealthStatusEnum::STARTING) => HealthState::Starting,
        Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
        Some(HealthStatusEnum::EMPTY) | Some(HealthStatusEnum::NONE) | None => HealthState::None,
    };

    ContainerStatus {
        running: state.status == Some(ContainerStateStatusEnum::RUNNING),
        health,
    }
}
