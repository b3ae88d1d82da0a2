//! Test helpers.
//!
//! [`FakeEngine`] is a scripted, in-memory [`ContainerEngine`] that records every call made against it.

use std::{
    collections::{HashSet, VecDeque},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use drydock_error::generic_error;
use serde_json::json;

use crate::{
    engine::{
        ContainerEngine, ContainerHandle, ContainerRequest, ContainerStatus, EngineError, ExecOutcome, HealthState,
    },
    service::ServiceDeclaration,
};

/// Engine operations that can be scripted to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    /// `build_image`
    Build,
    /// `run_container`
    Run,
    /// `list_containers`
    List,
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `restart`
    Restart,
    /// `remove_container`
    RemoveContainer,
    /// `remove_image`
    RemoveImage,
    /// `inspect`
    Inspect,
    /// `exec`
    Exec,
    /// `stats`
    Stats,
    /// `logs`
    Logs,
}

/// A call recorded by [`FakeEngine`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    /// `build_image`
    Build {
        /// Build context.
        context: PathBuf,
        /// Image tag.
        image: String,
    },
    /// `run_container`
    Run(ContainerRequest),
    /// `list_containers`
    List(String),
    /// `start`
    Start(String),
    /// `stop`
    Stop(String),
    /// `restart`
    Restart(String),
    /// `remove_container`
    RemoveContainer(String),
    /// `remove_image`
    RemoveImage(String),
    /// `inspect`
    Inspect(String),
    /// `exec`
    Exec {
        /// Container name.
        container: String,
        /// Command.
        command: Vec<String>,
    },
    /// `stats`
    Stats(String),
    /// `logs`
    Logs {
        /// Container name.
        container: String,
        /// Requested lines.
        tail: usize,
    },
}

#[derive(Default)]
struct State {
    containers: Vec<ContainerHandle>,
    statuses: VecDeque<ContainerStatus>,
    last_status: Option<ContainerStatus>,
    exec_outcome: ExecOutcome,
    unavailable: bool,
    failing: HashSet<Operation>,
    vanished: HashSet<(Operation, String)>,
    calls: Vec<Call>,
    next_id: usize,
}

/// A scripted, in-memory container engine.
///
/// Inspections return the scripted statuses in order and then keep returning the last one. Operations against unknown
/// containers fail with [`EngineError::NotFound`].
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    /// Creates an engine with no containers.
    pub fn new() -> Self {
        let engine = Self::default();
        engine.lock().exec_outcome = ExecOutcome {
            exit_code: Some(0),
            output: String::new(),
        };
        engine
    }

    /// Adds an existing container.
    pub fn with_container(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            let id = format!("fake-{}", state.next_id);
            state.next_id += 1;
            state.containers.push(ContainerHandle {
                id,
                name: name.to_string(),
            });
        }
        self
    }

    /// Scripts the statuses returned by `inspect`.
    pub fn with_statuses<I>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = ContainerStatus>,
    {
        self.lock().statuses.extend(statuses);
        self
    }

    /// Sets the outcome of every `exec`.
    pub fn with_exec_outcome(self, outcome: ExecOutcome) -> Self {
        self.lock().exec_outcome = outcome;
        self
    }

    /// Makes every call fail as if the engine could not be reached.
    pub fn unavailable(self) -> Self {
        self.lock().unavailable = true;
        self
    }

    /// Makes every call of `operation` fail.
    pub fn failing(self, operation: Operation) -> Self {
        self.lock().failing.insert(operation);
        self
    }

    /// Makes `operation` report `name` as missing, even if it is listed.
    pub fn vanished(self, operation: Operation, name: &str) -> Self {
        self.lock().vanished.insert((operation, name.to_string()));
        self
    }

    /// Returns the recorded calls, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Counts the recorded calls matching `predicate`.
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Call) -> bool,
    {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Returns the names of the containers currently known.
    pub fn container_names(&self) -> Vec<String> {
        self.lock().containers.iter().map(|c| c.name.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call, operation: Operation, target: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(call);

        if state.unavailable {
            return Err(EngineError::Unavailable {
                source: generic_error!("connection refused"),
            });
        }
        if state.failing.contains(&operation) {
            return Err(EngineError::Api {
                operation: "complete scripted call",
                source: generic_error!("scripted failure of {:?} on '{}'", operation, target),
            });
        }
        if state.vanished.contains(&(operation, target.to_string())) {
            return Err(EngineError::NotFound {
                target: target.to_string(),
            });
        }
        Ok(())
    }

    fn ensure_exists(&self, name: &str) -> Result<(), EngineError> {
        if self.lock().containers.iter().any(|c| c.name == name) {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                target: name.to_string(),
            })
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build_image(&self, context: &Path, image: &str) -> Result<(), EngineError> {
        let call = Call::Build {
            context: context.to_path_buf(),
            image: image.to_string(),
        };
        self.record(call, Operation::Build, image)
    }

    async fn run_container(&self, request: &ContainerRequest) -> Result<ContainerHandle, EngineError> {
        self.record(Call::Run(request.clone()), Operation::Run, &request.name)?;

        let mut state = self.lock();
        let handle = ContainerHandle {
            id: format!("fake-{}", state.next_id),
            name: request.name.clone(),
        };
        state.next_id += 1;
        state.containers.push(handle.clone());
        Ok(handle)
    }

    async fn list_containers(&self, name_filter: &str) -> Result<Vec<ContainerHandle>, EngineError> {
        self.record(Call::List(name_filter.to_string()), Operation::List, name_filter)?;

        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| c.name.contains(name_filter))
            .cloned()
            .collect())
    }

    async fn start(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        self.record(Call::Start(container.name.clone()), Operation::Start, &container.name)?;
        self.ensure_exists(&container.name)
    }

    async fn stop(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        self.record(Call::Stop(container.name.clone()), Operation::Stop, &container.name)?;
        self.ensure_exists(&container.name)
    }

    async fn restart(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        self.record(Call::Restart(container.name.clone()), Operation::Restart, &container.name)?;
        self.ensure_exists(&container.name)
    }

    async fn remove_container(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        let call = Call::RemoveContainer(container.name.clone());
        self.record(call, Operation::RemoveContainer, &container.name)?;
        self.ensure_exists(&container.name)?;
        self.lock().containers.retain(|c| c.name != container.name);
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        self.record(Call::RemoveImage(reference.to_string()), Operation::RemoveImage, reference)
    }

    async fn inspect(&self, container: &ContainerHandle) -> Result<ContainerStatus, EngineError> {
        self.record(Call::Inspect(container.name.clone()), Operation::Inspect, &container.name)?;
        self.ensure_exists(&container.name)?;

        let mut state = self.lock();
        let status = match state.statuses.pop_front() {
            Some(status) => status,
            None => state.last_status.unwrap_or(ContainerStatus {
                running: true,
                health: HealthState::Starting,
            }),
        };
        state.last_status = Some(status);
        Ok(status)
    }

    async fn exec(&self, container: &ContainerHandle, command: &[String]) -> Result<ExecOutcome, EngineError> {
        let call = Call::Exec {
            container: container.name.clone(),
            command: command.to_vec(),
        };
        self.record(call, Operation::Exec, &container.name)?;
        Ok(self.lock().exec_outcome.clone())
    }

    async fn stats(&self, container: &ContainerHandle) -> Result<serde_json::Value, EngineError> {
        self.record(Call::Stats(container.name.clone()), Operation::Stats, &container.name)?;
        self.ensure_exists(&container.name)?;
        Ok(json!({ "name": container.name, "memory_stats": { "usage": 1024 } }))
    }

    async fn logs(&self, container: &ContainerHandle, tail: usize) -> Result<String, EngineError> {
        let call = Call::Logs {
            container: container.name.clone(),
            tail,
        };
        self.record(call, Operation::Logs, &container.name)?;
        self.ensure_exists(&container.name)?;
        Ok(format!("{} ready\n", container.name))
    }
}

/// Returns a status with the given running flag and health.
pub fn status(running: bool, health: HealthState) -> ContainerStatus {
    ContainerStatus { running, health }
}

/// Builds a search service declaration for `acme`, with `profile` as its profile.
///
/// # Panics
///
/// Panics if `profile` is not a valid profile.
pub fn declaration(profile: serde_json::Value) -> ServiceDeclaration {
    serde_json::from_value(json!({
        "title": "search",
        "tenant": "acme",
        "version": 8.14,
        "memory": "2 GiB",
        "port": 9200,
        "export": "true",
        "system_access_key": "admin",
        "system_secret_key": "changeme",
        "health_check": { "interval": 10, "timeout": 5, "retries": 12 },
        "profile": profile,
    }))
    .expect("fixture declaration should deserialize")
}

/// Returns an identity provider profile.
pub fn identity_profile() -> serde_json::Value {
    json!({
        "kind": "identity",
        "domain": "id.acme.test",
        "realm": "acme",
        "master_username": "master",
        "master_password": "masterpass",
        "admin_username": "admin",
        "admin_password": "adminpass",
        "database": {
            "hostname": "acme-db",
            "hostport": 5432,
            "username": "keycloak",
            "password": "dbpass",
            "database": "keycloak",
        },
    })
}

/// Returns a reverse proxy profile with an auth gateway and two backends.
pub fn proxy_profile() -> serde_json::Value {
    json!({
        "kind": "proxy",
        "server_name": "www.acme.test",
        "auth": { "location": "/auth/", "endpoint": "acme-identity:8080" },
        "backends": [
            { "upstream": "api", "endpoint": "acme-api:8000" },
            { "upstream": "files", "endpoint": "acme-files:9000" },
        ],
        "publish": { "location": "/", "endpoint": "publish" },
    })
}
