//! Lifecycle operations against existing containers.
//!
//! Every operation targets all containers whose name contains the service's container name, as the engine's name
//! filter is a substring match. Finding no container at all is not an error.

use std::{fmt, io, path::PathBuf};

use snafu::{ResultExt as _, Snafu};
use tracing::{debug, info, warn};

use crate::{
    engine::{ContainerEngine, ContainerHandle, EngineError},
    service::ServiceSpec,
};

/// Number of log lines fetched per container.
pub const LOG_TAIL_LINES: usize = 100;

/// Lifecycle errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum LifecycleError {
    /// Containers could not be listed.
    #[snafu(display("Failed to list containers matching '{}': {}", filter, source))]
    List {
        /// Name filter.
        filter: String,

        /// Error source.
        source: EngineError,
    },

    /// A generated directory could not be removed.
    #[snafu(display("Failed to remove directory '{}': {}", path.display(), source))]
    Cleanup {
        /// Directory path.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },
}

/// Per-container actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleAction {
    /// Start the container.
    Start,

    /// Stop the container.
    Stop,

    /// Restart the container.
    Restart,

    /// Forcefully remove the container and its anonymous volumes.
    Remove,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Restart => "restart",
            LifecycleAction::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Outcome of a lifecycle operation.
///
/// `T` is what the operation produced per container: nothing for actions, a snapshot for `monitor`, text for `logs`.
#[derive(Debug)]
pub struct LifecycleOutcome<T = ()> {
    /// Names of all matching containers.
    pub matched: Vec<String>,

    /// Per-container results, for containers the operation completed on.
    pub outputs: Vec<(String, T)>,

    /// Per-container failures.
    pub failures: Vec<(String, EngineError)>,
}

impl<T> LifecycleOutcome<T> {
    fn new(matched: &[ContainerHandle]) -> Self {
        Self {
            matched: matched.iter().map(|c| c.name.clone()).collect(),
            outputs: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Returns `true` if no container matched.
    pub fn is_noop(&self) -> bool {
        self.matched.is_empty()
    }

    /// Returns `true` if no container failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Lifecycle operations for a single service.
pub struct Lifecycle<'a, E: ?Sized> {
    spec: &'a ServiceSpec,
    engine: &'a E,
}

impl<'a, E> Lifecycle<'a, E>
where
    E: ContainerEngine + ?Sized,
{
    /// Creates a new `Lifecycle`.
    pub fn new(spec: &'a ServiceSpec, engine: &'a E) -> Self {
        Self { spec, engine }
    }

    /// Starts all matching containers.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, an error is returned.
    pub async fn start(&self) -> Result<LifecycleOutcome, LifecycleError> {
        self.apply(LifecycleAction::Start).await
    }

    /// Stops all matching containers.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, an error is returned.
    pub async fn stop(&self) -> Result<LifecycleOutcome, LifecycleError> {
        self.apply(LifecycleAction::Stop).await
    }

    /// Restarts all matching containers.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, an error is returned.
    pub async fn restart(&self) -> Result<LifecycleOutcome, LifecycleError> {
        self.apply(LifecycleAction::Restart).await
    }

    /// Applies `action` to all matching containers.
    ///
    /// Containers that disappear between listing and acting are skipped. Other per-container failures are collected
    /// in the outcome.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, an error is returned.
    pub async fn apply(&self, action: LifecycleAction) -> Result<LifecycleOutcome, LifecycleError> {
        let containers = self.matching().await?;
        let mut outcome = LifecycleOutcome::new(&containers);

        for container in containers {
            let result = match action {
                LifecycleAction::Start => self.engine.start(&container).await,
                LifecycleAction::Stop => self.engine.stop(&container).await,
                LifecycleAction::Restart => self.engine.restart(&container).await,
                LifecycleAction::Remove => self.engine.remove_container(&container).await,
            };
            record(&mut outcome, container, action, result);
        }

        Ok(outcome)
    }

    /// Removes all matching containers, then the generated configuration and data directories.
    ///
    /// The image, backups and initialization scripts are preserved. When a container could not be removed, the
    /// directories are left in place, since the container may still be using them.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, or a directory cannot be removed, an error is returned.
    pub async fn clean(&self) -> Result<LifecycleOutcome, LifecycleError> {
        let outcome = self.apply(LifecycleAction::Remove).await?;

        if outcome.is_success() {
            self.remove_directories().await?;
        } else {
            warn!(service = %self.spec.container_name(), "Some containers could not be removed. Keeping directories.");
        }

        Ok(outcome)
    }

    /// Removes all matching containers, the image, and the generated directories.
    ///
    /// Container and image removal are best-effort: failures are logged and do not prevent the directories from being
    /// removed.
    ///
    /// # Errors
    ///
    /// If a directory cannot be removed, an error is returned.
    pub async fn purge(&self) -> Result<LifecycleOutcome, LifecycleError> {
        let outcome = match self.apply(LifecycleAction::Remove).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Failed to list containers. Continuing purge.");
                LifecycleOutcome::new(&[])
            }
        };
        for (name, error) in &outcome.failures {
            warn!(error = %error, "Failed to remove container '{}'. Continuing purge.", name);
        }

        let image = self.spec.image_reference();
        match self.engine.remove_image(&image).await {
            Ok(()) => info!("Removed image '{}'.", image),
            Err(e) if e.is_not_found() => debug!("Image '{}' does not exist.", image),
            Err(e) => warn!(error = %e, "Failed to remove image '{}'. Continuing purge.", image),
        }

        self.remove_directories().await?;

        Ok(LifecycleOutcome {
            failures: Vec::new(),
            ..outcome
        })
    }

    /// Fetches one resource usage snapshot per matching container.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, an error is returned.
    pub async fn monitor(&self) -> Result<LifecycleOutcome<serde_json::Value>, LifecycleError> {
        let containers = self.matching().await?;
        let mut outcome = LifecycleOutcome::new(&containers);

        for container in containers {
            let result = self.engine.stats(&container).await;
            record(&mut outcome, container, "stats", result);
        }

        Ok(outcome)
    }

    /// Fetches the last [`LOG_TAIL_LINES`] lines of output per matching container.
    ///
    /// # Errors
    ///
    /// If the containers cannot be listed, an error is returned.
    pub async fn logs(&self) -> Result<LifecycleOutcome<String>, LifecycleError> {
        let containers = self.matching().await?;
        let mut outcome = LifecycleOutcome::new(&containers);

        for container in containers {
            let result = self.engine.logs(&container, LOG_TAIL_LINES).await;
            record(&mut outcome, container, "logs", result);
        }

        Ok(outcome)
    }

    async fn matching(&self) -> Result<Vec<ContainerHandle>, LifecycleError> {
        let filter = self.spec.container_name();
        let containers = self
            .engine
            .list_containers(&filter)
            .await
            .context(List { filter: filter.clone() })?;

        if containers.is_empty() {
            info!(service = %filter, "No matching containers.");
        }
        Ok(containers)
    }

    async fn remove_directories(&self) -> Result<(), LifecycleError> {
        for path in [self.spec.conf_dir(), self.spec.data_dir()] {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => info!(directory = %path.display(), "Removed directory."),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(directory = %path.display(), "Directory does not exist.")
                }
                Err(source) => return Err(LifecycleError::Cleanup { path, source }),
            }
        }
        Ok(())
    }
}

fn record<T, A>(outcome: &mut LifecycleOutcome<T>, container: ContainerHandle, action: A, result: Result<T, EngineError>)
where
    A: fmt::Display,
{
    match result {
        Ok(output) => {
            debug!(action = %action, "Completed on container '{}'.", container.name);
            outcome.outputs.push((container.name, output));
        }
        Err(e) if e.is_not_found() => {
            debug!(action = %action, "Container '{}' disappeared. Skipping.", container.name);
        }
        Err(e) => outcome.failures.push((container.name, e)),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::testing::{declaration, Call, FakeEngine, Operation};

    fn search_spec(workdir: &Path) -> ServiceSpec {
        ServiceSpec::from_declaration(declaration(json!({ "kind": "search" })), workdir).unwrap()
    }

    fn make_dirs(workdir: &Path) {
        for name in ["conf.d", "data.d", "back.d"] {
            std::fs::create_dir(workdir.join(name)).unwrap();
        }
    }

    #[tokio::test]
    async fn actions_without_matches_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().with_container("acme-cache");
        let lifecycle = Lifecycle::new(&spec, &engine);

        for outcome in [
            lifecycle.start().await.unwrap(),
            lifecycle.stop().await.unwrap(),
            lifecycle.restart().await.unwrap(),
        ] {
            assert!(outcome.is_noop());
            assert!(outcome.is_success());
        }
        assert_eq!(
            engine.calls(),
            vec![
                Call::List("acme-search".to_string()),
                Call::List("acme-search".to_string()),
                Call::List("acme-search".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn substring_matches_are_all_affected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new()
            .with_container("acme-search")
            .with_container("acme-search-old")
            .with_container("acme-cache");

        let outcome = Lifecycle::new(&spec, &engine).stop().await.unwrap();

        assert_eq!(outcome.matched, vec!["acme-search", "acme-search-old"]);
        assert_eq!(engine.count(|call| matches!(call, Call::Stop(_))), 2);
    }

    #[tokio::test]
    async fn vanished_containers_are_skipped_and_failures_collected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new()
            .with_container("acme-search")
            .with_container("acme-search-old")
            .vanished(Operation::Restart, "acme-search-old");

        let outcome = Lifecycle::new(&spec, &engine).restart().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.outputs.len(), 1);

        let engine = FakeEngine::new().with_container("acme-search").failing(Operation::Start);
        let outcome = Lifecycle::new(&spec, &engine).start().await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.failures[0].0, "acme-search");
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().unavailable();

        let result = Lifecycle::new(&spec, &engine).stop().await;
        assert!(matches!(result, Err(LifecycleError::List { .. })));
    }

    #[tokio::test]
    async fn clean_removes_containers_and_generated_directories() {
        let dir = tempfile::tempdir().unwrap();
        make_dirs(dir.path());
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().with_container("acme-search");

        let outcome = Lifecycle::new(&spec, &engine).clean().await.unwrap();

        assert!(outcome.is_success());
        assert!(engine.container_names().is_empty());
        assert!(!dir.path().join("conf.d").exists());
        assert!(!dir.path().join("data.d").exists());
        assert!(dir.path().join("back.d").exists());
        assert_eq!(engine.count(|call| matches!(call, Call::RemoveImage(_))), 0);
    }

    #[tokio::test]
    async fn clean_keeps_directories_when_removal_fails() {
        let dir = tempfile::tempdir().unwrap();
        make_dirs(dir.path());
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new()
            .with_container("acme-search")
            .failing(Operation::RemoveContainer);

        let outcome = Lifecycle::new(&spec, &engine).clean().await.unwrap();

        assert!(!outcome.is_success());
        assert!(dir.path().join("data.d").exists());
    }

    #[tokio::test]
    async fn purge_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        make_dirs(dir.path());
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new()
            .with_container("acme-search")
            .failing(Operation::RemoveContainer)
            .failing(Operation::RemoveImage);

        let outcome = Lifecycle::new(&spec, &engine).purge().await.unwrap();

        assert!(outcome.is_success());
        assert!(engine.calls().contains(&Call::RemoveImage("acme/search:8.14".to_string())));
        assert!(!dir.path().join("conf.d").exists());
        assert!(!dir.path().join("data.d").exists());
    }

    #[tokio::test]
    async fn purge_survives_unavailable_engine() {
        let dir = tempfile::tempdir().unwrap();
        make_dirs(dir.path());
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().unavailable();

        Lifecycle::new(&spec, &engine).purge().await.unwrap();

        assert!(engine.calls().contains(&Call::RemoveImage("acme/search:8.14".to_string())));
        assert!(!dir.path().join("data.d").exists());
    }

    #[tokio::test]
    async fn purge_without_directories_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new();

        let outcome = Lifecycle::new(&spec, &engine).purge().await.unwrap();
        assert!(outcome.is_noop());
    }

    #[tokio::test]
    async fn monitor_and_logs_collect_per_container() {
        let dir = tempfile::tempdir().unwrap();
        let spec = search_spec(dir.path());
        let engine = FakeEngine::new().with_container("acme-search");
        let lifecycle = Lifecycle::new(&spec, &engine);

        let stats = lifecycle.monitor().await.unwrap();
        assert_eq!(stats.outputs[0].0, "acme-search");
        assert_eq!(stats.outputs[0].1["name"], "acme-search");

        let logs = lifecycle.logs().await.unwrap();
        assert_eq!(logs.outputs, vec![("acme-search".to_string(), "acme-search ready\n".to_string())]);
        assert!(engine.calls().contains(&Call::Logs {
            container: "acme-search".to_string(),
            tail: LOG_TAIL_LINES,
        }));
    }
}
