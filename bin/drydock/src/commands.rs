use std::io::Write;

use drydock_core::{ContainerEngine, DeployOptions, Lifecycle, LifecycleOutcome, Orchestrator, ServiceSpec};
use drydock_error::{generic_error, ErrorContext as _, GenericError};
use tracing::{error, info};

use crate::config::{Plan, PrimaryAction};

/// Executes `plan` against `engine`.
///
/// The primary action runs first, then `monitor`, then `logs`. Snapshots and logs are written to `out`. The first
/// failing step ends the invocation.
///
/// # Errors
///
/// If any step fails, an error will be returned.
pub async fn execute<E, W>(
    plan: &Plan, spec: &ServiceSpec, engine: &E, deploy_options: &DeployOptions, out: &mut W,
) -> Result<(), GenericError>
where
    E: ContainerEngine + ?Sized,
    W: Write,
{
    if let Some(action) = plan.primary {
        run_primary(action, spec, engine, deploy_options).await?;
    }

    let lifecycle = Lifecycle::new(spec, engine);

    if plan.monitor {
        let outcome = lifecycle.monitor().await?;
        for (_, snapshot) in &outcome.outputs {
            let snapshot =
                serde_json::to_string_pretty(snapshot).error_context("Failed to encode resource usage snapshot.")?;
            writeln!(out, "{}", snapshot).error_context("Failed to write resource usage snapshot.")?;
        }
        ensure_success("monitor", &outcome)?;
    }

    if plan.logs {
        let outcome = lifecycle.logs().await?;
        for (_, logs) in &outcome.outputs {
            writeln!(out, "{}", logs.trim_end_matches('\n')).error_context("Failed to write container logs.")?;
        }
        ensure_success("fetch logs of", &outcome)?;
    }

    Ok(())
}

async fn run_primary<E>(
    action: PrimaryAction, spec: &ServiceSpec, engine: &E, deploy_options: &DeployOptions,
) -> Result<(), GenericError>
where
    E: ContainerEngine + ?Sized,
{
    let orchestrator = Orchestrator::new(spec, engine);
    let lifecycle = Lifecycle::new(spec, engine);

    match action {
        PrimaryAction::Build => orchestrator.build().await?,
        PrimaryAction::Deploy => {
            let report = orchestrator.deploy(deploy_options).await?;
            info!(service = %spec.container_name(), state = %report.state, "Deployed container '{}'.", report.container);
        }
        PrimaryAction::Start => ensure_success("start", &lifecycle.start().await?)?,
        PrimaryAction::Restart => ensure_success("restart", &lifecycle.restart().await?)?,
        PrimaryAction::Stop => ensure_success("stop", &lifecycle.stop().await?)?,
        PrimaryAction::Clean => ensure_success("remove", &lifecycle.clean().await?)?,
        PrimaryAction::Purge => {
            let outcome = lifecycle.purge().await?;
            info!(service = %spec.container_name(), removed = outcome.outputs.len(), "Purged service.");
        }
    }

    Ok(())
}

fn ensure_success<T>(operation: &str, outcome: &LifecycleOutcome<T>) -> Result<(), GenericError> {
    for (name, e) in &outcome.failures {
        error!(error = %e, "Failed to {} container '{}'.", operation, name);
    }

    if outcome.is_success() {
        Ok(())
    } else {
        Err(generic_error!(
            "Failed to {} {} of {} matching container(s).",
            operation,
            outcome.failures.len(),
            outcome.matched.len()
        ))
    }
}
