//! Per-service container deployment controller.

use clap::{CommandFactory as _, Parser as _};
use drydock_app::prelude::*;
use drydock_error::{ErrorContext as _, GenericError};
use tracing::{error, info};

mod commands;

mod config;
use self::config::{load_service, Cli, Plan};

mod engine;
use self::engine::DockerEngine;

/// Exit code of an invocation that was not understood.
const USAGE_EXIT_CODE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let Some(plan) = cli.plan() else {
        if let Err(e) = Cli::command().print_help() {
            fatal_and_exit(format!("failed to print help: {}", e));
        }
        std::process::exit(USAGE_EXIT_CODE);
    };

    let guard = match initialize_logging(Some(cli.log_level())) {
        Ok(guard) => guard,
        Err(e) => fatal_and_exit(format!("failed to initialize logging: {}", e)),
    };

    match run(cli, plan).await {
        Ok(()) => info!("drydock finished."),
        Err(e) => {
            error!("{:?}", e);
            drop(guard);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, plan: Plan) -> Result<(), GenericError> {
    let workdir = cli
        .workdir()
        .error_context("Failed to determine the service working directory.")?;
    let spec = load_service(&cli.config_path(), workdir)?;

    info!(
        service = %spec.container_name(),
        image = %spec.image_reference(),
        profile = spec.profile().kind(),
        "drydock starting..."
    );

    let engine = DockerEngine::connect()?;
    let mut stdout = std::io::stdout().lock();

    commands::execute(&plan, &spec, &engine, &cli.deploy_options(), &mut stdout).await
}
