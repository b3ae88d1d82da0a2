use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{ArgAction, Parser};
use drydock_config::ConfigurationLoader;
use drydock_core::{DeployOptions, ServiceDeclaration, ServiceSpec};
use drydock_error::{ErrorContext as _, GenericError};
use tracing::{debug, level_filters::LevelFilter};

/// Service file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "drydock.yaml";

/// Prefix of environment variables overriding service file fields.
const ENV_PREFIX: &str = "DRYDOCK";

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Build the service image from the working directory.
    #[arg(short = 'b', long)]
    pub build: bool,

    /// Deploy the service container.
    #[arg(short = 'd', long)]
    pub deploy: bool,

    /// Start the service container.
    #[arg(short = 's', long)]
    pub start: bool,

    /// Restart the service container.
    #[arg(short = 'r', long)]
    pub restart: bool,

    /// Stop the service container.
    #[arg(short = 't', long)]
    pub stop: bool,

    /// Remove the service container along with its configuration and data directories.
    #[arg(short = 'c', long)]
    pub clean: bool,

    /// Remove the service container, its image, and its configuration and data directories.
    #[arg(short = 'p', long)]
    pub purge: bool,

    /// Show the last lines of the service container's output.
    #[arg(short = 'l', long)]
    pub logs: bool,

    /// Show a resource usage snapshot of the service container.
    #[arg(short = 'm', long)]
    pub monitor: bool,

    /// Return as soon as the container is started instead of waiting for it to become healthy.
    #[arg(short = 'w', long)]
    pub nowait: bool,

    /// Path to the service file.
    ///
    /// YAML (`.yaml`, `.yml`) and JSON (`.json`) files are supported. Top-level fields can be overridden with
    /// `DRYDOCK_`-prefixed environment variables.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Working directory of the service.
    ///
    /// This is the image build context and holds the generated directories. Defaults to the directory containing the
    /// service file.
    #[arg(long, value_name = "PATH")]
    pub workdir: Option<PathBuf>,

    /// Maximum time to wait for the container to become healthy, in seconds.
    ///
    /// Overrides `health_gate_timeout` from the service file. Without either, the wait only ends when the container
    /// becomes healthy or exits.
    #[arg(long, value_name = "SECS")]
    pub max_wait: Option<u64>,
}

/// Primary actions, of which at most one can be requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrimaryAction {
    Build,
    Deploy,
    Start,
    Restart,
    Stop,
    Clean,
    Purge,
}

/// What a single invocation does, in order: the primary action, then `monitor`, then `logs`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Plan {
    pub primary: Option<PrimaryAction>,
    pub monitor: bool,
    pub logs: bool,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Returns the plan for this invocation.
    ///
    /// Returns `None` on a usage error: either more than one primary action was requested, or none was and neither
    /// `--logs` nor `--monitor` was given.
    pub fn plan(&self) -> Option<Plan> {
        let selected = [
            (self.build, PrimaryAction::Build),
            (self.deploy, PrimaryAction::Deploy),
            (self.start, PrimaryAction::Start),
            (self.restart, PrimaryAction::Restart),
            (self.stop, PrimaryAction::Stop),
            (self.clean, PrimaryAction::Clean),
            (self.purge, PrimaryAction::Purge),
        ]
        .into_iter()
        .filter_map(|(requested, action)| requested.then_some(action))
        .collect::<Vec<_>>();

        let primary = match selected.as_slice() {
            [] if self.logs || self.monitor => None,
            [action] => Some(*action),
            _ => return None,
        };

        Some(Plan {
            primary,
            monitor: self.monitor,
            logs: self.logs,
        })
    }

    /// Returns the path to the service file.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Returns the absolute working directory of the service.
    ///
    /// # Errors
    ///
    /// If the current directory is needed and cannot be determined, an error will be returned.
    pub fn workdir(&self) -> io::Result<PathBuf> {
        let workdir = match &self.workdir {
            Some(workdir) => workdir.clone(),
            None => {
                let config_path = self.config_path();
                match config_path.parent() {
                    Some(parent) if parent != Path::new("") => parent.to_path_buf(),
                    _ => return std::env::current_dir(),
                }
            }
        };

        if workdir.is_absolute() {
            Ok(workdir)
        } else {
            Ok(std::env::current_dir()?.join(workdir))
        }
    }

    /// Returns the deploy options requested on the command line.
    pub fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            wait: !self.nowait,
            max_wait: self.max_wait.map(Duration::from_secs),
            ..Default::default()
        }
    }
}

/// Loads and validates the service file at `config_path`.
///
/// # Errors
///
/// If the file cannot be read or deserialized, or the declaration is invalid, an error will be returned.
pub fn load_service(config_path: &Path, workdir: PathBuf) -> Result<ServiceSpec, GenericError> {
    debug!(config = %config_path.display(), workdir = %workdir.display(), "Loading service file...");

    let declaration = ConfigurationLoader::default()
        .from_path(config_path)
        .and_then(|loader| loader.from_environment(ENV_PREFIX))
        .and_then(|loader| loader.into_typed::<ServiceDeclaration>())
        .with_error_context(|| format!("Failed to load service file '{}'.", config_path.display()))?;

    ServiceSpec::from_declaration(declaration, workdir)
        .with_error_context(|| format!("Invalid service file '{}'.", config_path.display()))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("drydock").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn single_primary_action() {
        let plan = parse(&["-d"]).plan().unwrap();
        assert_eq!(plan.primary, Some(PrimaryAction::Deploy));
        assert!(!plan.monitor);
        assert!(!plan.logs);

        assert_eq!(parse(&["--purge"]).plan().unwrap().primary, Some(PrimaryAction::Purge));
        assert_eq!(parse(&["-t"]).plan().unwrap().primary, Some(PrimaryAction::Stop));
    }

    #[test]
    fn primary_action_combines_with_monitor_and_logs() {
        let plan = parse(&["-s", "-m", "-l"]).plan().unwrap();
        assert_eq!(plan.primary, Some(PrimaryAction::Start));
        assert!(plan.monitor);
        assert!(plan.logs);
    }

    #[test]
    fn logs_or_monitor_alone() {
        assert_eq!(
            parse(&["--logs"]).plan(),
            Some(Plan {
                primary: None,
                monitor: false,
                logs: true,
            })
        );
        assert_eq!(parse(&["-m"]).plan().unwrap().primary, None);
    }

    #[test]
    fn usage_errors() {
        assert_eq!(parse(&[]).plan(), None);
        assert_eq!(parse(&["-w"]).plan(), None);
        assert_eq!(parse(&["-b", "-d"]).plan(), None);
        assert_eq!(parse(&["-s", "-t", "-l"]).plan(), None);
    }

    #[test]
    fn verbosity() {
        assert_eq!(parse(&["-s"]).log_level(), LevelFilter::INFO);
        assert_eq!(parse(&["-s", "-v"]).log_level(), LevelFilter::DEBUG);
        assert_eq!(parse(&["-s", "-vvv"]).log_level(), LevelFilter::TRACE);
    }

    #[test]
    fn deploy_options() {
        let options = parse(&["-d"]).deploy_options();
        assert!(options.wait);
        assert_eq!(options.max_wait, None);

        let options = parse(&["-d", "-w", "--max-wait", "90"]).deploy_options();
        assert!(!options.wait);
        assert_eq!(options.max_wait, Some(Duration::from_secs(90)));
    }

    #[test]
    fn workdir_defaults_to_service_file_directory() {
        let cli = parse(&["-s", "--config", "/srv/acme/search/drydock.yaml"]);
        assert_eq!(cli.workdir().unwrap(), PathBuf::from("/srv/acme/search"));

        let cli = parse(&["-s", "--config", "/srv/acme/search/drydock.yaml", "--workdir", "/opt/search"]);
        assert_eq!(cli.workdir().unwrap(), PathBuf::from("/opt/search"));

        let cli = parse(&["-s"]);
        assert_eq!(cli.config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.workdir().unwrap(), std::env::current_dir().unwrap());
    }

    #[test]
    fn loads_service_file() {
        let workdir = tempfile::tempdir().unwrap();
        let config_path = workdir.path().join("drydock.yaml");
        fs::write(
            &config_path,
            r#"
title: search
tenant: acme
version: "8.14"
port: 9200
system_access_key: admin
system_secret_key: changeme
health_check:
  interval: 10
  timeout: 5
  retries: 12
profile:
  kind: search
"#,
        )
        .unwrap();

        let spec = load_service(&config_path, workdir.path().to_path_buf()).unwrap();
        assert_eq!(spec.container_name(), "acme-search");
        assert_eq!(spec.image_reference(), "acme/search:8.14");
        assert_eq!(spec.workdir(), workdir.path());
    }

    #[test]
    fn rejects_invalid_service_file() {
        let workdir = tempfile::tempdir().unwrap();
        let config_path = workdir.path().join("drydock.yaml");
        fs::write(&config_path, "title: search\ntenant: acme\n").unwrap();

        let error = load_service(&config_path, workdir.path().to_path_buf()).unwrap_err();
        assert!(error.to_string().starts_with("Failed to load service file"));

        let missing = workdir.path().join("missing.yaml");
        assert!(load_service(&missing, workdir.path().to_path_buf()).is_err());

        let unsupported = workdir.path().join("drydock.toml");
        fs::write(&unsupported, "title = 'search'\n").unwrap();
        assert!(load_service(&unsupported, workdir.path().to_path_buf()).is_err());
    }
}
