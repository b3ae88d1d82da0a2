//! Service declarations and the validated service model.

use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use bytesize::ByteSize;
use serde::{Deserialize, Deserializer};
use serde_with::{serde_as, DeserializeAs as _};
use snafu::{ensure, ResultExt as _, Snafu};

use crate::{
    deser::{PermissiveBool, PermissiveString},
    engine::{ContainerRequest, HealthProbe, Link, Mount, PortBinding, RestartPolicy},
    profile::Profile,
    routing::{RoutingDocument, RoutingError},
};

const DEFAULT_RESTART_MAX_RETRIES: u32 = 5;

/// Errors raised while validating a service declaration or rendering its configuration.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum SpecError {
    /// A required field was empty.
    #[snafu(display("Field '{}' must not be empty.", field))]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },

    /// An identity field contained characters that cannot appear in a container name or image reference.
    #[snafu(display(
        "Field '{}' has invalid value '{}': whitespace, '/' and ':' are not allowed.",
        field,
        value
    ))]
    InvalidIdentity {
        /// Name of the offending field.
        field: &'static str,

        /// The rejected value.
        value: String,
    },

    /// A health check parameter was zero.
    #[snafu(display("Health check '{}' must be greater than zero.", field))]
    InvalidHealthCheck {
        /// Name of the offending parameter.
        field: &'static str,
    },

    /// The profile requires the system credentials, but they were not declared.
    #[snafu(display(
        "Profile '{}' requires both 'system_access_key' and 'system_secret_key' to be set.",
        profile
    ))]
    MissingCredentials {
        /// Name of the profile.
        profile: &'static str,
    },

    /// The proxy routes could not be aggregated.
    #[snafu(display("Invalid proxy routes: {}", source))]
    Routing {
        /// The underlying routing error.
        source: RoutingError,
    },

    /// A proxy configuration was rendered without a routing document.
    #[snafu(display("Proxy configuration requires a routing document."))]
    MissingRoutingDocument,
}

/// An opaque secret value.
///
/// The wrapped value is never printed by `Debug` or `Display`.
#[derive(Clone, Eq, PartialEq)]
pub struct Secret(String);

impl Secret {
    /// Creates a new `Secret`.
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        PermissiveString::deserialize_as(deserializer).map(Secret)
    }
}

/// Health check declaration, in whole seconds.
#[derive(Clone, Debug, Deserialize)]
pub struct HealthCheckDeclaration {
    /// Seconds between two probe runs.
    pub interval: u64,

    /// Seconds after which a single probe run is considered failed.
    pub timeout: u64,

    /// Consecutive failures before the container is reported unhealthy.
    pub retries: u32,

    /// Shell command overriding the profile's probe.
    #[serde(default)]
    pub command: Option<String>,
}

/// An additional bind mount.
#[derive(Clone, Debug, Deserialize)]
pub struct MountDeclaration {
    /// Host path, relative paths resolve against the service working directory.
    pub host: PathBuf,

    /// Path inside the container.
    pub container: String,
}

/// A link to another container.
#[derive(Clone, Debug, Deserialize)]
pub struct LinkDeclaration {
    /// Name of the linked container.
    pub container: String,

    /// Alias under which the linked container is reachable.
    #[serde(default)]
    pub alias: Option<String>,
}

/// A service declaration, as read from the service file.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceDeclaration {
    /// Service title.
    #[serde_as(as = "PermissiveString")]
    pub title: String,

    /// Tenant the service belongs to.
    #[serde_as(as = "PermissiveString")]
    pub tenant: String,

    /// Image version.
    #[serde_as(as = "PermissiveString")]
    pub version: String,

    /// Memory limit of the container.
    #[serde(default)]
    pub memory: Option<ByteSize>,

    /// Container hostname. Defaults to the title.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Network to attach to. Defaults to the tenant.
    #[serde(default)]
    pub network: Option<String>,

    /// Host address that exported ports bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port the service listens on inside the container.
    pub port: u16,

    /// Whether the service's ports are published on the host.
    #[serde_as(as = "PermissiveBool")]
    #[serde(default)]
    pub export: bool,

    /// Access key of the service's system account.
    #[serde_as(as = "Option<PermissiveString>")]
    pub system_access_key: Option<String>,

    /// Secret key of the service's system account.
    #[serde(default)]
    pub system_secret_key: Option<Secret>,

    /// Engine health check parameters.
    pub health_check: HealthCheckDeclaration,

    /// Seconds the health gate may wait before giving up.
    #[serde(default)]
    pub health_gate_timeout: Option<u64>,

    /// Maximum restart attempts of the on-failure restart policy.
    #[serde(default = "default_restart_max_retries")]
    pub restart_max_retries: u32,

    /// Bind mounts appended after the profile's own.
    #[serde(default)]
    pub mounts: Vec<MountDeclaration>,

    /// Links to other containers.
    #[serde(default)]
    pub links: Vec<LinkDeclaration>,

    /// Environment variables appended after the profile's own.
    #[serde_as(as = "BTreeMap<_, PermissiveString>")]
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Service profile.
    pub profile: Profile,
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_restart_max_retries() -> u32 {
    DEFAULT_RESTART_MAX_RETRIES
}

/// Identity of a service.
///
/// The container name and image reference are derived from the identity alone, so repeated invocations always target
/// the same container and image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceIdentity {
    tenant: String,
    title: String,
    version: String,
}

impl ServiceIdentity {
    /// Creates a new `ServiceIdentity`.
    ///
    /// # Errors
    ///
    /// If any field is empty, or contains whitespace, `/` or `:`, an error is returned.
    pub fn new<T, N, V>(tenant: T, title: N, version: V) -> Result<Self, SpecError>
    where
        T: Into<String>,
        N: Into<String>,
        V: Into<String>,
    {
        let identity = Self {
            tenant: tenant.into(),
            title: title.into(),
            version: version.into(),
        };

        for (field, value) in [
            ("tenant", &identity.tenant),
            ("title", &identity.title),
            ("version", &identity.version),
        ] {
            ensure!(!value.is_empty(), EmptyField { field });
            ensure!(
                !value.chars().any(|c| c.is_whitespace() || c == '/' || c == ':'),
                InvalidIdentity {
                    field,
                    value: value.clone()
                }
            );
        }

        Ok(identity)
    }

    /// Returns the tenant.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Returns the title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the container name, `tenant-title`.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.tenant, self.title)
    }

    /// Returns the image reference, `tenant/title:version`.
    pub fn image_reference(&self) -> String {
        format!("{}/{}:{}", self.tenant, self.title, self.version)
    }
}

/// Credentials of the service's system account.
#[derive(Clone, Debug)]
pub struct SystemCredentials {
    /// Access key.
    pub access_key: String,

    /// Secret key.
    pub secret_key: Secret,
}

/// Validated health check settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HealthSettings {
    /// Time between two probe runs.
    pub interval: Duration,

    /// Time after which a single probe run is considered failed.
    pub timeout: Duration,

    /// Consecutive failures before the container is reported unhealthy.
    pub retries: u32,

    /// Shell command overriding the profile's probe.
    pub command: Option<String>,
}

/// An immutable, validated view of one service.
#[derive(Clone, Debug)]
pub struct ServiceSpec {
    identity: ServiceIdentity,
    workdir: PathBuf,
    hostname: String,
    network: String,
    memory: Option<ByteSize>,
    host: IpAddr,
    port: u16,
    export: bool,
    credentials: Option<SystemCredentials>,
    health: HealthSettings,
    health_gate_timeout: Option<Duration>,
    restart_max_retries: u32,
    mounts: Vec<Mount>,
    links: Vec<Link>,
    environment: BTreeMap<String, String>,
    profile: Profile,
}

impl ServiceSpec {
    /// Validates a declaration into a `ServiceSpec`.
    ///
    /// `workdir` is the service working directory: it is the image build context, the parent of the generated
    /// directories, and the base that relative host paths resolve against.
    ///
    /// # Errors
    ///
    /// If a required field is empty, a health check parameter is zero, or the profile is missing something it needs,
    /// an error is returned.
    pub fn from_declaration<P>(declaration: ServiceDeclaration, workdir: P) -> Result<Self, SpecError>
    where
        P: AsRef<Path>,
    {
        let workdir = workdir.as_ref().to_path_buf();
        let identity = ServiceIdentity::new(declaration.tenant, declaration.title, declaration.version)?;

        let health = &declaration.health_check;
        ensure!(health.interval > 0, InvalidHealthCheck { field: "interval" });
        ensure!(health.timeout > 0, InvalidHealthCheck { field: "timeout" });
        ensure!(health.retries > 0, InvalidHealthCheck { field: "retries" });
        let health = HealthSettings {
            interval: Duration::from_secs(health.interval),
            timeout: Duration::from_secs(health.timeout),
            retries: health.retries,
            command: health.command.clone().filter(|command| !command.trim().is_empty()),
        };

        let credentials = match (declaration.system_access_key, declaration.system_secret_key) {
            (Some(access_key), Some(secret_key)) if !access_key.is_empty() && !secret_key.expose().is_empty() => {
                Some(SystemCredentials { access_key, secret_key })
            }
            _ => None,
        };

        let profile = declaration.profile.resolve(&workdir)?;
        if profile.requires_credentials() {
            ensure!(
                credentials.is_some(),
                MissingCredentials {
                    profile: profile.kind()
                }
            );
        }

        let mounts = declaration
            .mounts
            .into_iter()
            .map(|mount| Mount::new(resolve_path(&workdir, &mount.host), mount.container))
            .collect();

        let mut links = Vec::with_capacity(declaration.links.len());
        for link in declaration.links {
            ensure!(!link.container.is_empty(), EmptyField { field: "links.container" });
            links.push(Link {
                alias: link.alias.unwrap_or_else(|| link.container.clone()),
                container: link.container,
            });
        }

        Ok(Self {
            hostname: non_empty_or(declaration.hostname, identity.title()),
            network: non_empty_or(declaration.network, identity.tenant()),
            identity,
            workdir,
            memory: declaration.memory,
            host: declaration.host,
            port: declaration.port,
            export: declaration.export,
            credentials,
            health,
            health_gate_timeout: declaration.health_gate_timeout.map(Duration::from_secs),
            restart_max_retries: declaration.restart_max_retries,
            mounts,
            links,
            environment: declaration.environment,
            profile,
        })
    }

    /// Returns the service identity.
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Returns the container name.
    pub fn container_name(&self) -> String {
        self.identity.container_name()
    }

    /// Returns the image reference.
    pub fn image_reference(&self) -> String {
        self.identity.image_reference()
    }

    /// Returns the service working directory.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Returns the directory holding rendered configuration.
    pub fn conf_dir(&self) -> PathBuf {
        self.workdir.join("conf.d")
    }

    /// Returns the directory holding service data.
    pub fn data_dir(&self) -> PathBuf {
        self.workdir.join("data.d")
    }

    /// Returns the directory holding backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.workdir.join("back.d")
    }

    /// Returns the directory holding initialization scripts.
    pub fn init_dir(&self) -> PathBuf {
        self.workdir.join("init.d")
    }

    /// Returns the path of the deploy lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.workdir.join(format!(".{}.lock", self.container_name()))
    }

    /// Returns the container port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the system account credentials, if declared.
    pub fn credentials(&self) -> Option<&SystemCredentials> {
        self.credentials.as_ref()
    }

    /// Returns the health check settings.
    pub fn health(&self) -> &HealthSettings {
        &self.health
    }

    /// Returns the declared bound on the health gate, if any.
    pub fn health_gate_timeout(&self) -> Option<Duration> {
        self.health_gate_timeout
    }

    /// Returns the service profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Builds the routing document of a proxy service.
    ///
    /// Returns `None` for profiles that do not route traffic.
    ///
    /// # Errors
    ///
    /// If the declared routes are invalid, an error is returned.
    pub fn routing_document(&self) -> Result<Option<RoutingDocument>, SpecError> {
        match &self.profile {
            Profile::Proxy(proxy) => proxy.routing_document().map(Some).context(Routing),
            _ => Ok(None),
        }
    }

    /// Directories that must exist before the container is created.
    pub fn required_directories(&self) -> Vec<PathBuf> {
        self.profile
            .directories()
            .iter()
            .map(|name| self.workdir.join(name))
            .collect()
    }

    /// Shell command the engine runs to probe the container's health.
    pub fn health_probe(&self) -> HealthProbe {
        let command = self
            .health
            .command
            .clone()
            .unwrap_or_else(|| self.profile.probe_command(self.port));

        HealthProbe {
            command,
            interval: self.health.interval,
            timeout: self.health.timeout,
            retries: self.health.retries,
        }
    }

    /// Command executed once the container is first reported healthy.
    pub fn init_command(&self) -> Option<Vec<String>> {
        self.profile.init_command(self.credentials.as_ref())
    }

    /// Assembles the container creation request.
    pub fn container_request(&self) -> ContainerRequest {
        let mut mounts = self.profile.mounts(self);
        mounts.extend(self.mounts.iter().cloned());

        let mut environment = self.profile.environment();
        environment.extend(
            self.environment
                .iter()
                .map(|(key, value)| format!("{}={}", key, value)),
        );

        let ports = if self.export {
            std::iter::once(self.port)
                .chain(self.profile.extra_ports().iter().copied())
                .map(|port| PortBinding {
                    container_port: port,
                    host_ip: self.host,
                    host_port: port,
                })
                .collect()
        } else {
            Vec::new()
        };

        ContainerRequest {
            name: self.container_name(),
            image: self.image_reference(),
            hostname: self.hostname.clone(),
            network: self.network.clone(),
            memory_limit: self.memory.map(|memory| memory.as_u64()),
            mounts,
            links: self.links.clone(),
            ports,
            environment,
            health_probe: self.health_probe(),
            restart_policy: RestartPolicy::OnFailure {
                max_retries: self.restart_max_retries,
            },
        }
    }
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    value
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

pub(crate) fn resolve_path(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}
