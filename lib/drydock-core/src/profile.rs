//! Service profiles.
//!
//! A profile carries what differs between the kinds of services drydock deploys: the directories it needs, how the
//! container is mounted and probed, which configuration file is rendered for it, and which command initializes it once
//! it first becomes healthy.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::ensure;

use crate::{
    engine::Mount,
    routing::{RouteSpec, RoutingDocument, RoutingError, StaticRoute},
    service::{resolve_path, EmptyField, Secret, ServiceSpec, SpecError, SystemCredentials},
};

const SEARCH_USERS_BIN: &str = "/usr/share/elasticsearch/bin/elasticsearch-users";
const IDENTITY_INIT_SCRIPT: &str = "/init.d/init.sh";
const IDENTITY_MONITORING_PORT: u16 = 9000;
const IDENTITY_PROBE: &str = "exec 3<>/dev/tcp/127.0.0.1/8080;echo -e \"GET /health/ready HTTP/1.1\\r\\nhost: http://localhost\\r\\nConnection: close\\r\\n\\r\\n\" >&3; grep \"HTTP/1.1 200 OK\" <&3";
const PROXY_PROBE: &str = "curl -kv https://127.0.0.1 || exit 1";

/// Database connection of the identity provider.
#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseDeclaration {
    /// Database host.
    pub hostname: String,

    /// Database port.
    pub hostport: u16,

    /// Database user.
    pub username: String,

    /// Database password.
    pub password: Secret,

    /// Database name.
    pub database: String,
}

/// Identity provider settings.
#[derive(Clone, Debug, Deserialize)]
pub struct IdentityProfile {
    /// Public domain the identity provider is served under.
    pub domain: String,

    /// Realm provisioned on first start.
    pub realm: String,

    /// Bootstrap administrator name.
    pub master_username: String,

    /// Bootstrap administrator password.
    pub master_password: Secret,

    /// Realm administrator name.
    pub admin_username: String,

    /// Realm administrator password.
    pub admin_password: Secret,

    /// Database connection.
    pub database: DatabaseDeclaration,
}

/// Authentication gateway route of the proxy.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthDeclaration {
    /// Location path.
    pub location: String,

    /// Upstream endpoint, as `host:port`.
    pub endpoint: String,

    /// Upstream name.
    #[serde(default = "default_auth_upstream")]
    pub upstream: String,
}

fn default_auth_upstream() -> String {
    "auth".to_string()
}

/// Backend route of the proxy.
#[derive(Clone, Debug, Deserialize)]
pub struct BackendDeclaration {
    /// Location path. Defaults to `/<upstream>/`.
    #[serde(default)]
    pub location: Option<String>,

    /// Upstream name.
    pub upstream: String,

    /// Upstream endpoint, as `host:port`.
    pub endpoint: String,
}

/// Static asset settings of the proxy.
#[derive(Clone, Debug, Deserialize)]
pub struct PublishDeclaration {
    /// Location path.
    pub location: String,

    /// Host directory holding `webroot/` and `webcert/`.
    pub endpoint: PathBuf,
}

/// Reverse proxy settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyProfile {
    /// Server name of the virtual host.
    pub server_name: String,

    /// Authentication gateway.
    #[serde(default)]
    pub auth: Option<AuthDeclaration>,

    /// Backends, in declaration order.
    #[serde(default)]
    pub backends: Vec<BackendDeclaration>,

    /// Static assets.
    #[serde(default)]
    pub publish: Option<PublishDeclaration>,
}

impl ProxyProfile {
    /// Aggregates the declared routes.
    ///
    /// # Errors
    ///
    /// If the publish route is missing, or a route is invalid, an error is returned.
    pub fn routing_document(&self) -> Result<RoutingDocument, RoutingError> {
        let auth = self
            .auth
            .as_ref()
            .map(|auth| RouteSpec::new(&auth.location, &auth.upstream, &auth.endpoint));
        let backends = self.backends.iter().map(|backend| {
            let location = backend
                .location
                .clone()
                .unwrap_or_else(|| format!("/{}/", backend.upstream));
            RouteSpec::new(location, &backend.upstream, &backend.endpoint)
        });
        let static_route = self.publish.as_ref().map(|publish| StaticRoute {
            location: publish.location.clone(),
        });

        RoutingDocument::aggregate(auth, backends, static_route)
    }
}

/// Service profile.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Profile {
    /// Document search engine.
    Search,

    /// Identity provider.
    Identity(IdentityProfile),

    /// Reverse proxy.
    Proxy(ProxyProfile),
}

impl Profile {
    /// Returns the profile name.
    pub fn kind(&self) -> &'static str {
        match self {
            Profile::Search => "search",
            Profile::Identity(_) => "identity",
            Profile::Proxy(_) => "proxy",
        }
    }

    pub(crate) fn resolve(mut self, workdir: &Path) -> Result<Self, SpecError> {
        match &mut self {
            Profile::Search => {}
            Profile::Identity(identity) => {
                ensure!(!identity.domain.is_empty(), EmptyField { field: "profile.domain" });
                ensure!(!identity.realm.is_empty(), EmptyField { field: "profile.realm" });
            }
            Profile::Proxy(proxy) => {
                ensure!(
                    !proxy.server_name.is_empty(),
                    EmptyField {
                        field: "profile.server_name"
                    }
                );
                if let Some(publish) = proxy.publish.as_mut() {
                    publish.endpoint = resolve_path(workdir, &publish.endpoint);
                }
            }
        }
        Ok(self)
    }

    pub(crate) fn requires_credentials(&self) -> bool {
        matches!(self, Profile::Search)
    }

    pub(crate) fn directories(&self) -> &'static [&'static str] {
        match self {
            Profile::Search | Profile::Identity(_) => &["conf.d", "data.d", "back.d"],
            Profile::Proxy(_) => &["conf.d"],
        }
    }

    /// Name of the file rendered into `conf.d`, if the profile renders one.
    pub fn config_file_name(&self) -> Option<&'static str> {
        match self {
            Profile::Search => None,
            Profile::Identity(_) => Some("keycloak.conf"),
            Profile::Proxy(_) => Some("nginx.conf"),
        }
    }

    pub(crate) fn mounts(&self, spec: &ServiceSpec) -> Vec<Mount> {
        match self {
            Profile::Search => vec![
                Mount::new(spec.conf_dir(), "/conf.d"),
                Mount::new(spec.data_dir(), "/usr/share/elasticsearch/data"),
                Mount::new(spec.backup_dir(), "/back.d"),
            ],
            Profile::Identity(_) => vec![
                Mount::new(spec.init_dir(), "/init.d"),
                Mount::new(spec.conf_dir().join("keycloak.conf"), "/opt/keycloak/conf/keycloak.conf"),
                Mount::new(spec.data_dir(), "/data.d"),
                Mount::new(spec.backup_dir(), "/back.d"),
            ],
            Profile::Proxy(proxy) => {
                let mut mounts = vec![Mount::new(spec.conf_dir().join("nginx.conf"), "/etc/nginx/nginx.conf")];
                if let Some(publish) = &proxy.publish {
                    mounts.push(Mount::new(publish.endpoint.clone(), "/publish"));
                }
                mounts
            }
        }
    }

    pub(crate) fn environment(&self) -> Vec<String> {
        match self {
            Profile::Search => vec!["discovery.type=single-node".to_string()],
            Profile::Identity(identity) => vec![
                format!("KEYCLOAK_ADMIN={}", identity.master_username),
                format!("KEYCLOAK_ADMIN_PASSWORD={}", identity.master_password.expose()),
                "KC_HEALTH_ENABLED=true".to_string(),
            ],
            Profile::Proxy(_) => Vec::new(),
        }
    }

    pub(crate) fn extra_ports(&self) -> &'static [u16] {
        match self {
            Profile::Identity(_) => &[IDENTITY_MONITORING_PORT],
            _ => &[],
        }
    }

    pub(crate) fn probe_command(&self, port: u16) -> String {
        match self {
            Profile::Search => format!("curl -k https://localhost:{} || exit 1", port),
            Profile::Identity(_) => IDENTITY_PROBE.to_string(),
            Profile::Proxy(_) => PROXY_PROBE.to_string(),
        }
    }

    pub(crate) fn init_command(&self, credentials: Option<&SystemCredentials>) -> Option<Vec<String>> {
        match self {
            Profile::Search => credentials.map(|credentials| {
                vec![
                    SEARCH_USERS_BIN.to_string(),
                    "useradd".to_string(),
                    credentials.access_key.clone(),
                    "-p".to_string(),
                    credentials.secret_key.expose().to_string(),
                    "-r".to_string(),
                    "superuser".to_string(),
                    "-s".to_string(),
                ]
            }),
            Profile::Identity(identity) => Some(vec![
                IDENTITY_INIT_SCRIPT.to_string(),
                identity.domain.clone(),
                identity.realm.clone(),
                identity.master_username.clone(),
                identity.master_password.expose().to_string(),
                identity.admin_username.clone(),
                identity.admin_password.expose().to_string(),
            ]),
            Profile::Proxy(_) => None,
        }
    }
}
