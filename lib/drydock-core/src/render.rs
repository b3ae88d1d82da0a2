//! Configuration rendering.
//!
//! Rendering is pure: the same service and routing document always produce byte-identical output, which keeps
//! redeploys idempotent. Writing the result to disk is left to the caller.

use std::path::PathBuf;

use snafu::OptionExt as _;

use crate::{
    profile::{IdentityProfile, Profile},
    routing::{Route, RoutingDocument},
    service::{MissingRoutingDocument, ServiceSpec, SpecError},
};

const NGINX_GLOBAL: &str = "user root;
worker_processes 1;

events {
    worker_connections 1024;
    multi_accept on;
    use epoll;
}

http {
    include mime.types;
    default_type application/octet-stream;
    sendfile on;
    keepalive_timeout 65;
    client_max_body_size 0;
    large_client_header_buffers 4 128k;
    ssl_certificate_key /publish/webcert/server.key;
    ssl_certificate /publish/webcert/server.crt;
    ssl_session_timeout 10m;
    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_ciphers HIGH:!aNULL:!MD5;
    ssl_prefer_server_ciphers on;
    proxy_buffers 4 256k;
    proxy_buffer_size 128k;
    proxy_busy_buffers_size 256k;
    proxy_http_version 1.1;
    proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    proxy_set_header Upgrade $http_upgrade;
    proxy_set_header Connection $http_connection;
";

const AUTH_HEADERS: &[&str] = &[
    "proxy_set_header Host $host;",
    "proxy_set_header X-Real-IP $remote_addr;",
    "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
    "proxy_set_header X-Forwarded-Host $host;",
    "proxy_set_header X-Forwarded-Proto $scheme;",
    "proxy_set_header X-Forwarded-Server $host;",
];

/// A rendered configuration file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RenderedConfig {
    file_name: &'static str,
    contents: String,
}

impl RenderedConfig {
    /// Returns the file name, relative to the service's configuration directory.
    pub fn file_name(&self) -> &'static str {
        self.file_name
    }

    /// Returns the file contents.
    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Returns the path the file is written to.
    pub fn host_path(&self, spec: &ServiceSpec) -> PathBuf {
        spec.conf_dir().join(self.file_name)
    }
}

/// Renders the configuration file of a service.
///
/// Returns `None` when the service's profile does not use a rendered file. Proxy services require `routing`.
///
/// # Errors
///
/// If the service is a proxy and no routing document is given, an error is returned.
pub fn render(spec: &ServiceSpec, routing: Option<&RoutingDocument>) -> Result<Option<RenderedConfig>, SpecError> {
    let Some(file_name) = spec.profile().config_file_name() else {
        return Ok(None);
    };

    let contents = match spec.profile() {
        Profile::Search => return Ok(None),
        Profile::Identity(identity) => render_identity(identity),
        Profile::Proxy(proxy) => {
            let routing = routing.context(MissingRoutingDocument)?;
            render_proxy(&proxy.server_name, routing)
        }
    };

    Ok(Some(RenderedConfig { file_name, contents }))
}

/// Renders a service together with its own routing document.
///
/// # Errors
///
/// If the service's routes are invalid, an error is returned.
pub fn render_service(spec: &ServiceSpec) -> Result<Option<RenderedConfig>, SpecError> {
    let routing = spec.routing_document()?;
    render(spec, routing.as_ref())
}

/// Renders the identity provider's `key=value` configuration.
pub fn render_identity(identity: &IdentityProfile) -> String {
    let database = &identity.database;
    let entries = [
        ("db", "postgres".to_string()),
        ("db-username", database.username.clone()),
        ("db-password", database.password.expose().to_string()),
        (
            "db-url",
            format!(
                "jdbc:postgresql://{}:{}/{}",
                database.hostname, database.hostport, database.database
            ),
        ),
        ("http-enabled", "true".to_string()),
        ("hostname", format!("https://{}/auth", identity.domain)),
        ("hostname-admin", format!("https://{}/auth", identity.domain)),
        ("hostname-strict", "false".to_string()),
        ("hostname-backchannel-dynamic", "true".to_string()),
        ("proxy-headers", "xforwarded".to_string()),
    ];

    entries
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect()
}

/// Renders the reverse proxy configuration.
///
/// The output holds the global directives, then a server block with one location per route in document order, then
/// one upstream block per upstream in table order.
pub fn render_proxy(server_name: &str, routing: &RoutingDocument) -> String {
    let mut out = String::from(NGINX_GLOBAL);

    out.push_str("\n    server {\n");
    out.push_str("        listen 443 ssl;\n");
    out.push_str(&format!("        server_name {};\n", server_name));

    for route in routing.routes() {
        out.push('\n');
        match route {
            Route::Auth(auth) => {
                out.push_str(&format!("        location {} {{\n", auth.location));
                for header in AUTH_HEADERS {
                    out.push_str(&format!("            {}\n", header));
                }
                out.push_str(&format!("            proxy_pass http://{}/;\n", auth.upstream));
            }
            Route::Backend(backend) => {
                out.push_str(&format!("        location {} {{\n", backend.location));
                out.push_str(&format!(
                    "            proxy_pass http://{}{};\n",
                    backend.upstream, backend.location
                ));
            }
            Route::Static(publish) => {
                out.push_str(&format!("        location {} {{\n", publish.location));
                out.push_str("            alias /publish/webroot/;\n");
            }
        }
        out.push_str("        }\n");
    }

    out.push_str("    }\n");

    for (name, endpoint) in routing.upstreams() {
        out.push_str(&format!("\n    upstream {} {{\n", name));
        out.push_str(&format!("        server {};\n", endpoint));
        out.push_str("    }\n");
    }

    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        routing::{RouteSpec, StaticRoute},
        testing::{declaration, identity_profile, proxy_profile},
    };

    fn spec(profile: serde_json::Value) -> ServiceSpec {
        ServiceSpec::from_declaration(declaration(profile), "/srv/acme").unwrap()
    }

    fn publish() -> Option<StaticRoute> {
        Some(StaticRoute {
            location: "/".to_string(),
        })
    }

    #[test]
    fn search_renders_nothing() {
        assert_eq!(render_service(&spec(json!({ "kind": "search" }))).unwrap(), None);
    }

    #[test]
    fn identity_configuration() {
        let rendered = render_service(&spec(identity_profile())).unwrap().unwrap();

        assert_eq!(rendered.file_name(), "keycloak.conf");
        assert_eq!(rendered.host_path(&spec(identity_profile())), PathBuf::from("/srv/acme/conf.d/keycloak.conf"));
        assert_eq!(
            rendered.contents(),
            "db=postgres
db-username=keycloak
db-password=dbpass
db-url=jdbc:postgresql://acme-db:5432/keycloak
http-enabled=true
hostname=https://id.acme.test/auth
hostname-admin=https://id.acme.test/auth
hostname-strict=false
hostname-backchannel-dynamic=true
proxy-headers=xforwarded
"
        );
    }

    #[test]
    fn proxy_configuration() {
        let rendered = render_service(&spec(proxy_profile())).unwrap().unwrap();
        let expected = format!(
            "{}
    server {{
        listen 443 ssl;
        server_name www.acme.test;

        location /auth/ {{
            proxy_set_header Host $host;
            proxy_set_header X-Real-IP $remote_addr;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            proxy_set_header X-Forwarded-Host $host;
            proxy_set_header X-Forwarded-Proto $scheme;
            proxy_set_header X-Forwarded-Server $host;
            proxy_pass http://auth/;
        }}

        location /api/ {{
            proxy_pass http://api/api/;
        }}

        location /files/ {{
            proxy_pass http://files/files/;
        }}

        location / {{
            alias /publish/webroot/;
        }}
    }}

    upstream auth {{
        server acme-identity:8080;
    }}

    upstream api {{
        server acme-api:8000;
    }}

    upstream files {{
        server acme-files:9000;
    }}
}}
",
            NGINX_GLOBAL
        );

        assert_eq!(rendered.file_name(), "nginx.conf");
        assert_eq!(rendered.contents(), expected);
    }

    #[test]
    fn proxy_without_auth_or_backends() {
        let routing = RoutingDocument::aggregate(None, Vec::new(), publish()).unwrap();
        let rendered = render_proxy("www.acme.test", &routing);

        assert!(!rendered.contains("proxy_set_header Host $host;"));
        assert!(!rendered.contains("upstream"));
        assert!(!rendered.contains("location  {"));
        assert!(rendered.contains("        location / {\n            alias /publish/webroot/;\n        }\n"));
    }

    #[test]
    fn proxy_requires_routing_document() {
        assert!(matches!(
            render(&spec(proxy_profile()), None),
            Err(SpecError::MissingRoutingDocument)
        ));
    }

    #[test]
    fn proxy_without_publish_is_rejected() {
        let mut profile = proxy_profile();
        profile.as_object_mut().unwrap().remove("publish");
        assert!(matches!(render_service(&spec(profile)), Err(SpecError::Routing { .. })));
    }

    proptest! {
        #[test]
        fn rendering_is_deterministic(
            with_auth in any::<bool>(),
            pairs in proptest::collection::vec(("[a-e]{1,3}", "[a-z]{1,8}:[0-9]{2,4}"), 0..10),
        ) {
            let build = || {
                let auth = with_auth.then(|| RouteSpec::new("/auth/", "auth", "identity:8080"));
                let backends = pairs
                    .iter()
                    .map(|(name, endpoint)| RouteSpec::new(format!("/{}/", name), name.as_str(), endpoint.as_str()));
                RoutingDocument::aggregate(auth, backends, publish()).unwrap()
            };

            let first = render_proxy("www.acme.test", &build());
            let second = render_proxy("www.acme.test", &build());
            prop_assert_eq!(&first, &second);

            // The static location is the last location of the server block.
            let static_at = first.find("alias /publish/webroot/;").unwrap();
            prop_assert!(first[static_at..].find("location ").is_none());
            prop_assert_eq!(first.contains("proxy_pass http://auth/;"), with_auth);
        }
    }
}
