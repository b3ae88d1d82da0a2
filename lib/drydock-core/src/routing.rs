//! Reverse proxy route aggregation.

use indexmap::IndexMap;
use serde::Deserialize;
use snafu::{ensure, OptionExt as _, Snafu};

/// Route aggregation errors.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RoutingError {
    /// No static asset route was given.
    #[snafu(display("A static asset route is required."))]
    MissingStaticRoute,

    /// A route had an empty location path.
    #[snafu(display("Route '{}' has an empty location path.", route))]
    EmptyLocation {
        /// Upstream name of the route, or `static` for the static asset route.
        route: String,
    },

    /// A route had an empty upstream name.
    #[snafu(display("Route for location '{}' has an empty upstream name.", location))]
    EmptyUpstream {
        /// Location path of the route.
        location: String,
    },

    /// A route had an empty upstream endpoint.
    #[snafu(display("Upstream '{}' has an empty endpoint.", upstream))]
    EmptyEndpoint {
        /// Upstream name of the route.
        upstream: String,
    },

    /// A backend reused the authentication gateway's upstream name.
    #[snafu(display("Backend '{}' reuses the authentication upstream '{}'.", location, upstream))]
    AuthUpstreamReused {
        /// Location path of the backend route.
        location: String,

        /// Upstream name shared with the authentication gateway.
        upstream: String,
    },
}

/// A route proxied to a named upstream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteSpec {
    /// Location path matched by the proxy.
    pub location: String,

    /// Name of the upstream block.
    pub upstream: String,

    /// Endpoint of the upstream, as `host:port`.
    pub endpoint: String,
}

impl RouteSpec {
    /// Creates a new `RouteSpec`.
    pub fn new<L, U, E>(location: L, upstream: U, endpoint: E) -> Self
    where
        L: Into<String>,
        U: Into<String>,
        E: Into<String>,
    {
        Self {
            location: location.into(),
            upstream: upstream.into(),
            endpoint: endpoint.into(),
        }
    }

    fn validate(&self) -> Result<(), RoutingError> {
        ensure!(
            !self.upstream.is_empty(),
            EmptyUpstream {
                location: self.location.clone()
            }
        );
        ensure!(
            !self.location.is_empty(),
            EmptyLocation {
                route: self.upstream.clone()
            }
        );
        ensure!(
            !self.endpoint.is_empty(),
            EmptyEndpoint {
                upstream: self.upstream.clone()
            }
        );
        Ok(())
    }
}

/// The catch-all route serving static assets.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StaticRoute {
    /// Location path matched by the proxy.
    pub location: String,
}

/// One entry of a routing document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Route {
    /// The authentication gateway.
    Auth(RouteSpec),

    /// A backend service.
    Backend(RouteSpec),

    /// The static asset fallback.
    Static(StaticRoute),
}

/// An ordered set of proxy routes and the upstreams they refer to.
///
/// Routes are ordered as follows: the authentication gateway (when present), then backends in declaration order, then
/// the static asset route, which is always last. Proxies pick the first matching location, so this order is significant.
///
/// Upstream names are unique. When a name is declared more than once, the last declaration wins but keeps the position
/// of the first one. Backends may share an upstream. Backend locations are unique in the same way as upstream names.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutingDocument {
    routes: Vec<Route>,
    upstreams: IndexMap<String, String>,
}

impl RoutingDocument {
    /// Aggregates routes into a `RoutingDocument`.
    ///
    /// # Errors
    ///
    /// If `static_route` is absent, any route has an empty location, upstream name or endpoint, or a backend reuses the
    /// authentication gateway's upstream name, an error is returned.
    pub fn aggregate<I>(
        auth: Option<RouteSpec>, backends: I, static_route: Option<StaticRoute>,
    ) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = RouteSpec>,
    {
        let static_route = static_route.context(MissingStaticRoute)?;
        ensure!(
            !static_route.location.is_empty(),
            EmptyLocation {
                route: "static".to_string()
            }
        );

        let mut upstreams = IndexMap::new();

        if let Some(auth) = &auth {
            auth.validate()?;
            upstreams.insert(auth.upstream.clone(), auth.endpoint.clone());
        }

        let mut backend_routes: IndexMap<String, RouteSpec> = IndexMap::new();
        for backend in backends {
            backend.validate()?;
            if let Some(auth) = &auth {
                ensure!(
                    backend.upstream != auth.upstream,
                    AuthUpstreamReused {
                        location: backend.location.clone(),
                        upstream: backend.upstream.clone(),
                    }
                );
            }

            // `IndexMap::insert` replaces the value in place, keeping the original position.
            upstreams.insert(backend.upstream.clone(), backend.endpoint.clone());
            backend_routes.insert(backend.location.clone(), backend);
        }

        let mut routes = Vec::with_capacity(backend_routes.len() + 2);
        routes.extend(auth.map(Route::Auth));
        routes.extend(backend_routes.into_values().map(Route::Backend));
        routes.push(Route::Static(static_route));

        Ok(Self { routes, upstreams })
    }

    /// Returns the routes, in rendering order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Returns the upstream table as `(name, endpoint)` pairs, in rendering order.
    pub fn upstreams(&self) -> impl Iterator<Item = (&str, &str)> {
        self.upstreams
            .iter()
            .map(|(name, endpoint)| (name.as_str(), endpoint.as_str()))
    }

    /// Looks up the endpoint of an upstream.
    pub fn upstream(&self, name: &str) -> Option<&str> {
        self.upstreams.get(name).map(String::as_str)
    }
}
