//! Deployment control for single-container services.
//!
//! A service is described by a [`ServiceSpec`]. The [`Orchestrator`] builds its image and deploys it: the service's
//! configuration is rendered, one named container is launched, and once the engine reports it healthy a one-time
//! initialization command runs. [`Lifecycle`] covers everything that acts on containers that already exist.
//!
//! The container engine itself sits behind the [`ContainerEngine`] trait.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod deser;
pub mod engine;
pub mod lifecycle;
pub mod lock;
pub mod orchestrator;
pub mod profile;
pub mod render;
pub mod routing;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use self::engine::{ContainerEngine, EngineError};
pub use self::lifecycle::{Lifecycle, LifecycleError, LifecycleOutcome};
pub use self::orchestrator::{DeployError, DeployOptions, DeployReport, DeploymentState, Orchestrator};
pub use self::service::{ServiceDeclaration, ServiceSpec, SpecError};
