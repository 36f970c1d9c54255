//! Custom Resource Definitions for the kubedev operator.
//!
//! - [`DevEnvironment`]: one user's workspace, reconciled into a namespace,
//!   quota, volume claim, deployment, service and ingress.

mod dev_environment;

pub use dev_environment::{
    DevEnvironment, DevEnvironmentSpec, DevEnvironmentStatus, EnvironmentKey, Phase,
    ResourceLimits, FINALIZER,
};
