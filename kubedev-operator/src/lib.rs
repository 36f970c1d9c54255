//! kubedev Kubernetes operator
//!
//! Provisions per-user development workspaces. Each `DevEnvironment`
//! resource is projected into its own namespace holding a resource quota,
//! a persistent volume claim, a workspace deployment, a service and an
//! ingress, and its status reports the phase and the access URL.
//!
//! # Custom Resource Definitions
//!
//! - **DevEnvironment**: one user's workspace
//!
//! # Example
//!
//! ```yaml
//! apiVersion: kubedev.io/v1
//! kind: DevEnvironment
//! metadata:
//!   name: env1
//!   namespace: kubedev
//! spec:
//!   owner: u1
//!   image: ghcr.io/acme/ide:latest
//!   gitRepository: https://github.com/acme/app.git
//!   ports: [8080]
//!   storageSize: 10Gi
//! ```
//!
//! # Layout
//!
//! - [`watcher`] turns watch events into [`queue`] entries
//! - [`runtime`] drains the queue with a pool of workers
//! - [`controller`] converges one environment per call, using [`builder`]
//!   for the desired objects, [`client`] for the cluster and [`status`]
//!   for reporting

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
pub mod builder;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod naming;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod store;
pub mod testing;
pub mod watcher;

pub use config::OperatorConfig;
pub use crd::{DevEnvironment, DevEnvironmentSpec, DevEnvironmentStatus, EnvironmentKey, Phase};
pub use error::{ClientError, OperatorError, OperatorResult, ValidationError};
