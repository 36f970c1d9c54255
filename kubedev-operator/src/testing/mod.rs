//! In-memory test doubles for the operator.
//!
//! Lets the reconciler, queue and worker pool run end to end without a
//! cluster. Time is virtual via [`MockClock`].
//!
//! # Example
//!
//! ```ignore
//! use kubedev_operator::client::ObjectKind;
//! use kubedev_operator::testing::{TestHarness, sample_spec};
//!
//! #[tokio::test]
//! async fn provisions() {
//!     let h = TestHarness::new();
//!     let key = h.store.create("kubedev", "env1", sample_spec("u1"));
//!     h.reconciler.reconcile(&key).await.unwrap();
//!     assert!(h.cluster.contains(ObjectKind::Namespace, "ws-u1-env1", "ws-u1-env1"));
//! }
//! ```

pub mod cluster;
pub mod harness;
pub mod store;

pub use crate::retry::MockClock;
pub use cluster::{ClusterCall, FakeCluster, Verb};
pub use harness::TestHarness;
pub use store::InMemoryStore;

use crate::crd::DevEnvironmentSpec;

/// Minimal valid spec: `base:latest`, port 8080, 5Gi of storage.
pub fn sample_spec(owner: &str) -> DevEnvironmentSpec {
    DevEnvironmentSpec {
        owner: owner.to_string(),
        git_repository: None,
        git_ref: None,
        image: "base:latest".to_string(),
        init_commands: vec![],
        start_command: None,
        ports: vec![8080],
        resource_limits: None,
        storage_size: Some("5Gi".to_string()),
        env: Default::default(),
        suspended: false,
        restart_nonce: None,
    }
}
