//! Kubernetes mutating admission webhook that mirrors container images into a
//! private registry and rewrites pods to pull from it.

pub mod admission;
pub mod audit;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod reference;
pub mod registry;
pub mod rest;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use admission::AdmissionAdapter;
pub use audit::{AdmissionAuditLogger, create_audit_logger};
pub use config::{Config, FailurePolicy, RegistryConfig, RegistryProvider};
pub use context::RequestContext;
pub use error::{Error, MutationError, Stage, TransferStage};
pub use pipeline::MutationPipeline;
pub use reference::{ImageReference, MirrorRegistry, belongs_to_mirror};
