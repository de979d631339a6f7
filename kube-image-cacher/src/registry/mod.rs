//! Cloud registry control plane.
//!
//! The mirror registry is managed through three calls of its provider's
//! control API: describe a repository, create a repository and fetch an
//! authorization token. [`RegistryControl`] abstracts them so the pipeline
//! can run against ECR in production and an in-memory fake in tests.

pub mod credentials;
pub mod ecr;
pub mod provisioner;

pub use credentials::{Credential, CredentialCache};
pub use ecr::EcrControl;
pub use provisioner::RepositoryProvisioner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned by the registry control API.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    /// The repository does not exist.
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    /// The repository was created concurrently.
    #[error("repository already exists: {0}")]
    RepositoryAlreadyExists(String),

    /// Any other API failure (permissions, network, throttling).
    #[error("{0}")]
    Api(String),
}

/// Raw authorization data returned by the provider.
#[derive(Clone)]
pub struct AuthorizationToken {
    /// Base64 encoded `username:password`.
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Client of the cloud registry control API.
#[async_trait]
pub trait RegistryControl: Send + Sync {
    /// Check that `repository` exists.
    async fn describe_repository(&self, repository: &str) -> Result<(), ControlError>;

    /// Create `repository`.
    async fn create_repository(&self, repository: &str) -> Result<(), ControlError>;

    /// Fetch a fresh authorization token for the registry.
    async fn authorization_token(&self) -> Result<AuthorizationToken, ControlError>;
}
