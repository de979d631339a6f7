//! Container engine access and the image transfer built on top of it.
//!
//! The engine reports progress of pulls and pushes as newline-delimited JSON.
//! Terminal failures are only reported in-band, as the last line of that
//! stream, so callers must drain every stream to its end.

pub mod docker;
pub mod transfer;

pub use docker::DockerEngine;
pub use transfer::{StreamSummary, TransferOrchestrator, TransferOutcome};

use std::fmt;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

use crate::reference::ImageReference;
use crate::registry::Credential;

/// Lines of an engine progress stream.
pub type ProgressStream = BoxStream<'static, Result<String, EngineError>>;

/// Errors talking to the container engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine could not be reached.
    #[error("engine connection failed: {0}")]
    Connection(String),

    /// The engine answered with a non-success status.
    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The progress stream broke off.
    #[error("progress stream failed: {0}")]
    Stream(String),

    #[error("invalid engine request: {0}")]
    InvalidRequest(String),
}

/// Registry credentials in the shape the engine expects in `X-Registry-Auth`.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    #[serde(rename = "serveraddress")]
    pub server_address: String,
}

impl RegistryAuth {
    pub fn new(credential: &Credential, server_address: &str) -> Self {
        Self {
            username: credential.username.clone(),
            password: credential.password.clone(),
            server_address: server_address.to_string(),
        }
    }

    /// URL-safe base64 of the JSON document, the engine's header format.
    pub fn encode(&self) -> String {
        // Serializing three strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE.encode(json)
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("server_address", &self.server_address)
            .finish()
    }
}

/// The pull, tag and push operations of a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Start pulling `image`; the returned stream carries pull progress.
    async fn pull(&self, image: &ImageReference) -> Result<ProgressStream, EngineError>;

    /// Tag the local image `source` as `target`.
    async fn tag(&self, source: &ImageReference, target: &ImageReference)
    -> Result<(), EngineError>;

    /// Start pushing `image`; the returned stream carries push progress.
    async fn push(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<ProgressStream, EngineError>;
}
