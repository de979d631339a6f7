//! Docker Engine API client over the daemon's unix socket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyDataStream, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::form_urlencoded;

use super::{ContainerEngine, EngineError, ProgressStream, RegistryAuth};
use crate::reference::ImageReference;

pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Error body returned by the engine on non-success statuses.
#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

pub struct DockerEngine {
    socket: PathBuf,
    client: Client<UnixConnector, Empty<Bytes>>,
}

impl DockerEngine {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            socket: socket.into(),
            client,
        }
    }

    /// Build a client from a `DOCKER_HOST` style address. Only `unix://` is supported.
    pub fn from_host(host: &str) -> Result<Self, EngineError> {
        let socket = host.strip_prefix("unix://").ok_or_else(|| {
            EngineError::InvalidRequest(format!(
                "unsupported docker host '{host}', expected unix://<path>"
            ))
        })?;
        if socket.is_empty() {
            return Err(EngineError::InvalidRequest(
                "docker host has an empty socket path".to_string(),
            ));
        }
        Ok(Self::new(socket))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn post(
        &self,
        path_and_query: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<Response<Incoming>, EngineError> {
        let uri = hyperlocal::Uri::new(&self.socket, path_and_query);

        let mut builder = Request::builder().method(Method::POST).uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(REGISTRY_AUTH_HEADER, auth.encode());
        }
        let req = builder
            .body(Empty::new())
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

        debug!(path = %path_and_query, "Docker API request");
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(api_error(resp).await)
        }
    }
}

async fn api_error(resp: Response<Incoming>) -> EngineError {
    let status = resp.status().as_u16();
    let message = match resp.into_body().collect().await {
        Ok(body) => {
            let bytes = body.to_bytes();
            serde_json::from_slice::<ApiMessage>(&bytes)
                .map(|m| m.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string())
        }
        Err(e) => e.to_string(),
    };
    EngineError::Api { status, message }
}

/// Split a streaming response body into lines.
fn progress_lines(resp: Response<Incoming>) -> ProgressStream {
    let body = BodyDataStream::new(resp.into_body()).map_err(std::io::Error::other);
    let reader = StreamReader::new(body);
    LinesStream::new(reader.lines())
        .map_err(|e| EngineError::Stream(e.to_string()))
        .boxed()
}

/// The engine wants a tag or digest for every pull, never an empty one.
fn tag_or_digest(image: &ImageReference) -> &str {
    image.digest().or(image.tag()).unwrap_or("latest")
}

fn query(pairs: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull(&self, image: &ImageReference) -> Result<ProgressStream, EngineError> {
        let name = image.name();
        let path = format!(
            "/images/create?{}",
            query(&[("fromImage", name.as_str()), ("tag", tag_or_digest(image))])
        );
        let resp = self.post(&path, None).await?;
        Ok(progress_lines(resp))
    }

    async fn tag(
        &self,
        source: &ImageReference,
        target: &ImageReference,
    ) -> Result<(), EngineError> {
        let repo = target.name();
        let path = format!(
            "/images/{}/tag?{}",
            source,
            query(&[("repo", repo.as_str()), ("tag", target.tag().unwrap_or("latest"))])
        );
        self.post(&path, None).await?;
        Ok(())
    }

    async fn push(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<ProgressStream, EngineError> {
        let path = format!(
            "/images/{}/push?{}",
            image.name(),
            query(&[("tag", image.tag().unwrap_or("latest"))])
        );
        let resp = self.post(&path, Some(auth)).await?;
        Ok(progress_lines(resp))
    }
}
