//! Shared test utilities for kube-image-cacher integration tests.

use kube_image_cacher::audit::AdmissionAuditLogger;
use kube_image_cacher::engine::TransferOrchestrator;
use kube_image_cacher::registry::{CredentialCache, RepositoryProvisioner};
use kube_image_cacher::rest::{AppState, create_router};
use kube_image_cacher::test_util::{FakeEngine, FakeRegistryControl};
use kube_image_cacher::{AdmissionAdapter, FailurePolicy, MirrorRegistry, MutationPipeline};
use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const MIRROR: &str = "cache.example.com";

/// Test server wrapper that runs the webhook router against in-memory fakes.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub control: Arc<FakeRegistryControl>,
    pub engine: Arc<FakeEngine>,
    /// Admission shutdown token; cancelling it makes the webhook unready.
    pub admissions: CancellationToken,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    /// Spawn a webhook with the given failure policy.
    pub async fn spawn(policy: FailurePolicy) -> Self {
        let control = Arc::new(FakeRegistryControl::new());
        let engine = Arc::new(FakeEngine::new());

        let pipeline = MutationPipeline::new(
            MirrorRegistry::parse(MIRROR).expect("Invalid mirror"),
            Arc::new(CredentialCache::new(control.clone())),
            RepositoryProvisioner::new(control.clone()),
            TransferOrchestrator::new(engine.clone()),
        );

        // Create app state with noop audit logger
        let audit = Arc::new(AdmissionAuditLogger::new_noop());
        let admissions = CancellationToken::new();
        let adapter = AdmissionAdapter::new(
            Arc::new(pipeline),
            policy,
            Duration::from_secs(25),
            admissions.clone(),
            audit.clone(),
        );
        let router = create_router(Arc::new(AppState {
            adapter: Arc::new(adapter),
            audit,
        }));

        // Use port 0 to let OS choose available port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            client: Client::new(),
            control,
            engine,
            admissions,
            shutdown_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Perform a GET request.
    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request with JSON body.
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request with a raw body.
    pub async fn post_raw(&self, path: &str, body: &'static str) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
