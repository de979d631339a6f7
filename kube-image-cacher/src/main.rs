use anyhow::Context;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use rustls::crypto::{CryptoProvider, ring::default_provider};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kube_image_cacher::config::{Args, RegistryProvider};
use kube_image_cacher::engine::{DockerEngine, TransferOrchestrator};
use kube_image_cacher::registry::{
    CredentialCache, EcrControl, RegistryControl, RepositoryProvisioner,
};
use kube_image_cacher::rest::{AppState, create_router};
use kube_image_cacher::{AdmissionAdapter, MutationPipeline, create_audit_logger};

/// Time in-flight connections get to finish after a shutdown signal.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("kube_image_cacher=info".parse()?),
        )
        .init();

    let config = Args::parse().into_config()?;
    let mirror = config.registry.mirror()?;

    info!(
        provider = %config.registry.provider,
        mirror = %mirror,
        failure_policy = %config.failure_policy,
        "Starting kube-image-cacher"
    );

    // Registry control API
    let control: Arc<dyn RegistryControl> = match config.registry.provider {
        RegistryProvider::Ecr => Arc::new(EcrControl::from_env().await),
    };

    // Container engine
    let engine = Arc::new(DockerEngine::from_host(&config.docker_host)?);
    info!(socket = %engine.socket().display(), "Using container engine");

    let refresh_margin = chrono::Duration::from_std(config.credential_refresh_margin)
        .context("credential refresh margin out of range")?;
    let credentials =
        Arc::new(CredentialCache::new(control.clone()).with_refresh_margin(refresh_margin));

    let pipeline = Arc::new(MutationPipeline::new(
        mirror,
        credentials,
        RepositoryProvisioner::new(control),
        TransferOrchestrator::new(engine),
    ));

    // Cancelled on shutdown; every admission context is a child of it
    let shutdown = CancellationToken::new();
    let audit = create_audit_logger();
    let adapter = Arc::new(AdmissionAdapter::new(
        pipeline,
        config.failure_policy,
        config.request_timeout,
        shutdown.clone(),
        audit.clone(),
    ));

    let router = create_router(Arc::new(AppState { adapter, audit }));

    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.server.listen))?;
    let handle = Handle::new();

    let mut server = match &config.server.tls {
        Some(tls) => {
            let _ = CryptoProvider::install_default(default_provider());
            let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .with_context(|| {
                    format!(
                        "failed to load TLS material from {} and {}",
                        tls.cert.display(),
                        tls.key.display()
                    )
                })?;
            info!("Webhook listening on https://{}", addr);
            tokio::spawn(
                axum_server::bind_rustls(addr, rustls)
                    .handle(handle.clone())
                    .serve(router.into_make_service()),
            )
        }
        None => {
            info!("Webhook listening on http://{} (TLS disabled)", addr);
            tokio::spawn(
                axum_server::bind(addr)
                    .handle(handle.clone())
                    .serve(router.into_make_service()),
            )
        }
    };

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        result = shutdown_signal() => result?,
    }

    // Abort in-flight admissions, then drain connections
    shutdown.cancel();
    handle.graceful_shutdown(Some(GRACE_PERIOD));
    server.await??;

    info!("Shutdown complete");
    Ok(())
}
