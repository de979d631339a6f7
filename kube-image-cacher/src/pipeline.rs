//! Mutation Pipeline - mirror one container's image and rewrite its reference.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Container;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::engine::{TransferOrchestrator, TransferOutcome};
use crate::error::{Error, MutationError, TransferError, TransferStage};
use crate::reference::{ImageReference, MirrorRegistry};
use crate::registry::{CredentialCache, RepositoryProvisioner};

pub struct MutationPipeline {
    mirror: MirrorRegistry,
    credentials: Arc<CredentialCache>,
    provisioner: RepositoryProvisioner,
    transfer: TransferOrchestrator,
}

impl MutationPipeline {
    pub fn new(
        mirror: MirrorRegistry,
        credentials: Arc<CredentialCache>,
        provisioner: RepositoryProvisioner,
        transfer: TransferOrchestrator,
    ) -> Self {
        Self {
            mirror,
            credentials,
            provisioner,
            transfer,
        }
    }

    pub fn mirror(&self) -> &MirrorRegistry {
        &self.mirror
    }

    /// Return `container` with its image pointing into the mirror.
    ///
    /// Containers without an image, or whose image is already mirrored, come
    /// back unchanged without any network call. On failure the input
    /// container is dropped untouched and only the error is returned.
    pub async fn mutate(
        &self,
        ctx: &RequestContext,
        mut container: Container,
    ) -> Result<Container, MutationError> {
        let Some(image) = container.image.as_deref() else {
            debug!(container = %container.name, "Container has no image");
            return Ok(container);
        };

        if self.mirror.contains(image) {
            debug!(container = %container.name, image = %image, "Image already mirrored");
            return Ok(container);
        }

        let image = image.to_string();
        let outcome = self
            .mirror_image(ctx, &image)
            .await
            .map_err(|cause| MutationError::new(image.as_str(), cause))?;

        info!(
            container = %container.name,
            source = %image,
            destination = %outcome.destination,
            "Container image rewritten"
        );
        container.image = Some(outcome.destination.to_string());
        Ok(container)
    }

    async fn mirror_image(
        &self,
        ctx: &RequestContext,
        image: &str,
    ) -> crate::error::Result<TransferOutcome> {
        let source = ImageReference::parse(image).map_err(|message| TransferError {
            stage: TransferStage::Pull,
            reference: image.to_string(),
            message: format!("invalid image reference: {message}"),
            last_log_line: None,
        })?;
        let destination = source.mirrored_in(&self.mirror);

        self.provisioner
            .ensure(ctx, destination.repository())
            .await?;
        let credential = self.credentials.get(ctx).await?;

        match self
            .transfer
            .transfer(ctx, &source, &destination, &credential)
            .await
        {
            Err(Error::Transfer(e)) if e.stage == TransferStage::Push && e.is_auth_failure() => {
                warn!(destination = %destination, "Push rejected, dropping cached credential");
                self.credentials.invalidate().await;
                Err(Error::Transfer(e))
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::error::Stage;
    use crate::test_util::{FakeEngine, FakeRegistryControl};

    const DENIED: &str = r#"{"error":"denied","errorDetail":{"message":"access denied"}}"#;

    struct Harness {
        control: Arc<FakeRegistryControl>,
        engine: Arc<FakeEngine>,
        pipeline: MutationPipeline,
    }

    fn harness(mirror: &str) -> Harness {
        let control = Arc::new(FakeRegistryControl::new());
        let engine = Arc::new(FakeEngine::new());
        let pipeline = MutationPipeline::new(
            MirrorRegistry::parse(mirror).unwrap(),
            Arc::new(CredentialCache::new(control.clone())),
            RepositoryProvisioner::new(control.clone()),
            TransferOrchestrator::new(engine.clone()),
        );
        Harness {
            control,
            engine,
            pipeline,
        }
    }

    fn container(image: &str) -> Container {
        Container {
            name: "web".to_string(),
            image: Some(image.to_string()),
            args: Some(vec!["--port".to_string(), "8080".to_string()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_source_image_is_mirrored() {
        let h = harness("cache.example.com");

        let mutated = h
            .pipeline
            .mutate(&RequestContext::background(), container("nginx:1.25"))
            .await
            .unwrap();

        assert_eq!(mutated.image.as_deref(), Some("cache.example.com/nginx:1.25"));
        assert_eq!(mutated.name, "web");
        assert_eq!(mutated.args, container("nginx:1.25").args);

        assert_eq!(h.control.auth_calls(), 1);
        assert_eq!(h.control.describe_calls(), 1);
        assert!(h.control.has_repository("nginx"));
        assert_eq!(h.engine.pulls(), vec!["docker.io/library/nginx:1.25"]);
        assert_eq!(h.engine.tags().len(), 1);
        assert_eq!(h.engine.pushes()[0].0, "cache.example.com/nginx:1.25");
    }

    #[tokio::test]
    async fn test_mirrored_image_is_untouched() {
        let h = harness("cache.example.com");
        let input = container("cache.example.com/nginx:1.25");

        let mutated = h
            .pipeline
            .mutate(&RequestContext::background(), input.clone())
            .await
            .unwrap();

        assert_eq!(mutated, input);
        assert_eq!(h.control.total_calls(), 0);
        assert_eq!(h.engine.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_mirror_host_outside_namespace_is_untouched() {
        let h = harness("cache.example.com/mirror");
        let input = container("cache.example.com/nginx:1.25");

        let mutated = h
            .pipeline
            .mutate(&RequestContext::background(), input.clone())
            .await
            .unwrap();

        assert_eq!(mutated, input);
        assert_eq!(h.control.total_calls(), 0);
        assert_eq!(h.engine.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_lookalike_host_is_not_mirrored() {
        let h = harness("cache.example.com");

        let mutated = h
            .pipeline
            .mutate(
                &RequestContext::background(),
                container("cache.example.com.evil.io/nginx:1.25"),
            )
            .await
            .unwrap();

        assert_eq!(
            mutated.image.as_deref(),
            Some("cache.example.com/cache.example.com.evil.io/nginx:1.25")
        );
        assert_eq!(h.engine.pulls().len(), 1);
    }

    #[tokio::test]
    async fn test_container_without_image() {
        let h = harness("cache.example.com");
        let input = Container {
            name: "empty".to_string(),
            ..Default::default()
        };

        let mutated = h
            .pipeline
            .mutate(&RequestContext::background(), input.clone())
            .await
            .unwrap();
        assert_eq!(mutated, input);
        assert_eq!(h.control.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_credential_shared_across_containers() {
        let h = harness("cache.example.com");
        let ctx = RequestContext::background();

        h.pipeline.mutate(&ctx, container("nginx:1.25")).await.unwrap();
        h.pipeline.mutate(&ctx, container("redis:7")).await.unwrap();

        assert_eq!(h.control.auth_calls(), 1);
        assert_eq!(h.engine.pushes().len(), 2);
    }

    #[tokio::test]
    async fn test_push_failure_reports_stage_and_image() {
        let h = harness("cache.example.com");
        h.engine.set_push_lines(&[DENIED]);

        let err = h
            .pipeline
            .mutate(&RequestContext::background(), container("nginx:1.25"))
            .await
            .unwrap_err();

        assert_eq!(err.image, "nginx:1.25");
        assert_eq!(err.stage(), Stage::Transfer(TransferStage::Push));
    }

    #[tokio::test]
    async fn test_push_auth_failure_invalidates_credential() {
        let h = harness("cache.example.com");
        let ctx = RequestContext::background();
        h.engine.set_push_lines(&[DENIED]);

        assert!(h.pipeline.mutate(&ctx, container("nginx:1.25")).await.is_err());
        assert_eq!(h.control.auth_calls(), 1);

        h.engine.set_push_lines(&[r#"{"status":"done"}"#]);
        h.pipeline.mutate(&ctx, container("nginx:1.25")).await.unwrap();
        assert_eq!(h.control.auth_calls(), 2);
    }

    #[tokio::test]
    async fn test_provision_failure_skips_transfer() {
        let h = harness("cache.example.com");
        h.control.fail_describe("AccessDeniedException");

        let err = h
            .pipeline
            .mutate(&RequestContext::background(), container("nginx:1.25"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Provision);
        assert_eq!(h.engine.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_pull_failure_is_not_push_failure() {
        let h = harness("cache.example.com");
        h.engine.fail_pull(EngineError::Connection("socket missing".to_string()));

        let err = h
            .pipeline
            .mutate(&RequestContext::background(), container("nginx:1.25"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer(TransferStage::Pull));
        assert!(h.engine.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_reference_fails_at_pull() {
        let h = harness("cache.example.com");

        let err = h
            .pipeline
            .mutate(&RequestContext::background(), container("NGINX:::bad"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer(TransferStage::Pull));
        assert_eq!(h.control.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_surfaces_cancelled() {
        let h = harness("cache.example.com");
        let ctx = RequestContext::background();
        ctx.cancel();

        let err = h
            .pipeline
            .mutate(&ctx, container("nginx:1.25"))
            .await
            .unwrap_err();

        assert!(err.cause.is_cancelled());
        assert_eq!(err.stage(), Stage::Provision);
    }
}
