//! Admission Adapter - turns an `AdmissionReview` into per-container mutations
//! and the resulting JSON patch.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AdmissionAuditLogger;
use crate::config::FailurePolicy;
use crate::context::RequestContext;
use crate::error::DecodeError;
use crate::pipeline::MutationPipeline;

const POD_KIND: &str = "Pod";

/// Decode a raw `admission.k8s.io/v1` review into its request.
pub fn decode_review(body: &[u8]) -> Result<AdmissionRequest<DynamicObject>, DecodeError> {
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(body).map_err(|e| DecodeError(e.to_string()))?;
    review.try_into().map_err(|e| DecodeError(format!("{e}")))
}

/// The Pod carried by `req`, together with its raw JSON form.
fn decode_pod(req: &AdmissionRequest<DynamicObject>) -> Result<(Value, Pod), DecodeError> {
    if req.kind.kind != POD_KIND {
        return Err(DecodeError(format!(
            "expected a {POD_KIND}, got {}",
            req.kind.kind
        )));
    }
    let object = req
        .object
        .as_ref()
        .ok_or_else(|| DecodeError("request carries no object".to_string()))?;

    let raw = serde_json::to_value(object).map_err(|e| DecodeError(e.to_string()))?;
    let pod = serde_json::from_value(raw.clone()).map_err(|e| DecodeError(e.to_string()))?;
    Ok((raw, pod))
}

/// `namespace/name` of the admitted pod, for logs and audit.
fn pod_name(req: &AdmissionRequest<DynamicObject>, pod: &Pod) -> String {
    let name = if req.name.is_empty() {
        pod.metadata
            .name
            .clone()
            .or_else(|| pod.metadata.generate_name.clone())
            .unwrap_or_default()
    } else {
        req.name.clone()
    };
    match req.namespace.as_deref() {
        Some(namespace) => format!("{namespace}/{name}"),
        None => name,
    }
}

pub struct AdmissionAdapter {
    pipeline: Arc<MutationPipeline>,
    policy: FailurePolicy,
    request_timeout: Duration,
    shutdown: CancellationToken,
    audit: Arc<AdmissionAuditLogger>,
}

impl AdmissionAdapter {
    pub fn new(
        pipeline: Arc<MutationPipeline>,
        policy: FailurePolicy,
        request_timeout: Duration,
        shutdown: CancellationToken,
        audit: Arc<AdmissionAuditLogger>,
    ) -> Self {
        Self {
            pipeline,
            policy,
            request_timeout,
            shutdown,
            audit,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// True once shutdown has begun; new admissions would only be cancelled.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Mirror every container image of the admitted pod and answer with a patch.
    ///
    /// Containers are processed in order under one deadline. Only image fields
    /// of the raw object are ever patched.
    pub async fn admit(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let (raw, pod) = match decode_pod(req) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(uid = %req.uid, error = %e, "Rejecting undecodable admission request");
                self.audit.request_malformed(&req.uid, &e.to_string());
                let mut response = AdmissionResponse::from(req).deny(e.to_string());
                response.result.code = 400;
                return response;
            }
        };

        let name = pod_name(req, &pod);
        let containers = pod.spec.map(|spec| spec.containers).unwrap_or_default();
        debug!(pod = %name, containers = containers.len(), "Admitting pod");

        let ctx = RequestContext::with_timeout(&self.shutdown, self.request_timeout);
        let mut rewrites = Vec::new();
        let mut warnings = Vec::new();

        for (index, container) in containers.into_iter().enumerate() {
            let container_name = container.name.clone();
            let original = container.image.clone();

            match self.pipeline.mutate(&ctx, container).await {
                Ok(mutated) => match (&original, mutated.image) {
                    (Some(source), Some(image)) if *source != image => {
                        self.audit.image_cached(&name, &container_name, source, &image);
                        rewrites.push((index, image));
                    }
                    (Some(source), _) => {
                        self.audit.image_skipped(&name, &container_name, source);
                    }
                    (None, _) => {}
                },
                Err(e) => match self.policy {
                    FailurePolicy::FailClosed => {
                        warn!(pod = %name, container = %container_name, error = %e, "Rejecting pod");
                        self.audit.admission_rejected(&name, &e.to_string());
                        return AdmissionResponse::from(req).deny(e.to_string());
                    }
                    FailurePolicy::FailOpen => {
                        warn!(
                            pod = %name,
                            container = %container_name,
                            error = %e,
                            "Admitting container with its original image"
                        );
                        self.audit
                            .mutation_failed_open(&name, &container_name, &e.image, &e.to_string());
                        warnings.push(format!(
                            "container {container_name}: image {} was not mirrored: {e}",
                            e.image
                        ));
                    }
                },
            }
        }

        let mut response = AdmissionResponse::from(req);
        if !rewrites.is_empty() {
            let mut mutated = raw.clone();
            for (index, image) in &rewrites {
                let pointer = format!("/spec/containers/{index}/image");
                if let Some(field) = mutated.pointer_mut(&pointer) {
                    *field = Value::String(image.clone());
                }
            }
            let patch = json_patch::diff(&raw, &mutated);
            response = match response.with_patch(patch) {
                Ok(response) => response,
                Err(e) => {
                    warn!(pod = %name, error = %e, "Failed to serialize patch");
                    return AdmissionResponse::from(req)
                        .deny(format!("failed to serialize patch: {e}"));
                }
            };
            info!(pod = %name, images = rewrites.len(), "Pod images rewritten");
        }
        if !warnings.is_empty() {
            response.warnings = Some(warnings);
        }
        response
    }
}
