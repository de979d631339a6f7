use std::sync::Arc;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Audit,
    Warn,
}

/// Admission audit logger
///
/// Events go to the `audit` tracing target, one per admission decision, so
/// they can be filtered or shipped separately from diagnostics.
pub struct AdmissionAuditLogger {
    enabled: bool,
}

impl AdmissionAuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    fn log(&self, level: LogLevel, message: String, object_ids: Vec<String>) {
        if !self.enabled {
            return;
        }
        let objects = object_ids.join(",");
        match level {
            LogLevel::Info => info!(target: "audit", objects = %objects, "{message}"),
            LogLevel::Audit => info!(target: "audit", audit = true, objects = %objects, "{message}"),
            LogLevel::Warn => warn!(target: "audit", objects = %objects, "{message}"),
        }
    }

    // Image events
    pub fn image_cached(&self, pod: &str, container: &str, source: &str, destination: &str) {
        self.log(
            LogLevel::Audit,
            format!("Image mirrored: {} -> {} (container {})", source, destination, container),
            vec![pod.to_string(), destination.to_string()],
        );
    }

    pub fn image_skipped(&self, pod: &str, container: &str, image: &str) {
        self.log(
            LogLevel::Info,
            format!("Image already mirrored: {} (container {})", image, container),
            vec![pod.to_string(), image.to_string()],
        );
    }

    // Failure events
    pub fn mutation_failed_open(&self, pod: &str, container: &str, image: &str, error: &str) {
        self.log(
            LogLevel::Warn,
            format!(
                "Mirroring failed, admitting original image {} (container {}): {}",
                image, container, error
            ),
            vec![pod.to_string(), image.to_string()],
        );
    }

    pub fn admission_rejected(&self, pod: &str, reason: &str) {
        self.log(
            LogLevel::Audit,
            format!("Admission rejected for pod {}: {}", pod, reason),
            vec![pod.to_string()],
        );
    }

    pub fn request_malformed(&self, uid: &str, error: &str) {
        self.log(
            LogLevel::Warn,
            format!("Malformed admission request {}: {}", uid, error),
            vec![uid.to_string()],
        );
    }
}

impl Default for AdmissionAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create_audit_logger() -> Arc<AdmissionAuditLogger> {
    Arc::new(AdmissionAuditLogger::new())
}
