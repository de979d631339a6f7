//! Repository Provisioner - makes sure a destination repository exists.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ControlError, RegistryControl};
use crate::context::RequestContext;
use crate::error::{Error, ProvisionError, Result, Stage};

pub struct RepositoryProvisioner {
    control: Arc<dyn RegistryControl>,
}

impl RepositoryProvisioner {
    pub fn new(control: Arc<dyn RegistryControl>) -> Self {
        Self { control }
    }

    /// Ensure `repository` exists in the mirror registry, creating it if absent.
    ///
    /// Losing a creation race to a concurrent admission is not an error.
    pub async fn ensure(&self, ctx: &RequestContext, repository: &str) -> Result<()> {
        ctx.run(self.ensure_inner(repository))
            .await
            .map_err(|reason| Error::Cancelled {
                stage: Stage::Provision,
                reason,
            })?
    }

    async fn ensure_inner(&self, repository: &str) -> Result<()> {
        match self.control.describe_repository(repository).await {
            Ok(()) => {
                debug!(repository = %repository, "Repository exists");
                return Ok(());
            }
            Err(ControlError::RepositoryNotFound(_)) => {}
            Err(e) => {
                return Err(ProvisionError::Describe {
                    repository: repository.to_string(),
                    message: e.to_string(),
                }
                .into());
            }
        }

        info!(repository = %repository, "Creating repository");
        match self.control.create_repository(repository).await {
            Ok(()) => {
                info!(repository = %repository, "Repository created");
                Ok(())
            }
            Err(ControlError::RepositoryAlreadyExists(_)) => {
                warn!(repository = %repository, "Repository was created concurrently");
                Ok(())
            }
            Err(e) => Err(ProvisionError::Create {
                repository: repository.to_string(),
                message: e.to_string(),
            }
            .into()),
        }
    }
}
