//! Amazon ECR implementation of the registry control API.

use async_trait::async_trait;
use aws_sdk_ecr::Client;
use aws_sdk_ecr::error::{DisplayErrorContext, ProvideErrorMetadata};
use chrono::DateTime;
use tracing::debug;

use super::{AuthorizationToken, ControlError, RegistryControl};

pub struct EcrControl {
    client: Client,
}

impl EcrControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS configuration (region, credentials).
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config))
    }
}

fn api_error<E>(err: E) -> ControlError
where
    E: std::error::Error + ProvideErrorMetadata,
{
    let message = match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        _ => DisplayErrorContext(&err).to_string(),
    };
    ControlError::Api(message)
}

#[async_trait]
impl RegistryControl for EcrControl {
    async fn describe_repository(&self, repository: &str) -> Result<(), ControlError> {
        debug!(repository = %repository, "Describing ECR repository");
        match self
            .client
            .describe_repositories()
            .repository_names(repository)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_repository_not_found_exception())
                {
                    Err(ControlError::RepositoryNotFound(repository.to_string()))
                } else {
                    Err(api_error(err))
                }
            }
        }
    }

    async fn create_repository(&self, repository: &str) -> Result<(), ControlError> {
        debug!(repository = %repository, "Creating ECR repository");
        match self
            .client
            .create_repository()
            .repository_name(repository)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_repository_already_exists_exception())
                {
                    Err(ControlError::RepositoryAlreadyExists(repository.to_string()))
                } else {
                    Err(api_error(err))
                }
            }
        }
    }

    async fn authorization_token(&self) -> Result<AuthorizationToken, ControlError> {
        debug!("Requesting ECR authorization token");
        let output = self
            .client
            .get_authorization_token()
            .send()
            .await
            .map_err(api_error)?;

        let data = output
            .authorization_data()
            .first()
            .ok_or_else(|| ControlError::Api("no authorization data returned".to_string()))?;

        let token = data
            .authorization_token()
            .ok_or_else(|| ControlError::Api("authorization data without token".to_string()))?;

        let expires_at = data
            .expires_at()
            .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));

        Ok(AuthorizationToken {
            token: token.to_string(),
            expires_at,
        })
    }
}
