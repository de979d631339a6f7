//! Process-wide cache of mirror registry credentials.
//!
//! The cache holds at most one [`Credential`]. Lookups and refreshes happen
//! inside a single critical section: a caller that finds the cache empty or
//! expired performs the refresh while holding the lock, so concurrent callers
//! wait for that one authorization call instead of issuing their own.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::RegistryControl;
use crate::context::RequestContext;
use crate::error::{AuthError, Error, Result, Stage};

/// Lifetime assumed when the provider does not report an expiry.
const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 12;

/// Username and password for the mirror registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Decode a base64 `username:password` authorization blob.
    pub fn decode(token: &str, expires_at: DateTime<Utc>) -> std::result::Result<Self, AuthError> {
        let decoded = STANDARD
            .decode(token.trim())
            .map_err(|e| AuthError::MalformedToken(format!("invalid base64: {e}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| AuthError::MalformedToken("token is not valid UTF-8".to_string()))?;

        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            AuthError::MalformedToken("expected 'username:password'".to_string())
        })?;

        if username.is_empty() {
            return Err(AuthError::MalformedToken("empty username".to_string()));
        }

        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            expires_at,
        })
    }

    /// Whether the credential is still usable at `now`, keeping `margin` in reserve.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Explicitly owned credential cache, shared by all admission requests.
pub struct CredentialCache {
    control: Arc<dyn RegistryControl>,
    refresh_margin: Duration,
    current: Mutex<Option<Credential>>,
}

impl CredentialCache {
    pub fn new(control: Arc<dyn RegistryControl>) -> Self {
        Self {
            control,
            refresh_margin: Duration::zero(),
            current: Mutex::new(None),
        }
    }

    /// Treat credentials that expire within `margin` as already expired.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Return the cached credential, refreshing it when absent or expired.
    pub async fn get(&self, ctx: &RequestContext) -> Result<Credential> {
        ctx.run(self.get_or_refresh())
            .await
            .map_err(|reason| Error::Cancelled {
                stage: Stage::Credentials,
                reason,
            })?
    }

    async fn get_or_refresh(&self) -> Result<Credential> {
        let mut current = self.current.lock().await;

        if let Some(credential) = current.as_ref()
            && credential.is_valid_at(Utc::now(), self.refresh_margin)
        {
            debug!("Using cached registry credential");
            return Ok(credential.clone());
        }

        info!("Refreshing registry credential");
        let token = self
            .control
            .authorization_token()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let expires_at = token
            .expires_at
            .unwrap_or_else(|| Utc::now() + Duration::hours(DEFAULT_TOKEN_LIFETIME_HOURS));
        let credential = Credential::decode(&token.token, expires_at)?;

        info!(
            username = %credential.username,
            expires_at = %credential.expires_at,
            "Registry credential refreshed"
        );
        *current = Some(credential.clone());
        Ok(credential)
    }

    /// Drop the cached credential so the next lookup fetches a new one.
    pub async fn invalidate(&self) {
        let mut current = self.current.lock().await;
        if current.take().is_some() {
            info!("Registry credential invalidated");
        }
    }
}
