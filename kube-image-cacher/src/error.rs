//! Error types for the image mutation pipeline.
//!
//! Every failure that can reach the admission adapter is a [`MutationError`]:
//! the offending container's image reference plus exactly one [`Error`] cause.

use std::fmt;

use thiserror::Error;

/// Pipeline stage in which a failure or cancellation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Provision,
    Credentials,
    Transfer(TransferStage),
}

/// One of the three steps that move an image into the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Pull,
    Tag,
    Push,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Provision => write!(f, "provision"),
            Stage::Credentials => write!(f, "credentials"),
            Stage::Transfer(stage) => write!(f, "{stage}"),
        }
    }
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStage::Pull => write!(f, "pull"),
            TransferStage::Tag => write!(f, "tag"),
            TransferStage::Push => write!(f, "push"),
        }
    }
}

impl From<TransferStage> for Stage {
    fn from(stage: TransferStage) -> Self {
        Stage::Transfer(stage)
    }
}

/// Why a request context stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("request cancelled")]
    Cancelled,
}

/// The admission payload could not be decoded into a Pod.
#[derive(Debug, Clone, Error)]
#[error("failed to decode admission request: {0}")]
pub struct DecodeError(pub String);

/// Mirror registry credentials could not be obtained.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The authorization endpoint call failed.
    #[error("authorization request failed: {0}")]
    Request(String),

    /// The authorization payload is not base64 `user:password`.
    #[error("malformed authorization token: {0}")]
    MalformedToken(String),
}

/// The destination repository could not be verified or created.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("failed to describe repository {repository}: {message}")]
    Describe { repository: String, message: String },

    #[error("failed to create repository {repository}: {message}")]
    Create { repository: String, message: String },
}

/// A pull, tag or push step failed.
#[derive(Debug, Clone, Error)]
#[error("{stage} of {reference} failed: {message}")]
pub struct TransferError {
    pub stage: TransferStage,
    pub reference: String,
    pub message: String,
    /// Final line of the engine's progress stream, if one was read.
    pub last_log_line: Option<String>,
}

impl TransferError {
    /// Whether the failure looks like the registry rejected our credentials.
    ///
    /// Phrases are matched on whole words, so digests and blob ids that
    /// happen to contain `401` do not count.
    pub fn is_auth_failure(&self) -> bool {
        const PHRASES: [&[&str]; 5] = [
            &["unauthorized"],
            &["denied"],
            &["401"],
            &["authentication", "required"],
            &["no", "basic", "auth", "credentials"],
        ];

        let words: Vec<String> = self
            .message
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();

        PHRASES.iter().any(|phrase| {
            words
                .windows(phrase.len())
                .any(|window| window.iter().zip(phrase.iter()).all(|(w, p)| w == p))
        })
    }
}

/// Cause of a failed mutation.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("cancelled during {stage}: {reason}")]
    Cancelled { stage: Stage, reason: CancelReason },
}

impl Error {
    /// Stage the failure belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Error::Auth(_) => Stage::Credentials,
            Error::Provision(_) => Stage::Provision,
            Error::Transfer(e) => Stage::Transfer(e.stage),
            Error::Cancelled { stage, .. } => *stage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// A container could not be mutated.
#[derive(Debug, Clone, Error)]
#[error("mirroring image {image} failed at {}: {cause}", .cause.stage())]
pub struct MutationError {
    pub image: String,
    #[source]
    pub cause: Error,
}

impl MutationError {
    pub fn new(image: impl Into<String>, cause: Error) -> Self {
        Self {
            image: image.into(),
            cause,
        }
    }

    pub fn stage(&self) -> Stage {
        self.cause.stage()
    }
}

/// Result type for pipeline components.
pub type Result<T> = std::result::Result<T, Error>;
