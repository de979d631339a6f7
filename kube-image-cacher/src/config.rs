//! Startup configuration.
//!
//! Every setting is a command line flag backed by an environment variable.
//! Configuration is validated once, before any client is built; an invalid
//! value is a fatal startup error.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::engine::docker::DEFAULT_DOCKER_HOST;
use crate::reference::MirrorRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid registry provider '{0}', supported: ecr")]
    InvalidProvider(String),

    #[error("registry url must not be empty")]
    EmptyRegistryUrl,

    #[error("invalid registry url: {0}")]
    InvalidRegistryUrl(String),

    #[error("--tls-cert and --tls-key must be given together")]
    IncompleteTls,

    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
}

/// Cloud registry providers the mirror can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryProvider {
    Ecr,
}

impl FromStr for RegistryProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ecr" => Ok(RegistryProvider::Ecr),
            other => Err(ConfigError::InvalidProvider(other.to_string())),
        }
    }
}

impl fmt::Display for RegistryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryProvider::Ecr => write!(f, "ecr"),
        }
    }
}

/// What to do with a container whose image could not be mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FailurePolicy {
    /// Admit the pod with the original image and record the failure.
    #[default]
    FailOpen,
    /// Reject the whole admission request.
    FailClosed,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailOpen => write!(f, "fail-open"),
            FailurePolicy::FailClosed => write!(f, "fail-closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub provider: RegistryProvider,
    pub url: String,
}

impl RegistryConfig {
    pub fn new(provider: &str, url: &str) -> Result<Self, ConfigError> {
        let provider = provider.parse()?;
        let url = url.trim();
        if url.is_empty() {
            return Err(ConfigError::EmptyRegistryUrl);
        }
        MirrorRegistry::parse(url).map_err(ConfigError::InvalidRegistryUrl)?;
        Ok(Self {
            provider,
            url: url.to_string(),
        })
    }

    pub fn mirror(&self) -> Result<MirrorRegistry, ConfigError> {
        MirrorRegistry::parse(&self.url).map_err(ConfigError::InvalidRegistryUrl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: String,
    /// Plain HTTP when absent.
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub registry: RegistryConfig,
    pub failure_policy: FailurePolicy,
    pub request_timeout: Duration,
    pub docker_host: String,
    pub credential_refresh_margin: Duration,
    pub server: ServerConfig,
}

#[derive(Debug, Parser)]
#[command(name = "kube-image-cacher")]
#[command(about = "Mutating admission webhook that mirrors pod images into a private registry")]
pub struct Args {
    /// Cloud registry provider of the mirror (only "ecr")
    #[arg(long, env = "REGISTRY_PROVIDER")]
    pub registry_provider: String,

    /// Mirror registry host, optionally followed by a namespace path
    #[arg(long, env = "REGISTRY_URL")]
    pub registry_url: String,

    /// Behaviour when an image cannot be mirrored
    #[arg(long, env = "FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::FailOpen)]
    pub failure_policy: FailurePolicy,

    /// Deadline for mirroring all images of one admission request
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 25)]
    pub request_timeout_secs: u64,

    /// Container engine endpoint
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_DOCKER_HOST)]
    pub docker_host: String,

    /// Listen address for the webhook
    #[arg(short, long, env = "LISTEN_ADDR", default_value = "[::]:9443")]
    pub listen: String,

    /// PEM certificate chain for HTTPS
    #[arg(long, env = "TLS_CERT_FILE")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for HTTPS
    #[arg(long, env = "TLS_KEY_FILE")]
    pub tls_key: Option<PathBuf>,

    /// Refresh registry credentials this long before they expire
    #[arg(long, env = "CREDENTIAL_REFRESH_MARGIN_SECS", default_value_t = 300)]
    pub credential_refresh_margin_secs: u64,
}

impl Args {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let registry = RegistryConfig::new(&self.registry_provider, &self.registry_url)?;

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let tls = match (self.tls_cert, self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        Ok(Config {
            registry,
            failure_policy: self.failure_policy,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            docker_host: self.docker_host,
            credential_refresh_margin: Duration::from_secs(self.credential_refresh_margin_secs),
            server: ServerConfig {
                listen: self.listen,
                tls,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config, ConfigError> {
        let mut argv = vec![
            "kube-image-cacher",
            "--registry-provider",
            "ecr",
            "--registry-url",
            "my.registry.foo",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap().into_config()
    }

    #[test]
    fn test_invalid_registry_provider() {
        assert_eq!(
            RegistryConfig::new("foo", "my.registry.foo"),
            Err(ConfigError::InvalidProvider("foo".to_string()))
        );
        assert!(RegistryConfig::new("", "my.registry.foo").is_err());
        assert!(RegistryConfig::new("ECR", "my.registry.foo").is_err());
    }

    #[test]
    fn test_registry_config_with_values() {
        let config = RegistryConfig::new("ecr", "my.registry.foo").unwrap();
        assert_eq!(config.provider, RegistryProvider::Ecr);
        assert_eq!(config.url, "my.registry.foo");
        assert_eq!(config.mirror().unwrap().host(), "my.registry.foo");
    }

    #[test]
    fn test_empty_registry_url() {
        assert_eq!(
            RegistryConfig::new("ecr", "  "),
            Err(ConfigError::EmptyRegistryUrl)
        );
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.request_timeout, Duration::from_secs(25));
        assert_eq!(config.docker_host, DEFAULT_DOCKER_HOST);
        assert_eq!(config.credential_refresh_margin, Duration::from_secs(300));
        assert_eq!(config.server.listen, "[::]:9443");
        assert!(config.server.tls.is_none());
    }

    #[test]
    fn test_failure_policy_flag() {
        let config = parse(&["--failure-policy", "fail-closed"]).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);

        let mut argv = vec!["kube-image-cacher", "--registry-provider", "ecr"];
        argv.extend_from_slice(&["--registry-url", "x", "--failure-policy", "sometimes"]);
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_tls_requires_both_files() {
        assert_eq!(
            parse(&["--tls-cert", "/etc/tls/tls.crt"]),
            Err(ConfigError::IncompleteTls)
        );

        let config = parse(&["--tls-cert", "/etc/tls/tls.crt", "--tls-key", "/etc/tls/tls.key"])
            .unwrap();
        let tls = config.server.tls.unwrap();
        assert_eq!(tls.cert, PathBuf::from("/etc/tls/tls.crt"));
        assert_eq!(tls.key, PathBuf::from("/etc/tls/tls.key"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert_eq!(
            parse(&["--request-timeout-secs", "0"]),
            Err(ConfigError::ZeroTimeout)
        );
    }
}
