//! Image references and the mirror registry they may belong to.
//!
//! Parsing is delegated to `oci_distribution::Reference`, which applies the
//! same normalisation rules as container engines (`nginx` is
//! `docker.io/library/nginx:latest`). Membership in the mirror is decided on
//! the parsed registry host, never on substring containment.

use std::fmt;

use oci_distribution::Reference;

const DOCKER_HUB_HOSTS: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];
const DEFAULT_TAG: &str = "latest";

/// Structured `registry/repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, String> {
        let image = image.trim();
        if image.is_empty() {
            return Err("empty image reference".to_string());
        }

        let reference = Reference::try_from(image).map_err(|e| e.to_string())?;
        Ok(Self {
            registry: reference.registry().to_string(),
            repository: reference.repository().to_string(),
            tag: reference.tag().map(str::to_string),
            digest: reference.digest().map(str::to_string),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    fn is_docker_hub(&self) -> bool {
        DOCKER_HUB_HOSTS.contains(&self.registry.as_str())
    }

    /// Deterministic location of this image inside `mirror`.
    ///
    /// Docker Hub images drop the `library/` prefix; images from any other
    /// registry keep the source host as their first path component so equally
    /// named repositories from different registries do not collide.
    pub fn mirrored_in(&self, mirror: &MirrorRegistry) -> ImageReference {
        let path = if self.is_docker_hub() {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry.replace(':', "-"), self.repository)
        };

        let repository = match &mirror.namespace {
            Some(namespace) => format!("{namespace}/{path}"),
            None => path,
        };

        let tag = match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => digest.replacen(':', "-", 1),
            (None, None) => DEFAULT_TAG.to_string(),
        };

        ImageReference {
            registry: mirror.host.clone(),
            repository,
            tag: Some(tag),
            digest: None,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// The private registry images are mirrored into: a host and an optional
/// namespace under which all mirrored repositories live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRegistry {
    host: String,
    namespace: Option<String>,
}

impl MirrorRegistry {
    /// Parse `[scheme://]host[:port][/namespace]`.
    pub fn parse(url: &str) -> Result<Self, String> {
        let trimmed = url.trim();
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let (host, namespace) = match without_scheme.split_once('/') {
            Some((host, namespace)) => (host, Some(namespace.trim_matches('/'))),
            None => (without_scheme, None),
        };

        if host.is_empty() {
            return Err(format!("invalid mirror registry url '{url}'"));
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Whether `image` already points into this mirror.
    ///
    /// Malformed references never belong to the mirror.
    pub fn contains(&self, image: &str) -> bool {
        match ImageReference::parse(image) {
            Ok(reference) => self.contains_reference(&reference),
            Err(_) => false,
        }
    }

    /// Membership is decided on the registry host alone; the namespace only
    /// shapes destination names.
    pub fn contains_reference(&self, reference: &ImageReference) -> bool {
        reference.registry().eq_ignore_ascii_case(&self.host)
    }
}

impl fmt::Display for MirrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", self.host, namespace),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Registry Classifier: does `image` already belong to the mirror at `mirror_url`?
pub fn belongs_to_mirror(image: &str, mirror_url: &str) -> bool {
    MirrorRegistry::parse(mirror_url).is_ok_and(|mirror| mirror.contains(image))
}
