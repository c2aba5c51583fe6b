//! Parsing of repository references into registry host and repository path.

use std::{fmt, str::FromStr, sync::LazyLock};

use getset::Getters;
use regex::Regex;

use crate::{
    config::{DEFAULT_REGISTRY_ALIASES, DEFAULT_REGISTRY_HOST, DEFAULT_REPO_NAMESPACE},
    RegistryImageError,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Registries may carry a port but otherwise only host characters.
static REGISTRY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").unwrap());

/// Repository paths are lowercase segments separated by slashes.
static REPOSITORY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*)(/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap()
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed repository reference.
///
/// The configured `repository` string resolves to an explicit registry host
/// when the segment before the first `/` contains a `.` or `:` or is
/// `localhost`; otherwise the default registry and, for single-segment names,
/// the `library/` namespace apply.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RepositoryRef {
    /// The registry host (and optional port) the repository lives on.
    registry: String,

    /// The repository path within the registry.
    repository: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RepositoryRef {
    /// Creates a reference from already-split parts, validating both.
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
    ) -> Result<Self, RegistryImageError> {
        let registry = registry.into();
        let repository = repository.into();
        validate_registry(&registry)?;
        validate_repository(&repository)?;
        Ok(Self {
            registry,
            repository,
        })
    }

    /// Whether the reference points at the default registry.
    ///
    /// A registry mirror only participates for the default registry; an
    /// explicit host in the repository bypasses it.
    pub fn is_default_registry(&self) -> bool {
        DEFAULT_REGISTRY_ALIASES.contains(&self.registry.as_str())
    }

    /// The same repository served from a different host, as used for mirrors.
    pub fn with_registry(&self, registry: impl Into<String>) -> Result<Self, RegistryImageError> {
        Self::new(registry, self.repository.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for RepositoryRef {
    type Err = RegistryImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RegistryImageError::RepositoryReference(
                "repository is empty".into(),
            ));
        }

        let (registry, remainder) = extract_registry_and_path(s);
        let repository = if !remainder.contains('/') {
            format!("{}/{}", DEFAULT_REPO_NAMESPACE, remainder)
        } else {
            remainder.to_string()
        };

        Self::new(registry, repository)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits an explicit registry host off the reference, falling back to the
/// default registry when the first segment cannot be a host.
fn extract_registry_and_path(reference: &str) -> (String, &str) {
    let segments: Vec<&str> = reference.splitn(2, '/').collect();
    if segments.len() > 1
        && (segments[0].contains('.') || segments[0].contains(':') || segments[0] == "localhost")
    {
        (segments[0].to_string(), segments[1])
    } else {
        (DEFAULT_REGISTRY_HOST.to_string(), reference)
    }
}

fn validate_registry(registry: &str) -> Result<(), RegistryImageError> {
    if REGISTRY_REGEX.is_match(registry) {
        Ok(())
    } else {
        Err(RegistryImageError::RepositoryReference(format!(
            "invalid registry: {}",
            registry
        )))
    }
}

fn validate_repository(repository: &str) -> Result<(), RegistryImageError> {
    if REPOSITORY_REGEX.is_match(repository) {
        Ok(())
    } else {
        Err(RegistryImageError::RepositoryReference(format!(
            "invalid repository: {}",
            repository
        )))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_implicit_registry_and_namespace() {
        let reference = "busybox".parse::<RepositoryRef>().unwrap();
        assert_eq!(reference.registry, DEFAULT_REGISTRY_HOST);
        assert_eq!(reference.repository, "library/busybox");
        assert!(reference.is_default_registry());
    }

    #[test]
    fn test_reference_implicit_registry_multi_segment() {
        let reference = "concourse/test-image-static".parse::<RepositoryRef>().unwrap();
        assert_eq!(reference.registry, DEFAULT_REGISTRY_HOST);
        assert_eq!(reference.repository, "concourse/test-image-static");
    }

    #[test]
    fn test_reference_explicit_registry_with_dot() {
        let reference = "registry.example.com/org/app".parse::<RepositoryRef>().unwrap();
        assert_eq!(reference.registry, "registry.example.com");
        assert_eq!(reference.repository, "org/app");
        assert!(!reference.is_default_registry());
    }

    #[test]
    fn test_reference_explicit_registry_with_port() {
        let reference = "registry.example.com:5000/app".parse::<RepositoryRef>().unwrap();
        assert_eq!(reference.registry, "registry.example.com:5000");
        assert_eq!(reference.repository, "library/app");
    }

    #[test]
    fn test_reference_localhost_is_a_registry() {
        let reference = "localhost/app".parse::<RepositoryRef>().unwrap();
        assert_eq!(reference.registry, "localhost");
        assert_eq!(reference.repository, "library/app");
    }

    #[test]
    fn test_reference_dotted_first_segment_without_slash_is_a_repo() {
        // A lone segment is always a repository name, never a host.
        let reference = "some.repo".parse::<RepositoryRef>().unwrap();
        assert_eq!(reference.registry, DEFAULT_REGISTRY_HOST);
        assert_eq!(reference.repository, "library/some.repo");
    }

    #[test]
    fn test_reference_empty_input() {
        let err = "".parse::<RepositoryRef>().unwrap_err();
        assert!(err.to_string().contains("repository is empty"));
    }

    #[test]
    fn test_reference_invalid_repository() {
        let err = "docker.io/Library/alpine".parse::<RepositoryRef>().unwrap_err();
        assert!(err.to_string().contains("invalid repository"));
    }

    #[test]
    fn test_reference_docker_io_counts_as_default() {
        let reference = "docker.io/library/alpine".parse::<RepositoryRef>().unwrap();
        assert!(reference.is_default_registry());
    }
}
