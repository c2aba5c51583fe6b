//! Registry credential resolution.
//!
//! The resolver turns the source configuration into a credential the
//! distribution client can apply uniformly: anonymous, HTTP basic, or a basic
//! pair minted by a cloud token service (AWS ECR, Azure ACR, GCP workload
//! identity federation).

mod acr;
mod ecr;
mod gcp;

use getset::Getters;
use reqwest_middleware::ClientWithMiddleware;

use crate::{
    config::{EnvSnapshot, Source, ECR_PUBLIC_HOST},
    reference::RepositoryRef,
    RegistryImageError, RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use acr::resolve_azure_cloud;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A credential presented to a registry.
#[derive(Debug, Clone)]
pub enum RegistryCredential {
    /// No credential; public pulls only.
    Anonymous,

    /// An HTTP basic username/password pair, either configured directly or
    /// minted by a cloud token service.
    Basic {
        /// The username.
        username: String,

        /// The password or token.
        password: String,
    },
}

/// The OAuth scope an operation needs on the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScope {
    /// Reading manifests and blobs.
    Pull,

    /// Writing blobs and manifests (implies pull).
    Push,
}

/// The outcome of credential resolution.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ResolvedAuth {
    /// The credential to present.
    credential: RegistryCredential,

    /// A replacement registry host, when the token service names one
    /// (ECR's proxy endpoint).
    registry_override: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryCredential {
    /// Creates a basic credential.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        RegistryCredential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Whether this credential carries nothing.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, RegistryCredential::Anonymous)
    }
}

impl AuthScope {
    /// The scope string requested from a registry token service.
    pub fn repository_scope(&self, repository: &str) -> String {
        match self {
            AuthScope::Pull => format!("repository:{}:pull", repository),
            AuthScope::Push => format!("repository:{}:pull,push", repository),
        }
    }
}

impl ResolvedAuth {
    fn new(credential: RegistryCredential) -> Self {
        Self {
            credential,
            registry_override: None,
        }
    }

    fn with_registry_override(credential: RegistryCredential, registry: Option<String>) -> Self {
        Self {
            credential,
            registry_override: registry,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves the credential for the given repository from the source shape.
///
/// Dispatch order: explicit basic credentials win, then the cloud modes keyed
/// by their selector fields (`aws_region`, `azure_acr`, `gcp_project`), then
/// anonymous. Failures in any cloud mode abort the entry point with a single
/// `cannot authenticate with <mode>` error.
pub async fn resolve(
    source: &Source,
    repository: &RepositoryRef,
    client: &ClientWithMiddleware,
    env: &EnvSnapshot,
) -> RegistryImageResult<ResolvedAuth> {
    if source.has_basic_credentials() {
        let username = source.get_username().clone().unwrap_or_default();
        let password = source.get_password().clone().unwrap_or_default();
        return Ok(ResolvedAuth::new(RegistryCredential::basic(
            username, password,
        )));
    }

    if source.get_aws_region().is_some() && repository.get_registry() != ECR_PUBLIC_HOST {
        return wrap("ecr", ecr::resolve(source).await);
    }

    if *source.get_azure_acr() {
        let insecure = *source.get_insecure();
        return wrap(
            "acr",
            acr::resolve(source, repository.get_registry(), client, env, insecure).await,
        );
    }

    if source.get_gcp_project().is_some() {
        return wrap("gcp", gcp::resolve(source, client).await);
    }

    Ok(ResolvedAuth::new(RegistryCredential::Anonymous))
}

/// Tags any non-auth error from a cloud resolver with its mode.
fn wrap(
    mode: &'static str,
    result: RegistryImageResult<ResolvedAuth>,
) -> RegistryImageResult<ResolvedAuth> {
    result.map_err(|error| match error {
        err @ RegistryImageError::Auth { .. } => err,
        other => RegistryImageError::auth(mode, other),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
