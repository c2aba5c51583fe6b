use std::{fmt, path::PathBuf};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a registry-image operation.
pub type RegistryImageResult<T> = Result<T, RegistryImageError>;

/// An error that occurred while checking, fetching, or publishing an image.
#[derive(pretty_error_debug::Debug, Error)]
pub enum RegistryImageError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when a Serde JSON error occurred.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred while building or parsing OCI image structures.
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error in the invocation configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An error that occurred when parsing an image repository reference.
    #[error("invalid repository reference: {0}")]
    RepositoryReference(String),

    /// An error that occurred when a semver constraint could not be parsed.
    #[error("invalid semver constraint: {0}")]
    SemverConstraint(#[from] semver::Error),

    /// An error that occurred while acquiring registry credentials.
    #[error("cannot authenticate with {mode}: {reason}")]
    Auth {
        /// The credential mode that failed (basic, ecr, acr, gcp).
        mode: &'static str,

        /// What went wrong while acquiring the credential.
        reason: String,
    },

    /// An error that occurred when a manifest was not found for a reference.
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// An error that occurred when no manifest in an index matched the requested platform.
    #[error("no manifest matches platform {os}/{architecture}")]
    NoMatchingPlatform {
        /// The requested operating system.
        os: String,

        /// The requested CPU architecture.
        architecture: String,
    },

    /// An unexpected response from the registry.
    #[error("registry returned {status} for {context}: {body}")]
    RegistryResponse {
        /// The HTTP status code of the response.
        status: u16,

        /// The operation and remote identifier the request was for.
        context: String,

        /// The response body, if any.
        body: String,
    },

    /// An error that occurred when the registry omitted a digest header the client depends on.
    #[error("registry did not return a digest for {0}")]
    MissingDigest(String),

    /// An error that occurred when downloaded content did not match its expected digest.
    #[error("digest mismatch for {context}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The blob or manifest the content was fetched for.
        context: String,

        /// The digest the content was expected to have.
        expected: String,

        /// The digest the content actually hashed to.
        actual: String,
    },

    /// An error that occurred during layer handling operations like opening files or unpacking archives.
    /// Contains both the underlying IO error and the digest of the layer being processed.
    #[error("layer handling error: {source}")]
    LayerHandling {
        /// The underlying IO error that occurred
        source: std::io::Error,
        /// The digest of the layer being processed when the error occurred
        layer: String,
    },

    /// An error that occurred while writing an image to the destination directory.
    #[error("materialize error: {0}")]
    Materialize(String),

    /// An error that occurred while reading an image tarball or OCI layout.
    #[error("image load error: {0}")]
    ImageLoad(String),

    /// An error that occurred when an image glob pattern was invalid.
    #[error("invalid image glob: {0}")]
    ImageGlobPattern(#[from] glob::PatternError),

    /// An error that occurred when an image glob did not match exactly one file.
    #[error("expected exactly one file to match {pattern}, found {count}")]
    ImageGlobMatches {
        /// The glob pattern from the invocation params.
        pattern: String,

        /// How many files matched.
        count: usize,
    },

    /// An error that occurred when an additional-tags file could not be read.
    #[error("cannot read additional tags file {path}: {reason}")]
    AdditionalTags {
        /// The configured path.
        path: PathBuf,

        /// Why reading failed.
        reason: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryImageError {
    /// Creates a configuration error from any displayable value.
    pub fn config(reason: impl fmt::Display) -> Self {
        RegistryImageError::Config(reason.to_string())
    }

    /// Creates an authentication error for the given credential mode.
    pub fn auth(mode: &'static str, reason: impl fmt::Display) -> Self {
        RegistryImageError::Auth {
            mode,
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the remote object does not exist.
    ///
    /// Check treats absence as an empty result and the orchestrator treats a
    /// mirror miss as a reason to fall through to the origin registry.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryImageError::ManifestNotFound(_)
                | RegistryImageError::RegistryResponse { status: 404, .. }
        )
    }
}
