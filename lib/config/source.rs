use std::{collections::BTreeMap, fmt, path::PathBuf};

use getset::Getters;
use semver::VersionReq;
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::{config::DEFAULT_TAG, RegistryImageError, RegistryImageResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The per-invocation source configuration.
///
/// A source describes one repository, how to select versions from its tag
/// namespace, and the credentials used to reach the registry. It is immutable
/// for the lifetime of an entry-point call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(deny_unknown_fields)]
pub struct Source {
    /// The repository to track, fully qualified or implicit
    /// (e.g. `busybox`, `concourse/concourse`, `registry.example.com:5000/app`).
    repository: String,

    /// The tag to track. Defaults to `latest` when neither a tag nor a
    /// repository scan applies. Accepts JSON numbers as well as strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<Tag>,

    /// Suffix on version tags, used both as a filter during repository scans
    /// and as the bare alias replacing `latest`.
    #[serde(skip_serializing_if = "Option::is_none")]
    variant: Option<String>,

    /// Whether prerelease versions (alpha, beta, rc) are admitted during scans.
    #[serde(default)]
    pre_releases: bool,

    /// A semver constraint limiting which versions are reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    semver_constraint: Option<String>,

    /// Enables debug logging.
    #[serde(default)]
    debug: bool,

    /// Username for HTTP basic authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,

    /// Password for HTTP basic authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,

    /// Static AWS access key id for ECR access.
    #[serde(skip_serializing_if = "Option::is_none")]
    aws_access_key_id: Option<String>,

    /// Static AWS secret access key for ECR access.
    #[serde(skip_serializing_if = "Option::is_none")]
    aws_secret_access_key: Option<String>,

    /// AWS session token accompanying static keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    aws_session_token: Option<String>,

    /// AWS region of the ECR registry. Setting this selects ECR authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    aws_region: Option<String>,

    /// Role to assume before requesting an ECR authorization token.
    #[serde(skip_serializing_if = "Option::is_none")]
    aws_role_arn: Option<String>,

    /// Selects Azure Container Registry authentication.
    #[serde(default)]
    azure_acr: bool,

    /// Azure AD tenant. Discovered from the registry's bearer challenge when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    azure_tenant_id: Option<String>,

    /// Azure AD client id of the identity used for the token exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    azure_client_id: Option<String>,

    /// How the Azure AD token is acquired (`workload_identity` or the default chain).
    #[serde(skip_serializing_if = "Option::is_none")]
    azure_auth_type: Option<String>,

    /// Azure cloud environment override (AzurePublic, AzureGovernment, AzureChina).
    #[serde(skip_serializing_if = "Option::is_none")]
    azure_environment: Option<String>,

    /// GCP project number. Setting this selects workload-identity-federation authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    gcp_project: Option<String>,

    /// Workload identity pool the AWS caller identity federates into.
    #[serde(skip_serializing_if = "Option::is_none")]
    gcp_workload_identity_pool: Option<String>,

    /// Provider inside the workload identity pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    gcp_workload_identity_provider: Option<String>,

    /// Service account the federated token is exchanged for.
    #[serde(skip_serializing_if = "Option::is_none")]
    gcp_service_account: Option<String>,

    /// Alternate registry consulted before the origin, for the default registry only.
    #[serde(skip_serializing_if = "Option::is_none")]
    registry_mirror: Option<RegistryMirror>,

    /// Additional PEM-encoded certificates trusted for registry connections.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    domain_certs: Vec<String>,

    /// Permits plaintext HTTP and disables TLS verification.
    #[serde(default)]
    insecure: bool,

    /// Opaque configuration for the post-push signing callback.
    #[serde(skip_serializing_if = "Option::is_none")]
    content_trust: Option<serde_json::Value>,
}

/// An alternate registry host consulted before the origin registry.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(deny_unknown_fields)]
pub struct RegistryMirror {
    /// Host (and optional port) of the mirror.
    host: String,

    /// Username for the mirror, if it requires basic authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,

    /// Password for the mirror.
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

/// A tag value that accepts JSON strings and JSON numbers.
///
/// Numeric tags unmarshal to their canonical decimal string representation and
/// remarshal identically, so a source whose tag is `42.1` round-trips as the
/// string `"42.1"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag(String);

/// The version cursor passed between invocations.
///
/// Repository scans produce tag+digest pairs; single-tag tracking produces
/// digest-only versions. Either form round-trips through JSON unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// The tag the digest was discovered under, when a scan produced it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Content-addressable manifest digest of the form `algo:hex`.
    pub digest: String,
}

/// A name/value pair reported back to the invoker alongside a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataField {
    /// The metadata key.
    pub name: String,

    /// The metadata value.
    pub value: String,
}

/// The on-disk format a fetched image is materialized in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaterializeFormat {
    /// Extract the layers into a `rootfs/` directory.
    #[default]
    #[serde(rename = "rootfs")]
    Rootfs,

    /// Write a round-trippable `image.tar`.
    #[serde(rename = "oci")]
    Oci,

    /// Write an OCI image layout directory at `oci/`.
    #[serde(rename = "oci-layout")]
    OciLayout,
}

/// Parameters of a get invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(deny_unknown_fields)]
pub struct GetParams {
    /// Output format, `rootfs` by default.
    #[serde(default)]
    format: MaterializeFormat,

    /// Operating system to select from a multi-arch index. Defaults to the runtime OS.
    #[serde(skip_serializing_if = "Option::is_none")]
    os: Option<String>,

    /// CPU architecture to select from a multi-arch index. Defaults to the runtime arch.
    #[serde(skip_serializing_if = "Option::is_none")]
    architecture: Option<String>,

    /// Write only the `tag`, `digest`, and `repository` files, skipping the image itself.
    #[serde(default)]
    skip_download: bool,
}

/// Parameters of a put invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(deny_unknown_fields)]
pub struct PutParams {
    /// Glob selecting the image tarball to push. Must match exactly one file.
    image: String,

    /// A semantic version to push the image under, in addition to the source tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,

    /// Also push the alias tags (`latest`, `<major>`, `<major>.<minor>`) the
    /// version is entitled to, judged against the remote tag namespace.
    #[serde(default)]
    bump_aliases: bool,

    /// Path to a whitespace-separated file of further tags to push.
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_tags: Option<PathBuf>,
}

/// An immutable snapshot of the process environment.
///
/// Cloud credential discovery reads environment variables; taking a snapshot at
/// entry keeps that read in one place and lets tests vary the environment
/// without mutating the process.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Source {
    /// The tag that stands in for `latest` during repository scans.
    pub fn bare_tag(&self) -> &str {
        self.variant.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// Parses the configured semver constraint, if any.
    pub fn parsed_semver_constraint(&self) -> RegistryImageResult<Option<VersionReq>> {
        self.semver_constraint
            .as_deref()
            .map(VersionReq::parse)
            .transpose()
            .map_err(RegistryImageError::from)
    }

    /// Whether basic credentials are configured.
    pub fn has_basic_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

impl Tag {
    /// The canonical string form of the tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Version {
    /// Creates a digest-only version.
    pub fn from_digest(digest: impl Into<String>) -> Self {
        Self {
            tag: None,
            digest: digest.into(),
        }
    }

    /// Creates a tag+digest version.
    pub fn new(tag: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            digest: digest.into(),
        }
    }
}

impl MetadataField {
    /// Creates a metadata field.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl EnvSnapshot {
    /// Captures the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Builds a snapshot from explicit variables, for tests.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Looks up a variable in the snapshot.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag(s.to_string())
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TagVisitor;

        impl<'de> de::Visitor<'de> for TagVisitor {
            type Value = Tag;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or a number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Tag, E> {
                Ok(Tag(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Tag, E> {
                Ok(Tag(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Tag, E> {
                Ok(Tag(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Tag, E> {
                Ok(Tag(v.to_string()))
            }
        }

        deserializer.deserialize_any(TagVisitor)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
