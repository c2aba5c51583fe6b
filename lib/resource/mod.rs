//! The check, get, and put entry points and their wire types.

mod check;
mod get;
mod put;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::{GetParams, MetadataField, PutParams, Source, Version},
    RegistryImageResult,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use check::*;
pub use get::*;
pub use put::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The stdin payload of a check invocation.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    /// The source configuration.
    pub source: Source,

    /// The cursor from the previous check, if any.
    #[serde(default)]
    pub version: Option<Version>,
}

/// The stdin payload of a get invocation.
#[derive(Debug, Deserialize)]
pub struct GetRequest {
    /// The source configuration.
    pub source: Source,

    /// The version to fetch. Get is digest-driven, never tag-driven.
    pub version: Version,

    /// Optional fetch parameters.
    #[serde(default)]
    pub params: GetParams,
}

/// The stdin payload of a put invocation.
#[derive(Debug, Deserialize)]
pub struct PutRequest {
    /// The source configuration.
    pub source: Source,

    /// The push parameters.
    pub params: PutParams,
}

/// The stdout payload of get and put invocations.
#[derive(Debug, Serialize)]
pub struct ResourceResponse {
    /// The version that was fetched or produced.
    pub version: Version,

    /// Metadata reported back to the invoker.
    pub metadata: Vec<MetadataField>,
}

/// The post-push signing callback.
///
/// Signing is outside the core: the callback receives the pushed repository,
/// tag, and digest with whatever opaque configuration its implementation was
/// built from. Failures are logged and never fail the push.
#[async_trait]
pub trait ContentTrustSigner {
    /// Signs one pushed tag.
    async fn sign(&self, repository: &str, tag: &str, digest: &str) -> RegistryImageResult<()>;
}
