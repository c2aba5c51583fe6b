//! `registry-image` is a container-registry client plugin that tracks, fetches, and
//! publishes OCI images without a container daemon.
//!
//! # Overview
//!
//! The crate implements the three entry points of the resource pipeline contract:
//!
//! - **check** — discover new versions of a repository, ordered by semver, with
//!   digest-based cursor advancement.
//! - **get** — fetch an image by digest and materialize it as an extracted root
//!   filesystem, an image tarball, or an on-disk OCI layout.
//! - **put** — load an image tarball and push it to a registry under one or more
//!   tags in a single multi-tag write.
//!
//! All registry traffic goes through a retrying HTTP transport that backs off on
//! HTTP 429, and credentials are resolved from the source configuration for
//! anonymous, basic, AWS ECR, Azure ACR, and GCP workload-identity federation
//! access.
//!
//! # Modules
//!
//! - [`config`] - Source configuration, versions, and invocation params
//! - [`auth`] - Registry credential resolution
//! - [`registry`] - OCI distribution client
//! - [`version`] - Tag scanning and semver-ordered version resolution
//! - [`materialize`] - Writing fetched images to the destination directory
//! - [`resource`] - The check/get/put entry points

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod auth;
pub mod config;
pub mod materialize;
pub mod reference;
pub mod registry;
pub mod resource;
pub mod transport;
pub mod version;

pub use error::*;
