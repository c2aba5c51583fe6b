//! OCI distribution client: tag listing, manifest and blob transfer, and
//! multi-tag pushes.

mod client;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use types::*;
