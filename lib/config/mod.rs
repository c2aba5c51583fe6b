//! Source configuration, version cursors, and invocation parameters.

mod defaults;
mod source;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use source::*;
