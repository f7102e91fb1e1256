//! User-supplied pod specs and the resolved, VM-facing guest specs derived from them.

mod guest;
mod pod;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use guest::*;
pub use pod::*;
