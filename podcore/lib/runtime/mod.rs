//! Hypervisor process launch and supervision.

mod launch;
mod monitor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use launch::*;
pub use monitor::*;
