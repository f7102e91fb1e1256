//! The hypervisor monitor protocol: line-delimited JSON commands with
//! queued atomic sessions and out-of-band fd passing.

mod command;
mod engine;
mod frame;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use command::*;
pub use engine::*;
pub use frame::*;
