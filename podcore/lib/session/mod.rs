//! The per-pod VM session: the hub event queue, its single-consumer state
//! machine, and the bookkeeping it owns.

mod address;
mod device;
mod event;
mod handle;
mod machine;
mod provision;
mod readiness;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use address::*;
pub use device::*;
pub use event::*;
pub use handle::*;
pub use machine::*;
pub use provision::*;
pub use readiness::*;
