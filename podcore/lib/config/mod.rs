//! Configuration types for podcore VM sessions.

mod builder;
mod defaults;
mod vm;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use defaults::*;
pub use vm::*;
