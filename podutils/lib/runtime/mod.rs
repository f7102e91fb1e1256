//! `podutils::runtime` is a module containing process supervision utilities for the podcore project.

mod monitor;
mod supervisor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use monitor::*;
pub use supervisor::*;
