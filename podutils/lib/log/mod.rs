//! `podutils::log` is a module containing logging utilities for the podcore project.

mod rotating;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use rotating::*;
