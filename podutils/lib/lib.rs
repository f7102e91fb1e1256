//! `podutils` is a library containing general runtime utilities for the podcore project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod log;
pub mod path;
pub mod runtime;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use log::*;
pub use path::*;
pub use runtime::*;
