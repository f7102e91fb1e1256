//! The private length-prefixed binary protocol between the control plane and the
//! guest's init process.

mod client;
mod codec;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use codec::*;
