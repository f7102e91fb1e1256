//! Serial line fan-out: one multiplexer per VM console or container tty.

mod multiplexer;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use multiplexer::*;
