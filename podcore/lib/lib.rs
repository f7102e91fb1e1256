//! `podcore` is a control plane for running pods inside hardware-virtualized sandboxes.
//!
//! # Overview
//!
//! podcore boots one hypervisor process per pod, negotiates its device topology over the
//! hypervisor's monitor protocol, and drives the guest's init process over a private
//! channel protocol. It handles:
//! - VM session lifecycle (boot, device attach, run, exec, shutdown, teardown)
//! - Monitor-protocol command sessions with hotplug of disks and network devices
//! - The guest init channel (start-pod, exec, shutdown)
//! - Serial console and per-container tty fan-out
//! - Process supervision of the hypervisor itself
//!
//! # Architecture
//!
//! Every independently running task — the monitor reader, the init-channel reader, the
//! process watcher, the per-device provisioning routines — communicates exclusively by
//! posting events onto a single buffered hub queue. The session state machine is the
//! sole consumer of that queue and the only place session state is mutated.
//!
//! Image acquisition, filesystem staging, and network address allocation are external
//! collaborators reached through the [`session::PodProvisioner`] and
//! [`session::NetworkAllocator`] traits; they report back asynchronously as hub events.
//!
//! # Modules
//!
//! - [`channel`] - The length-prefixed binary protocol to the guest init process
//! - [`config`] - VM configuration and validation
//! - [`qmp`] - The hypervisor monitor protocol engine
//! - [`runtime`] - Hypervisor process launch and supervision
//! - [`serial`] - Serial console and tty multiplexing
//! - [`session`] - The per-pod session state machine and its bookkeeping
//! - [`spec`] - User pod specs and resolved guest specs

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod channel;
pub mod config;
pub mod qmp;
pub mod runtime;
pub mod serial;
pub mod session;
pub mod spec;

pub use error::*;
