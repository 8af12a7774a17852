//! Kestrel — signal-driven preemptive RTOS kernel
//!
//! Everything blocks on signals, everything else is built from them.
//!
//! Concurrency core for small single-core microcontrollers:
//! - Fixed-priority preemptive scheduling, round robin within a band
//! - Per-process signal masks as the only suspension point
//! - Counting semaphores with FIFO handoff
//! - Message ports for request/response IPC between processes and ISRs
//! - An OS shim (mutex, timed semaphore, timed mailbox) for a guest stack
//! - Static tables only: no heap, caller-owned stacks
//!
//! Author: Moroya Sakamoto

#![no_std]

#[cfg(test)]
extern crate std;

pub mod config;
pub mod error;
pub mod timer;
pub mod process;
pub mod queue;
pub mod scheduler;
pub mod signal;
pub mod kernel;
pub mod semaphore;
pub mod port;
pub mod arch;
pub mod sys;
pub mod shim;

#[cfg(test)]
mod testing;

pub use config::KernelConfig;
pub use error::{Error, Result, SpawnError};
pub use kernel::{Kernel, KernelStats};
pub use port::{MsgId, PortEvent, PortId};
pub use process::{EntryFn, Pid, Priority, Process, ProcessState, Stack};
pub use semaphore::SemId;
pub use signal::Signals;
pub use timer::{Deadline, SysTimer, Ticks, TimedOut};
