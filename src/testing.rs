//! Deterministic kernel simulation for unit tests
//!
//! No process code ever runs: a test plays the part of whichever process is
//! current, calling kernel operations on its behalf, and performs requested
//! context switches with [`reschedule`].
//!
//! Author: Moroya Sakamoto

use std::boxed::Box;
use std::vec;
use std::vec::Vec;

use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::process::{Pid, Priority};

/// Stack storage that lives for the rest of the test run
pub fn stack(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

pub fn noop() {}

/// Kernel with one process per entry of `priorities`, already switched to
/// the most urgent (first spawned among equals)
pub fn boot(priorities: &[Priority]) -> (Kernel, Vec<Pid>) {
    let mut k = Kernel::new(KernelConfig::default());
    let pids = priorities
        .iter()
        .map(|&priority| k.spawn("test", noop, stack(256), priority).unwrap())
        .collect();
    reschedule(&mut k);
    (k, pids)
}

/// Perform a requested context switch, as the port would on interrupt
/// return; returns the process now running
pub fn reschedule(k: &mut Kernel) -> Option<Pid> {
    if k.switch_requested() {
        let saved = match k.current() {
            Some(pid) => k.saved_sp(pid),
            None => k.idle_sp,
        };
        k.switch_context(saved);
    }
    k.current()
}
