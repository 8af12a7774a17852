//! Host port
//!
//! Builds the kernel on the development machine. Frames are laid out like a
//! real port's so stack sizing and the stack monitor behave the same, but
//! nothing ever resumes them: tests drive `Kernel::switch_context` directly.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::process::EntryFn;

const WORD: usize = core::mem::size_of::<usize>();

/// Initial context frame: eight callee-saved registers, then the
/// exception-style frame (r0-r3, r12, lr, pc, psr)
pub const CONTEXT_FRAME_SIZE: usize = 16 * WORD;

/// Smallest stack a process may be spawned on
pub const MIN_STACK_SIZE: usize = 2 * CONTEXT_FRAME_SIZE;

/// Lay out the first frame of a process at the top of `stack`
///
/// Returns the initial saved stack pointer.
pub fn init_frame(stack: &mut [u8], entry: EntryFn) -> usize {
    let offset = stack.len() - CONTEXT_FRAME_SIZE;
    let mut frame = [0usize; 16];
    frame[8] = entry as usize;
    frame[14] = process_start as usize;
    super::write_words(stack, offset, &frame);
    stack.as_ptr() as usize + offset
}

/// First code a process would run: its entry point, then exit
fn process_start(entry: EntryFn) {
    entry();
    crate::sys::exit();
}

static PENDED: AtomicUsize = AtomicUsize::new(0);

/// No interrupt controller to pend on the host; the request is only counted
pub fn pend_switch() {
    PENDED.fetch_add(1, Ordering::Relaxed);
}

/// Switches pended since boot
pub fn pended_switches() -> usize {
    PENDED.load(Ordering::Relaxed)
}

pub fn idle() {
    core::hint::spin_loop();
}
