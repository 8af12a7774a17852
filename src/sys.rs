//! The boot-time kernel instance
//!
//! One [`Kernel`] per system, created by [`init`] and reachable from
//! processes, interrupt handlers and the architecture port. Every access
//! masks interrupts for its duration, so each call into the kernel is one
//! indivisible critical section.
//!
//! Blocking calls loop over a re-pollable kernel step: a `Pending` step has
//! already moved the caller out of RUNNING, so pending the switch hands the
//! CPU away, and the step is polled again when the process is resumed.
//!
//! Author: Moroya Sakamoto

use core::cell::RefCell;
use core::task::Poll;

use critical_section::Mutex;

use crate::arch;
use crate::config::KernelConfig;
use crate::error::SpawnError;
use crate::kernel::Kernel;
use crate::process::{EntryFn, Pid, Priority};
use crate::signal::Signals;
use crate::timer::{Deadline, Ticks};

static KERNEL: Mutex<RefCell<Option<Kernel>>> = Mutex::new(RefCell::new(None));

/// Create the kernel instance
///
/// Returns false if it already exists.
pub fn init(config: KernelConfig) -> bool {
    critical_section::with(|cs| {
        let mut kernel = KERNEL.borrow_ref_mut(cs);
        if kernel.is_some() {
            false
        } else {
            *kernel = Some(Kernel::new(config));
            log::info!("kernel initialized ({} Hz tick)", config.tick_hz);
            true
        }
    })
}

/// Run `f` on the kernel with interrupts masked
pub fn with<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    critical_section::with(|cs| {
        let mut kernel = KERNEL.borrow_ref_mut(cs);
        let Some(kernel) = kernel.as_mut() else {
            panic!("kernel not initialized");
        };
        f(kernel)
    })
}

/// Run a kernel operation from process context, switching away afterwards
/// if it made a more urgent process ready
pub fn call<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let (ret, due) = with(|k| {
        let ret = f(k);
        (ret, k.switch_requested())
    });
    if due {
        arch::pend_switch();
    }
    ret
}

/// Run an interrupt handler body
///
/// Switches requested inside are deferred until the outermost handler
/// returns.
pub fn isr<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let (ret, due) = with(|k| {
        k.irq_enter();
        let ret = f(k);
        (ret, k.irq_exit())
    });
    if due {
        arch::pend_switch();
    }
    ret
}

/// Drive a blocking kernel step to completion
///
/// A step that completes may still have readied a more urgent process (a
/// fetch recycling into a full mailbox, a post handing off to a receiver);
/// the switch is pended before returning, as in [`call`].
pub fn block_on<T>(mut step: impl FnMut(&mut Kernel) -> Poll<T>) -> T {
    loop {
        let (poll, due) = with(|k| {
            let poll = step(k);
            (poll, k.switch_requested())
        });
        match poll {
            Poll::Ready(value) => {
                if due {
                    arch::pend_switch();
                }
                return value;
            }
            Poll::Pending => arch::pend_switch(),
        }
    }
}

pub fn spawn(
    name: &str,
    entry: EntryFn,
    stack: &'static mut [u8],
    priority: Priority,
) -> Result<Pid, SpawnError> {
    call(|k| k.spawn(name, entry, stack, priority))
}

/// Running process
pub fn current() -> Option<Pid> {
    with(|k| k.current())
}

pub fn yield_now() {
    call(Kernel::yield_now);
}

pub fn set_priority(pid: Pid, priority: Priority) {
    call(|k| k.set_priority(pid, priority));
}

/// Sleep for `ticks`
pub fn sleep(ticks: Ticks) {
    let deadline = with(|k| Deadline::after(k.now(), ticks));
    block_on(|k| k.sleep_until(deadline));
}

pub fn sleep_ms(ms: u32) {
    let ticks = with(|k| k.timer().ms_to_ticks(ms));
    sleep(ticks);
}

/// Block until a signal in `mask` arrives; returns the consumed bits
pub fn sig_wait(mask: Signals) -> Signals {
    block_on(|k| k.sig_wait(mask))
}

pub fn sig_send(pid: Pid, bits: Signals) {
    call(|k| k.sig_send(pid, bits));
}

/// Terminate the calling process
pub fn exit() -> ! {
    with(Kernel::exit_current);
    arch::pend_switch();
    loop {
        arch::idle();
    }
}

/// System tick handler body
pub fn tick_isr() {
    isr(Kernel::tick);
}

/// Context switch entry for the architecture port
pub fn switch(saved_sp: usize) -> usize {
    with(|k| k.switch_context(saved_sp))
}
