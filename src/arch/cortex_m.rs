//! ARMv7-M port (Cortex-M3/M4/M7)
//!
//! Processes run on the process stack (PSP), handlers and the kernel on the
//! main stack. The hardware stacks r0-r3, r12, lr, pc and xPSR on exception
//! entry; PendSV pushes r4-r11 below that and hands the resulting stack
//! pointer to the kernel, which returns the one to resume.
//!
//! PendSV and SysTick run at the lowest exception priority, so a pended
//! switch fires only once the last nested handler has returned.
//!
//! Author: Moroya Sakamoto

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;
use cortex_m::register::control::{self, Spsel};
use cortex_m::register::{msp, psp};

use crate::process::EntryFn;

/// r4-r11 plus the hardware exception frame
pub const CONTEXT_FRAME_SIZE: usize = 16 * 4;

/// Smallest stack a process may be spawned on
pub const MIN_STACK_SIZE: usize = 256;

/// Thumb state bit of xPSR
const XPSR_THUMB: usize = 1 << 24;

/// Lay out the first frame of a process at the top of `stack`
///
/// The frame resumes into [`process_start`] with the entry point in r0.
/// Returns the initial PSP.
pub fn init_frame(stack: &mut [u8], entry: EntryFn) -> usize {
    let base = stack.as_ptr() as usize;
    let top = (base + stack.len()) & !7;
    let sp = top - CONTEXT_FRAME_SIZE;

    let mut frame = [0usize; 16];
    // frame[0..8]: r4-r11
    frame[8] = entry as usize; // r0
    frame[13] = 0; // lr: process_start never returns
    frame[14] = (process_start as usize) & !1; // pc
    frame[15] = XPSR_THUMB;
    super::write_words(stack, sp - base, &frame);
    sp
}

extern "C" fn process_start(entry: usize) -> ! {
    // SAFETY: `init_frame` stored an `EntryFn` in r0
    let entry: EntryFn = unsafe { core::mem::transmute::<usize, EntryFn>(entry) };
    entry();
    crate::sys::exit()
}

core::arch::global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "mrs r0, psp",
    "stmdb r0!, {{r4-r11}}",
    // Keep the main stack 8-byte aligned across the call
    "push {{r4, lr}}",
    "bl kestrel_switch",
    "pop {{r4, lr}}",
    "ldmia r0!, {{r4-r11}}",
    "msr psp, r0",
    "bx lr",
);

#[no_mangle]
extern "C" fn kestrel_switch(saved_sp: usize) -> usize {
    crate::sys::switch(saved_sp)
}

/// Request the deferred context switch
pub fn pend_switch() {
    SCB::set_pendsv();
}

pub fn idle() {
    cortex_m::asm::wfi();
}

/// Hand the CPU to the scheduler
///
/// The calling (boot) context becomes the idle context. Arms SysTick at the
/// kernel's tick rate; the application's SysTick handler must call
/// [`crate::sys::tick_isr`].
pub fn start(mut core: cortex_m::Peripherals, core_hz: u32) -> ! {
    let tick_hz = crate::sys::with(|k| k.config().tick_hz);

    critical_section::with(|_| unsafe {
        psp::write(msp::read());
        let mut ctrl = control::read();
        ctrl.set_spsel(Spsel::Psp);
        control::write(ctrl);
        core.SCB.set_priority(SystemHandler::PendSV, 0xFF);
        core.SCB.set_priority(SystemHandler::SysTick, 0xFF);
    });

    core.SYST.set_clock_source(SystClkSource::Core);
    core.SYST.set_reload(core_hz / tick_hz - 1);
    core.SYST.clear_current();
    core.SYST.enable_interrupt();
    core.SYST.enable_counter();

    log::info!("kernel started at {} Hz", tick_hz);
    pend_switch();
    loop {
        idle();
    }
}
