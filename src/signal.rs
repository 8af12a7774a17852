//! Signals — per-process event bits, the only way a process blocks
//!
//! Signals are edge-triggered and auto-clearing. Waiting for a mask blocks
//! until at least one requested bit is pending, then clears and returns
//! exactly the requested bits that were pending. Bits raised before the wait
//! coalesce into a single wake.
//!
//! Semaphores, ports and timed waits all suspend through
//! [`Kernel::sig_wait_until`]; recording the wait mask, checking the pending
//! set and suspending happen in that one call, so a signal delivered by an
//! interrupt can never fall between the check and the suspend.
//!
//! Author: Moroya Sakamoto

use core::task::Poll;

use bitflags::bitflags;
use log::trace;

use crate::kernel::Kernel;
use crate::process::{Pid, ProcessState};
use crate::timer::Deadline;

bitflags! {
    /// Signal mask
    ///
    /// Bits 0..=23 belong to the application, the top byte is reserved for
    /// the kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Signals: u32 {
        const USER0 = 1 << 0;
        const USER1 = 1 << 1;
        const USER2 = 1 << 2;
        const USER3 = 1 << 3;
        const USER4 = 1 << 4;
        const USER5 = 1 << 5;
        const USER6 = 1 << 6;
        const USER7 = 1 << 7;

        /// Cooperative termination request
        const KILL = 1 << 28;
        /// A message was handed over by a port
        const PORT = 1 << 29;
        /// A semaphore unit was handed over
        const SEMAPHORE = 1 << 30;
        /// A timed wait expired
        const TIMEOUT = 1 << 31;

        /// All application-defined bits
        const USER = 0x00FF_FFFF;
        /// Bits only the kernel may raise
        const PRIVATE = Self::PORT.bits() | Self::SEMAPHORE.bits() | Self::TIMEOUT.bits();
    }
}

impl Signals {
    /// Application signal `n` (0..=23)
    pub const fn user(n: u32) -> Self {
        assert!(n < 24, "application signals are bits 0..=23");
        Self::from_bits_retain(1 << n)
    }
}

impl Kernel {
    /// Raise `bits` on `pid`
    ///
    /// Legal from interrupt context: never blocks, never allocates. Wakes the
    /// target if it is waiting for any of `bits`.
    pub fn sig_send(&mut self, pid: Pid, bits: Signals) {
        assert!(
            !bits.intersects(Signals::PRIVATE),
            "reserved kernel signal {:?}",
            bits & Signals::PRIVATE
        );
        self.raise(pid, bits);
    }

    /// Request cooperative termination of `pid`
    pub fn kill(&mut self, pid: Pid) {
        self.raise(pid, Signals::KILL);
    }

    /// Kernel-internal delivery, reserved bits allowed
    pub(crate) fn raise(&mut self, pid: Pid, bits: Signals) {
        let p = &mut self.procs[pid];
        if p.state == ProcessState::Zombie {
            return;
        }
        p.pending |= bits;
        if p.state == ProcessState::Waiting && p.waiting.intersects(bits) {
            self.make_ready(pid);
        }
    }

    /// Block until a signal in `mask` is pending
    pub fn sig_wait(&mut self, mask: Signals) -> Poll<Signals> {
        self.sig_wait_until(mask, None)
    }

    /// Block until a signal in `mask` is pending or `deadline` expires
    ///
    /// Returns the consumed bits, or exactly [`Signals::TIMEOUT`] on expiry.
    /// When a wanted signal and the timeout race, the signal wins and the
    /// late timeout is discarded; the timer is disarmed in the same call
    /// that decides the outcome.
    ///
    /// `Pending` means the caller is now WAITING and a switch is requested.
    /// Poll again with the same arguments once scheduled.
    pub fn sig_wait_until(&mut self, mask: Signals, deadline: Option<Deadline>) -> Poll<Signals> {
        assert!(self.irq_nesting == 0, "blocking call from interrupt context");
        assert!(self.preempt_lock == 0, "blocking call with preemption disabled");
        assert!(!mask.contains(Signals::TIMEOUT), "TIMEOUT is implied by the deadline");
        assert!(!mask.is_empty(), "waiting on an empty mask");

        let now = self.timer.now();
        let pid = self.running_pid();
        self.reclaim_cpu(pid);
        let p = &mut self.procs[pid];

        let hit = p.pending & mask;
        if !hit.is_empty() {
            p.pending.remove(hit);
            if deadline.is_some() {
                p.pending.remove(Signals::TIMEOUT);
            }
            p.deadline = None;
            return Poll::Ready(hit);
        }

        let mut waiting = mask;
        if let Some(deadline) = deadline {
            if p.pending.contains(Signals::TIMEOUT) || deadline.expired(now) {
                p.pending.remove(Signals::TIMEOUT);
                p.deadline = None;
                return Poll::Ready(Signals::TIMEOUT);
            }
            p.deadline = Some(deadline);
            waiting |= Signals::TIMEOUT;
        }

        p.waiting = waiting;
        p.state = ProcessState::Waiting;
        trace!("{:?} waits on {:?}", pid, waiting);
        self.request_switch();
        Poll::Pending
    }

    /// Consume pending signals in `mask` without blocking
    pub fn sig_check(&mut self, mask: Signals) -> Signals {
        let pid = self.running_pid();
        let p = &mut self.procs[pid];
        let hit = p.pending & mask;
        p.pending.remove(hit);
        hit
    }

    /// Fire expired per-process timers
    pub(crate) fn expire_timers(&mut self) {
        let now = self.timer.now();
        for idx in 0..crate::config::MAX_PROCESSES {
            let pid = Pid(idx as u8);
            let Some(p) = self.procs.get_mut(pid) else {
                continue;
            };
            let Some(deadline) = p.deadline else {
                continue;
            };
            if !deadline.expired(now) {
                continue;
            }
            p.deadline = None;
            let state = p.state;
            match state {
                ProcessState::Sleeping => self.make_ready(pid),
                ProcessState::Waiting => self.raise(pid, Signals::TIMEOUT),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::process::Priority;
    use crate::testing::{boot, reschedule};

    #[test]
    fn test_pending_signal_returns_immediately() {
        let (mut k, pids) = boot(&[Priority::NORMAL]);
        k.sig_send(pids[0], Signals::USER1);
        assert_eq!(k.sig_wait(Signals::USER1 | Signals::USER2), Poll::Ready(Signals::USER1));
        assert!(k.process(pids[0]).unwrap().pending().is_empty());
    }

    #[test]
    fn test_only_requested_bits_cleared() {
        let (mut k, pids) = boot(&[Priority::NORMAL]);
        k.sig_send(pids[0], Signals::USER0 | Signals::USER3);
        assert_eq!(k.sig_wait(Signals::USER0), Poll::Ready(Signals::USER0));
        assert_eq!(k.process(pids[0]).unwrap().pending(), Signals::USER3);
    }

    #[test]
    fn test_wait_blocks_then_wakes() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let (a, b) = (pids[0], pids[1]);
        assert_eq!(k.current(), Some(a));

        assert!(k.sig_wait(Signals::USER2).is_pending());
        assert_eq!(k.state(a), ProcessState::Waiting);
        assert_eq!(reschedule(&mut k), Some(b));

        // Non-matching bits do not wake
        k.sig_send(a, Signals::USER0);
        assert_eq!(k.state(a), ProcessState::Waiting);

        k.sig_send(a, Signals::USER2);
        assert_eq!(k.state(a), ProcessState::Ready);
        assert_eq!(reschedule(&mut k), Some(a));
        assert_eq!(k.sig_wait(Signals::USER2), Poll::Ready(Signals::USER2));
        // The unrelated bit is still pending
        assert_eq!(k.process(a).unwrap().pending(), Signals::USER0);
    }

    #[test]
    fn test_signals_coalesce() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let a = pids[0];
        assert!(k.sig_wait(Signals::USER0 | Signals::USER1).is_pending());
        reschedule(&mut k);

        k.sig_send(a, Signals::USER0);
        k.sig_send(a, Signals::USER1);
        assert_eq!(reschedule(&mut k), Some(a));
        assert_eq!(
            k.sig_wait(Signals::USER0 | Signals::USER1),
            Poll::Ready(Signals::USER0 | Signals::USER1)
        );
    }

    #[test]
    fn test_timed_wait_expires() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let a = pids[0];
        let deadline = Deadline::after(k.now(), 3);
        assert!(k.sig_wait_until(Signals::USER0, Some(deadline)).is_pending());
        reschedule(&mut k);

        k.tick();
        k.tick();
        assert_eq!(k.state(a), ProcessState::Waiting);
        k.tick();
        assert_eq!(k.state(a), ProcessState::Ready);
        assert_eq!(reschedule(&mut k), Some(a));
        assert_eq!(k.sig_wait_until(Signals::USER0, Some(deadline)), Poll::Ready(Signals::TIMEOUT));
        assert!(k.process(a).unwrap().pending().is_empty());
    }

    #[test]
    fn test_signal_beats_simultaneous_timeout() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let a = pids[0];
        let deadline = Deadline::after(k.now(), 1);
        assert!(k.sig_wait_until(Signals::USER0, Some(deadline)).is_pending());
        reschedule(&mut k);

        // Timer fires and the signal lands before `a` gets to run
        k.tick();
        k.sig_send(a, Signals::USER0);
        assert_eq!(reschedule(&mut k), Some(a));
        assert_eq!(k.sig_wait_until(Signals::USER0, Some(deadline)), Poll::Ready(Signals::USER0));
        // The losing timeout left nothing behind
        assert!(k.process(a).unwrap().pending().is_empty());
    }

    #[test]
    fn test_signal_disarms_timer() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let a = pids[0];
        let deadline = Deadline::after(k.now(), 2);
        assert!(k.sig_wait_until(Signals::USER0, Some(deadline)).is_pending());
        reschedule(&mut k);

        k.sig_send(a, Signals::USER0);
        assert_eq!(reschedule(&mut k), Some(a));
        assert_eq!(k.sig_wait_until(Signals::USER0, Some(deadline)), Poll::Ready(Signals::USER0));

        for _ in 0..5 {
            k.tick();
        }
        assert!(!k.process(a).unwrap().pending().contains(Signals::TIMEOUT));
    }

    #[test]
    fn test_expired_deadline_does_not_block() {
        let (mut k, _) = boot(&[Priority::NORMAL]);
        let deadline = Deadline::after(k.now(), 0);
        assert_eq!(k.sig_wait_until(Signals::USER0, Some(deadline)), Poll::Ready(Signals::TIMEOUT));
        assert!(!k.switch_requested());
    }

    #[test]
    fn test_sig_check() {
        let (mut k, pids) = boot(&[Priority::NORMAL]);
        assert!(k.sig_check(Signals::USER0).is_empty());
        k.kill(pids[0]);
        assert_eq!(k.sig_check(Signals::KILL | Signals::USER0), Signals::KILL);
        assert!(k.sig_check(Signals::KILL).is_empty());
    }

    #[test]
    fn test_interrupt_wakes_more_urgent_process() {
        // A (priority 5) spins; B (priority 1) waits for an interrupt.
        let mut k = Kernel::new(KernelConfig::default());
        let b = k.spawn("b", crate::testing::noop, crate::testing::stack(256), Priority(1)).unwrap();
        let a = k.spawn("a", crate::testing::noop, crate::testing::stack(256), Priority(5)).unwrap();
        assert_eq!(reschedule(&mut k), Some(b));
        assert!(k.sig_wait(Signals::USER0).is_pending());
        assert_eq!(reschedule(&mut k), Some(a));

        k.irq_enter();
        k.sig_send(b, Signals::USER0);
        // No switch from inside the handler body
        assert!(!k.switch_requested());
        assert!(k.irq_exit());

        // The very next scheduling decision runs B, before A iterates again
        assert_eq!(reschedule(&mut k), Some(b));
        assert_eq!(k.state(a), ProcessState::Ready);
    }

    #[test]
    #[should_panic(expected = "interrupt context")]
    fn test_wait_from_interrupt_panics() {
        let (mut k, _) = boot(&[Priority::NORMAL]);
        k.irq_enter();
        let _ = k.sig_wait(Signals::USER0);
    }

    #[test]
    #[should_panic(expected = "reserved kernel signal")]
    fn test_send_private_bits_panics() {
        let (mut k, pids) = boot(&[Priority::NORMAL]);
        k.sig_send(pids[0], Signals::SEMAPHORE);
    }

    #[test]
    fn test_user_signal_bits() {
        assert_eq!(Signals::user(0), Signals::USER0);
        assert_eq!(Signals::user(23).bits(), 1 << 23);
        assert!(Signals::USER.contains(Signals::user(23)));
        assert!(!Signals::USER.intersects(Signals::KILL | Signals::PRIVATE));
    }
}
