//! Fixed-priority preemptive scheduler
//!
//! One FIFO band per priority level plus an occupancy bitmap. Selection is
//! always the head of the most urgent non-empty band, so processes of equal
//! priority round-robin while a more urgent band exists they never run.
//!
//! The context switch itself is split in two: kernel operations only
//! *request* a switch, and the architecture port performs it later at a
//! safe point (PendSV after the last nested interrupt returns) by calling
//! [`Kernel::switch_context`].
//!
//! Author: Moroya Sakamoto

use log::{debug, trace};

use crate::config::PRIORITY_LEVELS;
use crate::kernel::Kernel;
use crate::process::{Pid, Priority, ProcessState, ProcessTable, QueueKey};
use crate::queue::WaitQueue;

/// Ready processes, one band per priority
pub struct ReadyQueue {
    bands: [WaitQueue; PRIORITY_LEVELS],
    /// Bit n set = band n non-empty
    occupied: u32,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            bands: [WaitQueue::new(); PRIORITY_LEVELS],
            occupied: 0,
        }
    }

    /// Append `pid` at the tail of its priority band
    pub fn push(&mut self, table: &mut ProcessTable, pid: Pid) {
        let band = table[pid].priority.band();
        self.bands[band].push_back(table, pid, QueueKey::Ready);
        self.occupied |= 1 << band;
    }

    /// Take `pid` out of its band
    pub fn remove(&mut self, table: &mut ProcessTable, pid: Pid) -> bool {
        let band = table[pid].priority.band();
        let removed = self.bands[band].remove(table, pid);
        if self.bands[band].is_empty() {
            self.occupied &= !(1 << band);
        }
        removed
    }

    /// Most urgent priority with a ready process
    pub fn highest(&self) -> Option<Priority> {
        if self.occupied == 0 {
            None
        } else {
            Some(Priority(self.occupied.trailing_zeros() as u8))
        }
    }

    /// Dequeue the next process to run
    pub fn pop_highest(&mut self, table: &mut ProcessTable) -> Option<Pid> {
        let band = self.highest()?.band();
        let pid = self.bands[band].pop_front(table);
        if self.bands[band].is_empty() {
            self.occupied &= !(1 << band);
        }
        pid
    }

    /// Ready processes at exactly `priority`
    pub fn band(&self, priority: Priority) -> &WaitQueue {
        &self.bands[priority.band()]
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(WaitQueue::len).sum()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Move `pid` to READY and preempt the running process if `pid` is
    /// more urgent.
    ///
    /// A process woken out of a semaphore or port wait (timeout, stray
    /// signal) leaves that queue here; a handoff has already dequeued it.
    pub(crate) fn make_ready(&mut self, pid: Pid) {
        if matches!(
            self.procs[pid].queued,
            Some(QueueKey::Semaphore(_) | QueueKey::Port(_))
        ) {
            self.unlink(pid);
        }
        let p = &mut self.procs[pid];
        p.state = ProcessState::Ready;
        p.waiting = crate::signal::Signals::empty();
        self.ready.push(&mut self.procs, pid);
        trace!("wake {:?}", pid);
        self.preempt_check();
    }

    /// Request a switch if a ready process outranks the running one
    pub(crate) fn preempt_check(&mut self) {
        let Some(best) = self.ready.highest() else {
            return;
        };
        let outranked = match self.current {
            Some(cur) => {
                let p = &self.procs[cur];
                p.state != ProcessState::Running || best < p.priority
            }
            None => true,
        };
        if outranked {
            self.request_switch();
        }
    }

    pub(crate) fn request_switch(&mut self) {
        self.switch_pending = true;
    }

    /// Should the port perform a context switch now?
    ///
    /// False inside interrupt handlers and while preemption is disabled;
    /// the request stays latched until [`Kernel::irq_exit`] or
    /// [`Kernel::preempt_enable`].
    pub fn switch_requested(&self) -> bool {
        self.switch_pending && self.irq_nesting == 0 && self.preempt_lock == 0
    }

    /// Voluntarily give up the rest of the time slice
    pub fn yield_now(&mut self) {
        self.request_switch();
    }

    /// Change a process's priority, taking effect immediately
    pub fn set_priority(&mut self, pid: Pid, priority: Priority) {
        assert!(priority.is_valid(), "invalid priority {:?}", priority);
        let old = self.procs[pid].priority;
        if old == priority {
            return;
        }
        debug!("{:?} priority {:?} -> {:?}", pid, old, priority);

        if self.procs[pid].queued == Some(QueueKey::Ready) {
            self.ready.remove(&mut self.procs, pid);
            self.procs[pid].priority = priority;
            self.ready.push(&mut self.procs, pid);
        } else {
            self.procs[pid].priority = priority;
        }
        self.preempt_check();
    }

    /// Perform the switch decided by the scheduler
    ///
    /// Called by the architecture port with interrupts masked. `saved_sp`
    /// is the stack pointer of the context being switched out (the idle
    /// context when no process was running); the return value is the stack
    /// pointer to resume.
    pub fn switch_context(&mut self, saved_sp: usize) -> usize {
        assert!(self.irq_nesting == 0, "context switch inside an interrupt handler");
        self.switch_pending = false;

        // Switch out
        match self.current.take() {
            Some(pid) => {
                let p = &mut self.procs[pid];
                p.sp = saved_sp;
                self.stats.switches_out += 1;
                if p.state == ProcessState::Running {
                    // Preempted or yielded: back to the tail of its band
                    self.ready.push(&mut self.procs, pid);
                    self.procs[pid].state = ProcessState::Ready;
                }
            }
            None => self.idle_sp = saved_sp,
        }

        // Switch in
        match self.ready.pop_highest(&mut self.procs) {
            Some(pid) => {
                let quantum = self.config.quantum;
                let p = &mut self.procs[pid];
                p.state = ProcessState::Running;
                p.quantum = quantum;
                p.switches += 1;
                self.current = Some(pid);
                self.stats.switches_in += 1;
                trace!("switch to {:?} ({})", pid, p.name());
                p.sp
            }
            None => {
                trace!("switch to idle");
                self.idle_sp
            }
        }
    }

    /// Charge one tick to the running process's time slice
    pub(crate) fn charge_quantum(&mut self) {
        if self.config.quantum == 0 {
            return;
        }
        let Some(cur) = self.current else {
            return;
        };
        let p = &mut self.procs[cur];
        if p.state != ProcessState::Running {
            return;
        }
        p.quantum = p.quantum.saturating_sub(1);
        if p.quantum == 0 && !self.ready.band(p.priority).is_empty() {
            self.request_switch();
        }
    }
}
