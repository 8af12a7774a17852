//! Counting semaphores with FIFO handoff
//!
//! A release with waiters never bumps the counter: the unit goes straight
//! to the head waiter, which is then woken with [`Signals::SEMAPHORE`]. A
//! process that was queued first is therefore always served first, and no
//! newcomer can barge in between the release and the wakeup.
//!
//! [`Kernel::sem_attempt`] never enqueues; it only succeeds when units are
//! left over after every waiter has been served.
//!
//! Author: Moroya Sakamoto

use core::task::Poll;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::process::{Handoff, ProcessTable, QueueKey};
use crate::queue::WaitQueue;
use crate::signal::Signals;
use crate::timer::{Deadline, TimedOut};

/// Semaphore handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemId(pub(crate) u8);

/// Semaphore state
pub(crate) struct SemaphoreSlot {
    /// Free units
    pub(crate) count: u32,
    /// Processes blocked in obtain, in arrival order
    pub(crate) waiters: WaitQueue,
}

impl Kernel {
    /// Create a semaphore holding `count` units (1 for mutual exclusion)
    pub fn sem_create(&mut self, count: u32) -> Result<SemId> {
        let idx = self
            .sems
            .iter()
            .position(Option::is_none)
            .ok_or(Error::SemaphoreTableFull)?;
        self.sems[idx] = Some(SemaphoreSlot {
            count,
            waiters: WaitQueue::new(),
        });
        Ok(SemId(idx as u8))
    }

    /// Destroy a semaphore
    ///
    /// Destroying a semaphore somebody is blocked on, or whose unit was
    /// handed to a process that has not picked it up yet, is a programming
    /// error.
    pub fn sem_destroy(&mut self, sem: SemId) {
        assert!(
            self.sem_slot(sem).waiters.is_empty(),
            "destroying semaphore {:?} with waiters",
            sem
        );
        let unit = Some(Handoff::Unit(sem));
        assert!(
            !self.procs.pids().any(|pid| self.procs[pid].handoff == unit),
            "destroying semaphore {:?} with an unclaimed unit",
            sem
        );
        self.sems[sem.0 as usize] = None;
        debug!("destroy {:?}", sem);
    }

    pub(crate) fn sem_slot(&self, sem: SemId) -> &SemaphoreSlot {
        match self.sems.get(sem.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("stale semaphore handle {:?}", sem),
        }
    }

    pub(crate) fn sem_slot_mut(&mut self, sem: SemId) -> &mut SemaphoreSlot {
        match self.sems.get_mut(sem.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("stale semaphore handle {:?}", sem),
        }
    }

    /// Wait queue of `sem` borrowed alongside the process table
    pub(crate) fn sem_queue(&mut self, sem: SemId) -> (&mut WaitQueue, &mut ProcessTable) {
        match self.sems.get_mut(sem.0 as usize) {
            Some(Some(slot)) => (&mut slot.waiters, &mut self.procs),
            _ => panic!("stale semaphore handle {:?}", sem),
        }
    }

    /// Free units
    pub fn sem_count(&self, sem: SemId) -> u32 {
        self.sem_slot(sem).count
    }

    /// Processes blocked on `sem`
    pub fn sem_waiters(&self, sem: SemId) -> usize {
        self.sem_slot(sem).waiters.len()
    }

    /// Take a unit, blocking while none is free
    pub fn sem_obtain(&mut self, sem: SemId) -> Poll<()> {
        self.sem_obtain_until(sem, None).map(|outcome| match outcome {
            Ok(()) => (),
            Err(TimedOut) => unreachable!("untimed obtain timed out"),
        })
    }

    /// Take a unit, giving up at `deadline`
    ///
    /// Whichever comes first decides: a waiter leaves the queue the moment
    /// its timer fires, so a later release counts the unit instead, and a
    /// unit handed over before the timer fires is kept even if the deadline
    /// has passed by the time the waiter runs.
    pub fn sem_obtain_until(&mut self, sem: SemId, deadline: Option<Deadline>) -> Poll<Result<(), TimedOut>> {
        let pid = self.running_pid();
        self.reclaim_cpu(pid);

        loop {
            if self.procs[pid].handoff == Some(Handoff::Unit(sem)) {
                let p = &mut self.procs[pid];
                p.handoff = None;
                p.pending.remove(Signals::SEMAPHORE);
                self.finish_wait(pid);
                return Poll::Ready(Ok(()));
            }

            if self.procs[pid].queued == Some(QueueKey::Semaphore(sem)) {
                match self.sig_wait_until(Signals::SEMAPHORE, deadline) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(bits) if bits.contains(Signals::TIMEOUT) => {
                        let (waiters, procs) = self.sem_queue(sem);
                        waiters.remove(procs, pid);
                        trace!("{:?} timed out on {:?}", pid, sem);
                        return Poll::Ready(Err(TimedOut));
                    }
                    // Woken: loop to see whether the unit is ours
                    Poll::Ready(_) => continue,
                }
            }

            // The timer fired first; a unit released since stays counted
            if deadline.is_some() && self.procs[pid].pending.contains(Signals::TIMEOUT) {
                self.finish_wait(pid);
                trace!("{:?} timed out on {:?}", pid, sem);
                return Poll::Ready(Err(TimedOut));
            }

            let slot = self.sem_slot_mut(sem);
            if slot.count > 0 {
                slot.count -= 1;
                self.finish_wait(pid);
                return Poll::Ready(Ok(()));
            }
            if let Some(deadline) = deadline {
                if deadline.expired(self.timer.now()) {
                    self.finish_wait(pid);
                    trace!("{:?} timed out on {:?}", pid, sem);
                    return Poll::Ready(Err(TimedOut));
                }
            }

            // Drop any stale wakeup so the first wait really blocks
            self.procs[pid].pending.remove(Signals::SEMAPHORE);
            let (waiters, procs) = self.sem_queue(sem);
            waiters.push_back(procs, pid, QueueKey::Semaphore(sem));
            trace!("{:?} queued on {:?}", pid, sem);
        }
    }

    /// Take a unit only if one is free right now
    pub fn sem_attempt(&mut self, sem: SemId) -> bool {
        let slot = self.sem_slot_mut(sem);
        if slot.count > 0 {
            slot.count -= 1;
            true
        } else {
            false
        }
    }

    /// Return a unit
    ///
    /// Hands it to the longest-waiting process if there is one, otherwise
    /// increments the counter. Never blocks.
    pub fn sem_release(&mut self, sem: SemId) {
        let (waiters, procs) = self.sem_queue(sem);
        match waiters.pop_front(procs) {
            Some(pid) => {
                self.procs[pid].handoff = Some(Handoff::Unit(sem));
                trace!("{:?} hands unit to {:?}", sem, pid);
                self.raise(pid, Signals::SEMAPHORE);
            }
            None => self.sem_slot_mut(sem).count += 1,
        }
    }
}
