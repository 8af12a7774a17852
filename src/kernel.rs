//! Kernel — the single kernel-context value
//!
//! Owns the process table, the ready queue, the semaphore/port/message
//! tables and the time base. Every operation is one `&mut Kernel` call and
//! therefore one critical section; [`crate::sys`] holds the boot instance
//! behind an interrupt-masking mutex.
//!
//! Author: Moroya Sakamoto

use core::task::Poll;

use log::{debug, info};

use crate::arch;
use crate::config::{KernelConfig, MAX_MESSAGES, MAX_PORTS, MAX_SEMAPHORES, STACK_FILL};
use crate::error::{Error, SpawnError};
use crate::port::{MessageSlot, PortSlot};
use crate::process::{EntryFn, Handoff, Pid, Priority, Process, ProcessState, ProcessTable, QueueKey};
use crate::scheduler::ReadyQueue;
use crate::semaphore::SemaphoreSlot;
use crate::signal::Signals;
use crate::timer::{Deadline, SysTimer, Ticks};

/// Kernel context
///
/// Initialized once at boot and never re-entered: all mutation happens with
/// interrupts masked.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    /// Process table
    pub(crate) procs: ProcessTable,
    /// Ready processes
    pub(crate) ready: ReadyQueue,
    /// Running process (None = idle context)
    pub(crate) current: Option<Pid>,
    /// Saved stack pointer of the idle (boot) context
    pub(crate) idle_sp: usize,
    /// A context switch has been requested
    pub(crate) switch_pending: bool,
    /// Interrupt nesting depth
    pub(crate) irq_nesting: u32,
    /// Preemption lock depth
    pub(crate) preempt_lock: u32,
    pub(crate) sems: [Option<SemaphoreSlot>; MAX_SEMAPHORES],
    pub(crate) ports: [Option<PortSlot>; MAX_PORTS],
    pub(crate) msgs: [Option<MessageSlot>; MAX_MESSAGES],
    /// Time base
    pub(crate) timer: SysTimer,
    pub(crate) stats: KernelStats,
}

impl Kernel {
    pub const fn new(config: KernelConfig) -> Self {
        const NO_SEM: Option<SemaphoreSlot> = None;
        const NO_PORT: Option<PortSlot> = None;
        const NO_MSG: Option<MessageSlot> = None;

        Self {
            config,
            procs: ProcessTable::new(),
            ready: ReadyQueue::new(),
            current: None,
            idle_sp: 0,
            switch_pending: false,
            irq_nesting: 0,
            preempt_lock: 0,
            sems: [NO_SEM; MAX_SEMAPHORES],
            ports: [NO_PORT; MAX_PORTS],
            msgs: [NO_MSG; MAX_MESSAGES],
            timer: SysTimer::new(config.tick_hz),
            stats: KernelStats::new(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Create a READY process running `entry` on `stack`
    ///
    /// The stack must hold at least the architecture's initial context
    /// frame; anything smaller is a sizing bug and panics. A full process
    /// table is reported as [`Error::ProcessTableFull`], with the stack
    /// handed back unwritten.
    pub fn spawn(
        &mut self,
        name: &str,
        entry: EntryFn,
        stack: &'static mut [u8],
        priority: Priority,
    ) -> Result<Pid, SpawnError> {
        assert!(
            stack.len() >= arch::MIN_STACK_SIZE,
            "stack of {} bytes below minimum {}",
            stack.len(),
            arch::MIN_STACK_SIZE
        );
        assert!(priority.is_valid(), "invalid priority {:?}", priority);

        let Some(pid) = self.procs.vacant() else {
            return Err(SpawnError {
                error: Error::ProcessTableFull,
                stack,
            });
        };

        stack.fill(STACK_FILL);
        let sp = arch::init_frame(stack, entry);

        let mut process = Process::new(name, entry, stack, priority);
        process.sp = sp;
        self.procs.occupy(pid, process);

        info!("spawn {:?} '{}' priority {}", pid, name, priority.0);
        self.stats.spawned += 1;
        self.make_ready(pid);
        Ok(pid)
    }

    /// Running process
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Running process, for operations only a process may perform
    pub(crate) fn running_pid(&self) -> Pid {
        match self.current {
            Some(pid) => pid,
            None => panic!("no running process"),
        }
    }

    /// Take the CPU back for a process that is polling again
    ///
    /// A process woken between returning `Pending` and being switched out is
    /// already linked into the ready queue; unlink it before it continues.
    pub(crate) fn reclaim_cpu(&mut self, pid: Pid) {
        if self.procs[pid].queued == Some(QueueKey::Ready) {
            self.ready.remove(&mut self.procs, pid);
        }
        let p = &mut self.procs[pid];
        p.state = ProcessState::Running;
        p.waiting = Signals::empty();
    }

    /// Close a bounded wait: disarm the timer and drop a timeout that lost
    /// the race against the wakeup
    pub(crate) fn finish_wait(&mut self, pid: Pid) {
        let p = &mut self.procs[pid];
        p.deadline = None;
        p.pending.remove(Signals::TIMEOUT);
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(pid)
    }

    pub fn state(&self, pid: Pid) -> ProcessState {
        self.procs[pid].state
    }

    pub fn priority(&self, pid: Pid) -> Priority {
        self.procs[pid].priority
    }

    /// Untouched stack bytes of `pid`
    pub fn stack_free(&self, pid: Pid) -> usize {
        self.procs[pid].stack_free()
    }

    /// Stack pointer to resume `pid` at
    pub fn saved_sp(&self, pid: Pid) -> usize {
        self.procs[pid].sp
    }

    /// Number of live processes (zombies included)
    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    /// Sleep until `deadline`
    ///
    /// Re-poll with the same deadline after being scheduled again.
    pub fn sleep_until(&mut self, deadline: Deadline) -> Poll<()> {
        assert!(self.irq_nesting == 0, "blocking call from interrupt context");
        assert!(self.preempt_lock == 0, "blocking call with preemption disabled");
        let pid = self.running_pid();
        self.reclaim_cpu(pid);
        if deadline.expired(self.timer.now()) {
            self.procs[pid].deadline = None;
            return Poll::Ready(());
        }
        let p = &mut self.procs[pid];
        p.deadline = Some(deadline);
        p.state = ProcessState::Sleeping;
        self.request_switch();
        Poll::Pending
    }

    /// Terminate the running process
    ///
    /// Called when a process returns from its entry point. The process
    /// becomes a zombie until reaped; the caller must switch away.
    pub fn exit_current(&mut self) {
        let pid = self.running_pid();
        self.terminate(pid);
    }

    /// Tear down `pid`
    ///
    /// Unlinks it from whatever queue it sits in, disarms its timer, detaches
    /// port events aimed at it and returns any semaphore unit or message
    /// handed to it but not yet picked up. The slot stays allocated as a zombie until [`Kernel::reap`].
    pub fn terminate(&mut self, pid: Pid) {
        if self.procs[pid].state == ProcessState::Zombie {
            return;
        }
        self.unlink(pid);
        self.drop_port_events(pid);

        let handoff = self.procs[pid].handoff.take();
        match handoff {
            Some(Handoff::Unit(sem)) => self.sem_release(sem),
            Some(Handoff::Message(msg)) => self.requeue_front(msg),
            None => {}
        }

        let p = &mut self.procs[pid];
        p.state = ProcessState::Zombie;
        p.deadline = None;
        p.waiting = Signals::empty();
        p.pending = Signals::empty();
        info!("exit {:?} '{}'", pid, p.name());
        self.stats.exited += 1;

        if self.current == Some(pid) {
            self.request_switch();
        }
    }

    /// Remove `pid` from the queue it is linked into
    pub(crate) fn unlink(&mut self, pid: Pid) {
        let queued = self.procs[pid].queued;
        match queued {
            Some(QueueKey::Ready) => {
                self.ready.remove(&mut self.procs, pid);
            }
            Some(QueueKey::Semaphore(sem)) => {
                let (waiters, procs) = self.sem_queue(sem);
                waiters.remove(procs, pid);
            }
            Some(QueueKey::Port(port)) => {
                let (receivers, procs) = self.port_queue(port);
                receivers.remove(procs, pid);
            }
            None => {}
        }
    }

    /// Free a zombie's slot and hand its stack back to the owner
    pub fn reap(&mut self, pid: Pid) -> &'static mut [u8] {
        assert!(
            self.procs[pid].state == ProcessState::Zombie,
            "reaping live process {:?}",
            pid
        );
        assert!(self.current != Some(pid), "reaping the running process");
        let process = self.procs.remove(pid);
        debug!("reap {:?}", pid);
        process.stack
    }

    /// Current time in ticks
    pub fn now(&self) -> Ticks {
        self.timer.now()
    }

    pub fn timer(&self) -> &SysTimer {
        &self.timer
    }

    /// Periodic timer interrupt
    ///
    /// Advances time, fires expired timeouts and sleeps, and charges the
    /// running process's time slice.
    pub fn tick(&mut self) {
        self.timer.advance(1);
        self.stats.ticks += 1;
        self.expire_timers();
        self.charge_quantum();
    }

    /// Enter an interrupt handler
    pub fn irq_enter(&mut self) {
        self.irq_nesting += 1;
    }

    /// Leave an interrupt handler
    ///
    /// Returns true when the outermost handler is leaving and a switch was
    /// requested while inside; the port then pends the switch for the
    /// interrupt return path.
    pub fn irq_exit(&mut self) -> bool {
        assert!(self.irq_nesting > 0, "unbalanced irq_exit");
        self.irq_nesting -= 1;
        self.switch_requested()
    }

    /// Are we inside an interrupt handler?
    pub fn in_interrupt(&self) -> bool {
        self.irq_nesting > 0
    }

    /// Withhold context switches until the matching enable
    pub fn preempt_disable(&mut self) {
        self.preempt_lock += 1;
    }

    /// Re-allow context switches
    ///
    /// Returns true if a switch requested while disabled is now due.
    pub fn preempt_enable(&mut self) -> bool {
        assert!(self.preempt_lock > 0, "unbalanced preempt_enable");
        self.preempt_lock -= 1;
        self.switch_requested()
    }

    /// Execution statistics
    pub fn stats(&self) -> KernelStats {
        KernelStats {
            ready: self.ready.len() as u32,
            ..self.stats
        }
    }
}

/// Kernel execution statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Ticks since boot
    pub ticks: u64,
    /// Context switches into a process
    pub switches_in: u64,
    /// Context switches out of a process
    pub switches_out: u64,
    /// Processes spawned
    pub spawned: u32,
    /// Processes terminated
    pub exited: u32,
    /// Processes currently ready
    pub ready: u32,
}

impl KernelStats {
    const fn new() -> Self {
        Self {
            ticks: 0,
            switches_in: 0,
            switches_out: 0,
            spawned: 0,
            exited: 0,
            ready: 0,
        }
    }
}
