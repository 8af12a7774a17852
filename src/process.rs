//! Process definition — schedulable contexts over caller-owned stacks
//!
//! A process is an entry point, a fixed priority and a stack the creator
//! hands over for the lifetime of the process. The kernel never allocates
//! stack memory; `Kernel::reap` gives the storage back.
//!
//! Author: Moroya Sakamoto

use core::ops::{Index, IndexMut};

use heapless::String;

use crate::config::{MAX_PROCESSES, NAME_LEN, PRIORITY_LEVELS, STACK_FILL};
use crate::port::{MsgId, PortId};
use crate::semaphore::SemId;
use crate::signal::Signals;
use crate::timer::Deadline;

/// Process entry point
pub type EntryFn = fn();

/// Process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub(crate) u8);

impl Pid {
    /// Slot index in the process table
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Process priority (lower number = more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent priority (interrupt bottom halves)
    pub const HIGHEST: Priority = Priority(0);
    /// High priority (protocol timers, drivers)
    pub const HIGH: Priority = Priority(2);
    /// Normal priority (application processes)
    pub const NORMAL: Priority = Priority(4);
    /// Low priority (logging, housekeeping)
    pub const LOW: Priority = Priority(6);
    /// Least urgent priority
    pub const LOWEST: Priority = Priority(PRIORITY_LEVELS as u8 - 1);

    /// Is this priority inside the scheduler's bands?
    pub fn is_valid(self) -> bool {
        (self.0 as usize) < PRIORITY_LEVELS
    }

    /// Ready band index
    pub fn band(self) -> usize {
        self.0 as usize
    }
}

/// Process execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Queued in the ready queue
    Ready,
    /// Currently executing
    Running,
    /// Blocked in a signal wait
    Waiting,
    /// Blocked until a deadline
    Sleeping,
    /// Terminated, waiting to be reaped
    Zombie,
}

/// Queue a process is currently linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKey {
    Ready,
    Semaphore(SemId),
    Port(PortId),
}

/// Capacity handed to a blocked process by the releasing side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// One semaphore unit
    Unit(SemId),
    /// A message taken straight off a port
    Message(MsgId),
}

/// Process control block
pub struct Process {
    /// Name (truncated to `NAME_LEN` bytes)
    pub(crate) name: String<NAME_LEN>,
    /// Entry point
    pub(crate) entry: EntryFn,
    /// Scheduling priority
    pub(crate) priority: Priority,
    /// Current state
    pub(crate) state: ProcessState,
    /// Caller-owned stack region
    pub(crate) stack: &'static mut [u8],
    /// Saved stack pointer while switched out
    pub(crate) sp: usize,
    /// Pending signals
    pub(crate) pending: Signals,
    /// Signals this process is blocked on
    pub(crate) waiting: Signals,
    /// Armed one-shot timer (timeout or sleep)
    pub(crate) deadline: Option<Deadline>,
    /// Next process in the queue this one is linked into
    pub(crate) link: Option<Pid>,
    /// Which queue `link` belongs to
    pub(crate) queued: Option<QueueKey>,
    /// Capacity granted while blocked, not yet picked up
    pub(crate) handoff: Option<Handoff>,
    /// Ticks left in the current time slice
    pub(crate) quantum: u32,
    /// Times switched in
    pub(crate) switches: u32,
}

impl Process {
    pub(crate) fn new(name: &str, entry: EntryFn, stack: &'static mut [u8], priority: Priority) -> Self {
        let mut n = String::new();
        for c in name.chars() {
            if n.push(c).is_err() {
                break;
            }
        }

        Self {
            name: n,
            entry,
            priority,
            state: ProcessState::Ready,
            stack,
            sp: 0,
            pending: Signals::empty(),
            waiting: Signals::empty(),
            deadline: None,
            link: None,
            queued: None,
            handoff: None,
            quantum: 0,
            switches: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> EntryFn {
        self.entry
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pending(&self) -> Signals {
        self.pending
    }

    pub fn switches(&self) -> u32 {
        self.switches
    }

    /// Stack bytes never touched since spawn
    ///
    /// Stacks grow down, so the untouched fill pattern sits at the bottom.
    pub fn stack_free(&self) -> usize {
        self.stack.iter().take_while(|&&b| b == STACK_FILL).count()
    }

    /// Stack size in bytes
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }
}

/// 8-byte aligned stack storage
#[repr(C, align(8))]
pub struct Stack<const N: usize>([u8; N]);

impl<const N: usize> Stack<N> {
    pub const fn new() -> Self {
        Self([0u8; N])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const N: usize> Default for Stack<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Static process table, indexed by [`Pid`]
pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCESSES],
}

impl ProcessTable {
    pub const fn new() -> Self {
        const EMPTY: Option<Process> = None;
        Self {
            slots: [EMPTY; MAX_PROCESSES],
        }
    }

    /// Claim a free slot
    pub(crate) fn insert(&mut self, process: Process) -> Option<Pid> {
        let pid = self.vacant()?;
        self.occupy(pid, process);
        Some(pid)
    }

    /// First free slot, if any
    pub(crate) fn vacant(&self) -> Option<Pid> {
        let idx = self.slots.iter().position(Option::is_none)?;
        Some(Pid(idx as u8))
    }

    /// Fill a slot found by [`ProcessTable::vacant`]
    pub(crate) fn occupy(&mut self, pid: Pid, process: Process) {
        let slot = &mut self.slots[pid.index()];
        assert!(slot.is_none(), "slot {:?} already taken", pid);
        *slot = Some(process);
    }

    /// Release a slot
    pub(crate) fn remove(&mut self, pid: Pid) -> Process {
        match self.slots[pid.index()].take() {
            Some(process) => process,
            None => panic!("stale process handle {:?}", pid),
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.index())?.as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.index())?.as_mut()
    }

    /// Handles of all live processes
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| Pid(i as u8))
    }

    /// Number of live processes
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<Pid> for ProcessTable {
    type Output = Process;

    fn index(&self, pid: Pid) -> &Process {
        match self.get(pid) {
            Some(process) => process,
            None => panic!("stale process handle {:?}", pid),
        }
    }
}

impl IndexMut<Pid> for ProcessTable {
    fn index_mut(&mut self, pid: Pid) -> &mut Process {
        match self.get_mut(pid) {
            Some(process) => process,
            None => panic!("stale process handle {:?}", pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stack;

    fn dummy() {}

    #[test]
    fn test_process_creation() {
        let p = Process::new("netif", dummy, stack(256), Priority::HIGH);
        assert_eq!(p.name(), "netif");
        assert_eq!(p.priority(), Priority::HIGH);
        assert_eq!(p.state(), ProcessState::Ready);
        assert!(p.pending().is_empty());
    }

    #[test]
    fn test_name_truncated() {
        let p = Process::new("tcpip_thread", dummy, stack(256), Priority::NORMAL);
        assert_eq!(p.name(), "tcpip_th");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::HIGHEST < Priority::HIGH);
        assert!(Priority::HIGH < Priority::NORMAL);
        assert!(Priority::NORMAL < Priority::LOW);
        assert!(Priority::LOW < Priority::LOWEST);
        assert!(Priority::LOWEST.is_valid());
        assert!(!Priority(PRIORITY_LEVELS as u8).is_valid());
    }

    #[test]
    fn test_table_insert_remove() {
        let mut table = ProcessTable::new();
        let a = table.insert(Process::new("a", dummy, stack(64), Priority::NORMAL)).unwrap();
        let b = table.insert(Process::new("b", dummy, stack(64), Priority::NORMAL)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        table.remove(a);
        assert!(table.get(a).is_none());
        // Freed slot is reused
        let c = table.insert(Process::new("c", dummy, stack(64), Priority::NORMAL)).unwrap();
        assert_eq!(c, a);
        assert_eq!(table[c].name(), "c");
    }

    #[test]
    fn test_table_full() {
        let mut table = ProcessTable::new();
        for _ in 0..MAX_PROCESSES {
            assert!(table.insert(Process::new("p", dummy, stack(64), Priority::LOW)).is_some());
        }
        assert!(table.insert(Process::new("p", dummy, stack(64), Priority::LOW)).is_none());
    }

    #[test]
    #[should_panic(expected = "stale process handle")]
    fn test_stale_handle_panics() {
        let table = ProcessTable::new();
        let _ = &table[Pid(3)];
    }

    #[test]
    fn test_stack_alignment() {
        let mut s = Stack::<128>::new();
        assert_eq!(s.as_mut_slice().as_ptr() as usize % 8, 0);
        assert_eq!(s.as_mut_slice().len(), 128);
    }
}
