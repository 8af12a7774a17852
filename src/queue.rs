//! Wait queues — intrusive FIFO lists of processes
//!
//! Each process control block carries a single `link` field, so a queue is
//! just a head/tail pair and costs no storage per element. A process can sit
//! in at most one queue at a time; the kernel asserts it on every insert.
//!
//! Author: Moroya Sakamoto

use crate::process::{Pid, ProcessTable, QueueKey};

/// FIFO of processes threaded through the process table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitQueue {
    head: Option<Pid>,
    tail: Option<Pid>,
    len: u8,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// First process in the queue
    pub fn front(&self) -> Option<Pid> {
        self.head
    }

    /// Append `pid`, tagging it as a member of `key`
    pub fn push_back(&mut self, table: &mut ProcessTable, pid: Pid, key: QueueKey) {
        let p = &mut table[pid];
        assert!(
            p.queued.is_none(),
            "process {:?} already queued on {:?}",
            pid,
            p.queued
        );
        p.queued = Some(key);
        p.link = None;

        match self.tail {
            Some(tail) => table[tail].link = Some(pid),
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
        self.len += 1;
    }

    /// Unlink and return the head
    pub fn pop_front(&mut self, table: &mut ProcessTable) -> Option<Pid> {
        let head = self.head?;
        let p = &mut table[head];
        self.head = p.link.take();
        p.queued = None;
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Unlink `pid` from anywhere in the queue
    ///
    /// Returns false if it was not a member.
    pub fn remove(&mut self, table: &mut ProcessTable, pid: Pid) -> bool {
        let mut prev: Option<Pid> = None;
        let mut cursor = self.head;

        while let Some(cur) = cursor {
            if cur == pid {
                let next = table[cur].link.take();
                table[cur].queued = None;
                match prev {
                    Some(prev) => table[prev].link = next,
                    None => self.head = next,
                }
                if self.tail == Some(pid) {
                    self.tail = prev;
                }
                self.len -= 1;
                return true;
            }
            prev = cursor;
            cursor = table[cur].link;
        }
        false
    }

    pub fn contains(&self, table: &ProcessTable, pid: Pid) -> bool {
        self.iter(table).any(|p| p == pid)
    }

    /// Walk the queue front to back
    pub fn iter<'a>(&self, table: &'a ProcessTable) -> Iter<'a> {
        Iter {
            table,
            cursor: self.head,
        }
    }
}

pub struct Iter<'a> {
    table: &'a ProcessTable,
    cursor: Option<Pid>,
}

impl Iterator for Iter<'_> {
    type Item = Pid;

    fn next(&mut self) -> Option<Pid> {
        let cur = self.cursor?;
        self.cursor = self.table[cur].link;
        Some(cur)
    }
}
