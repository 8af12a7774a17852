//! Message ports — FIFO mailboxes for request/response IPC
//!
//! Messages live in a fixed kernel pool and are passed by handle; the kernel
//! never copies a payload. Ownership moves with every queue transition: a
//! message is held by its creator, queued on exactly one port, or handed to
//! exactly one receiver, never two of these at once.
//!
//! A put that finds a receiver blocked on the port hands the message straight
//! to the head receiver and wakes it with [`Signals::PORT`], the same handoff
//! the semaphores use. Synchronous RPC is built on top: the caller embeds its
//! own reply port in the message, puts it to a service port and gets from the
//! reply port; the service answers with [`Kernel::msg_reply`].
//!
//! Author: Moroya Sakamoto

use core::task::Poll;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::process::{Handoff, Pid, ProcessState, ProcessTable, QueueKey};
use crate::queue::WaitQueue;
use crate::signal::Signals;
use crate::timer::{Deadline, TimedOut};

/// Port handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub(crate) u8);

/// Message handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub(crate) u8);

/// Signal raised on port activity
///
/// Lets an interrupt-driven producer wake a process that multiplexes several
/// sources with one signal wait instead of blocking in a get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    None,
    Signal { process: Pid, signals: Signals },
}

/// Where a message currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgState {
    /// Owned by whoever created or received it
    Held,
    /// Linked into a port's message queue
    Queued(PortId),
    /// Handed to a blocked receiver that has not picked it up yet
    Delivered { port: PortId, to: Pid },
}

pub(crate) struct MessageSlot {
    pub(crate) payload: usize,
    pub(crate) reply: Option<PortId>,
    pub(crate) state: MsgState,
    pub(crate) link: Option<MsgId>,
}

pub(crate) struct PortSlot {
    head: Option<MsgId>,
    tail: Option<MsgId>,
    len: u16,
    /// Processes blocked in get, in arrival order
    pub(crate) receivers: WaitQueue,
    event: PortEvent,
}

impl Kernel {
    /// Allocate a message from the pool
    ///
    /// `payload` is opaque to the kernel (typically an address or an index
    /// into caller storage). `reply` is the port a receiver answers on.
    pub fn msg_create(&mut self, payload: usize, reply: Option<PortId>) -> Result<MsgId> {
        let idx = self
            .msgs
            .iter()
            .position(Option::is_none)
            .ok_or(Error::MessagePoolExhausted)?;
        self.msgs[idx] = Some(MessageSlot {
            payload,
            reply,
            state: MsgState::Held,
            link: None,
        });
        Ok(MsgId(idx as u8))
    }

    /// Return a message to the pool
    pub fn msg_destroy(&mut self, msg: MsgId) {
        let state = self.msg_slot(msg).state;
        assert!(state == MsgState::Held, "destroying {:?} while {:?}", msg, state);
        self.msgs[msg.0 as usize] = None;
    }

    pub fn msg_payload(&self, msg: MsgId) -> usize {
        self.msg_slot(msg).payload
    }

    pub fn msg_set_payload(&mut self, msg: MsgId, payload: usize) {
        self.msg_slot_mut(msg).payload = payload;
    }

    pub fn msg_reply_port(&self, msg: MsgId) -> Option<PortId> {
        self.msg_slot(msg).reply
    }

    fn msg_slot(&self, msg: MsgId) -> &MessageSlot {
        match self.msgs.get(msg.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("stale message handle {:?}", msg),
        }
    }

    fn msg_slot_mut(&mut self, msg: MsgId) -> &mut MessageSlot {
        match self.msgs.get_mut(msg.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("stale message handle {:?}", msg),
        }
    }

    /// Create a port, optionally raising `event` on every put
    ///
    /// The event target must be a live process. It is dropped when that
    /// process terminates.
    pub fn port_create(&mut self, event: PortEvent) -> Result<PortId> {
        if let PortEvent::Signal { process, signals } = event {
            assert!(
                !signals.intersects(Signals::PRIVATE),
                "reserved kernel signal {:?}",
                signals & Signals::PRIVATE
            );
            let live = self
                .procs
                .get(process)
                .is_some_and(|p| p.state != ProcessState::Zombie);
            assert!(live, "port event for dead process {:?}", process);
        }
        let idx = self
            .ports
            .iter()
            .position(Option::is_none)
            .ok_or(Error::PortTableFull)?;
        self.ports[idx] = Some(PortSlot {
            head: None,
            tail: None,
            len: 0,
            receivers: WaitQueue::new(),
            event,
        });
        Ok(PortId(idx as u8))
    }

    /// Destroy an idle port
    ///
    /// Destroying a port with blocked receivers or queued messages is a
    /// programming error.
    pub fn port_destroy(&mut self, port: PortId) {
        let slot = self.port_slot(port);
        assert!(
            slot.receivers.is_empty(),
            "destroying port {:?} with waiters",
            port
        );
        assert!(slot.head.is_none(), "destroying port {:?} with queued messages", port);
        self.ports[port.0 as usize] = None;
        debug!("destroy {:?}", port);
    }

    pub(crate) fn port_slot(&self, port: PortId) -> &PortSlot {
        match self.ports.get(port.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("stale port handle {:?}", port),
        }
    }

    pub(crate) fn port_slot_mut(&mut self, port: PortId) -> &mut PortSlot {
        match self.ports.get_mut(port.0 as usize) {
            Some(Some(slot)) => slot,
            _ => panic!("stale port handle {:?}", port),
        }
    }

    /// Receiver queue of `port` borrowed alongside the process table
    pub(crate) fn port_queue(&mut self, port: PortId) -> (&mut WaitQueue, &mut ProcessTable) {
        match self.ports.get_mut(port.0 as usize) {
            Some(Some(slot)) => (&mut slot.receivers, &mut self.procs),
            _ => panic!("stale port handle {:?}", port),
        }
    }

    /// Queued messages
    pub fn port_len(&self, port: PortId) -> usize {
        self.port_slot(port).len as usize
    }

    /// Processes blocked in get
    pub fn port_receivers(&self, port: PortId) -> usize {
        self.port_slot(port).receivers.len()
    }

    /// Send `msg` to `port`
    ///
    /// Legal from interrupt context. The caller gives up the message.
    pub fn port_put(&mut self, port: PortId, msg: MsgId) {
        let state = self.msg_slot(msg).state;
        assert!(state == MsgState::Held, "putting {:?} while {:?}", msg, state);
        self.deliver(port, msg, false);

        let event = self.port_slot(port).event;
        if let PortEvent::Signal { process, signals } = event {
            self.raise(process, signals);
        }
    }

    /// Detach every port event aimed at `pid`
    pub(crate) fn drop_port_events(&mut self, pid: Pid) {
        for (idx, slot) in self.ports.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            if let PortEvent::Signal { process, .. } = slot.event {
                if process == pid {
                    slot.event = PortEvent::None;
                    debug!("{:?} event to {:?} dropped", PortId(idx as u8), pid);
                }
            }
        }
    }

    /// Hand `msg` to the head receiver, or queue it
    fn deliver(&mut self, port: PortId, msg: MsgId, front: bool) {
        let (receivers, procs) = self.port_queue(port);
        if let Some(pid) = receivers.pop_front(procs) {
            self.msg_slot_mut(msg).state = MsgState::Delivered { port, to: pid };
            self.procs[pid].handoff = Some(Handoff::Message(msg));
            trace!("{:?} hands {:?} to {:?}", port, msg, pid);
            self.raise(pid, Signals::PORT);
            return;
        }

        let m = self.msg_slot_mut(msg);
        m.state = MsgState::Queued(port);
        m.link = None;
        let slot = self.port_slot_mut(port);
        if front {
            let head = slot.head;
            slot.head = Some(msg);
            if head.is_none() {
                slot.tail = Some(msg);
            }
            slot.len += 1;
            self.msg_slot_mut(msg).link = head;
        } else {
            let tail = slot.tail;
            slot.tail = Some(msg);
            if tail.is_none() {
                slot.head = Some(msg);
            }
            slot.len += 1;
            if let Some(tail) = tail {
                self.msg_slot_mut(tail).link = Some(msg);
            }
        }
    }

    /// Put a message handed to a dying receiver back at the head of its port
    pub(crate) fn requeue_front(&mut self, msg: MsgId) {
        let MsgState::Delivered { port, .. } = self.msg_slot(msg).state else {
            panic!("requeueing {:?} that was not delivered", msg);
        };
        self.msg_slot_mut(msg).state = MsgState::Held;
        self.deliver(port, msg, true);
    }

    /// Unlink the head message
    fn dequeue(&mut self, port: PortId) -> Option<MsgId> {
        let slot = self.port_slot_mut(port);
        let msg = slot.head?;
        slot.len -= 1;
        let m = self.msg_slot_mut(msg);
        let next = m.link.take();
        m.state = MsgState::Held;
        let slot = self.port_slot_mut(port);
        slot.head = next;
        if next.is_none() {
            slot.tail = None;
        }
        Some(msg)
    }

    /// Receive the next message, blocking while the port is empty
    pub fn port_get(&mut self, port: PortId) -> Poll<MsgId> {
        self.port_get_until(port, None).map(|outcome| match outcome {
            Ok(msg) => msg,
            Err(TimedOut) => unreachable!("untimed get timed out"),
        })
    }

    /// Receive the next message, giving up at `deadline`
    ///
    /// Whichever comes first decides: a receiver leaves the queue the
    /// moment its timer fires, so a later put queues the message instead,
    /// and a message handed over before the timer fires is received even if
    /// the deadline has passed by the time the receiver runs.
    pub fn port_get_until(
        &mut self,
        port: PortId,
        deadline: Option<Deadline>,
    ) -> Poll<Result<MsgId, TimedOut>> {
        let pid = self.running_pid();
        self.reclaim_cpu(pid);

        loop {
            let handoff = self.procs[pid].handoff;
            if let Some(Handoff::Message(msg)) = handoff {
                if self.msg_slot(msg).state == (MsgState::Delivered { port, to: pid }) {
                    let p = &mut self.procs[pid];
                    p.handoff = None;
                    p.pending.remove(Signals::PORT);
                    self.finish_wait(pid);
                    self.msg_slot_mut(msg).state = MsgState::Held;
                    return Poll::Ready(Ok(msg));
                }
            }

            if self.procs[pid].queued == Some(QueueKey::Port(port)) {
                match self.sig_wait_until(Signals::PORT, deadline) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(bits) if bits.contains(Signals::TIMEOUT) => {
                        let (receivers, procs) = self.port_queue(port);
                        receivers.remove(procs, pid);
                        trace!("{:?} timed out on {:?}", pid, port);
                        return Poll::Ready(Err(TimedOut));
                    }
                    Poll::Ready(_) => continue,
                }
            }

            // The timer fired first; a message put since stays queued
            if deadline.is_some() && self.procs[pid].pending.contains(Signals::TIMEOUT) {
                self.finish_wait(pid);
                trace!("{:?} timed out on {:?}", pid, port);
                return Poll::Ready(Err(TimedOut));
            }

            if let Some(msg) = self.dequeue(port) {
                self.finish_wait(pid);
                return Poll::Ready(Ok(msg));
            }
            if let Some(deadline) = deadline {
                if deadline.expired(self.timer.now()) {
                    self.finish_wait(pid);
                    trace!("{:?} timed out on {:?}", pid, port);
                    return Poll::Ready(Err(TimedOut));
                }
            }

            self.procs[pid].pending.remove(Signals::PORT);
            let (receivers, procs) = self.port_queue(port);
            receivers.push_back(procs, pid, QueueKey::Port(port));
            trace!("{:?} receiving on {:?}", pid, port);
        }
    }

    /// Receive the head message if there is one
    pub fn port_try_get(&mut self, port: PortId) -> Option<MsgId> {
        self.dequeue(port)
    }

    /// Head message, left in place
    pub fn port_peek(&self, port: PortId) -> Option<MsgId> {
        self.port_slot(port).head
    }

    /// Answer a request
    ///
    /// Puts `msg` on its reply port; a message without one stays with the
    /// caller.
    pub fn msg_reply(&mut self, msg: MsgId) {
        if let Some(reply) = self.msg_slot(msg).reply {
            self.port_put(reply, msg);
        }
    }
}
