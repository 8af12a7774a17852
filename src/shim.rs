//! OS abstraction layer for the guest network stack
//!
//! The guest expects a generic RTOS surface: a mutex, a counting semaphore
//! with bounded wait, a mailbox of pointers with bounded wait, thread
//! creation and a millisecond clock. Each object here wraps kernel handles
//! only, so it is `Copy` and can be shared between processes freely; all of
//! its state lives in the kernel tables.
//!
//! Every bounded wait arms the waiting process's own one-shot timer through
//! a [`Wait`] token. Which of the wakeup and the timeout won is decided in
//! the same kernel call that disarms the timer, so a late release or post
//! racing a timeout is neither lost nor delivered twice.
//!
//! The `poll_*` forms take the kernel explicitly and never block; the plain
//! forms block the calling process through [`crate::sys`].
//!
//! Author: Moroya Sakamoto

use core::task::Poll;

use log::warn;

use crate::config::KernelConfig;
use crate::error::{Error, Result, SpawnError};
use crate::kernel::Kernel;
use crate::port::{PortEvent, PortId};
use crate::process::{EntryFn, Pid, Priority};
use crate::semaphore::SemId;
use crate::sys;
use crate::timer::{Deadline, SysTimer, Ticks, TimedOut};

/// Upper bound of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    Ticks(Ticks),
}

impl Timeout {
    /// Guest convention: 0 ms waits forever
    pub fn from_millis(ms: u32, config: &KernelConfig) -> Self {
        if ms == 0 {
            Timeout::Forever
        } else {
            Timeout::Ticks(SysTimer::new(config.tick_hz).ms_to_ticks(ms))
        }
    }
}

/// One bounded wait in progress, owned by the waiting process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wait {
    start: Ticks,
    deadline: Option<Deadline>,
}

impl Wait {
    fn begin(k: &Kernel, timeout: Timeout) -> Self {
        let start = k.now();
        let deadline = match timeout {
            Timeout::Forever => None,
            Timeout::Ticks(ticks) => Some(Deadline::after(start, ticks)),
        };
        Self { start, deadline }
    }

    /// Milliseconds since the wait began
    fn elapsed_ms(&self, k: &Kernel) -> u64 {
        k.timer().ticks_to_ms(k.now() - self.start)
    }
}

/// Outcome of [`Semaphore::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled { elapsed: u64 },
    TimedOut,
}

/// Outcome of [`Mailbox::fetch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetched {
    Message { payload: usize, elapsed: u64 },
    TimedOut,
}

/// Binary semaphore used for mutual exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex {
    sem: SemId,
}

impl Mutex {
    pub fn new(k: &mut Kernel) -> Result<Self> {
        Ok(Self { sem: k.sem_create(1)? })
    }

    pub fn poll_acquire(&self, k: &mut Kernel) -> Poll<()> {
        k.sem_obtain(self.sem)
    }

    pub fn acquire(&self) {
        sys::block_on(|k| self.poll_acquire(k));
    }

    pub fn try_acquire(&self, k: &mut Kernel) -> bool {
        k.sem_attempt(self.sem)
    }

    pub fn release(&self, k: &mut Kernel) {
        k.sem_release(self.sem);
    }

    /// Release from process context, yielding to a more urgent waiter
    pub fn unlock(&self) {
        sys::call(|k| self.release(k));
    }

    pub fn free(self, k: &mut Kernel) {
        k.sem_destroy(self.sem);
    }
}

/// Counting semaphore with bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    sem: SemId,
}

impl Semaphore {
    pub fn new(k: &mut Kernel, count: u32) -> Result<Self> {
        Ok(Self { sem: k.sem_create(count)? })
    }

    /// Legal from interrupt context
    pub fn signal(&self, k: &mut Kernel) {
        k.sem_release(self.sem);
    }

    /// Signal from process context, yielding to a more urgent waiter
    pub fn give(&self) {
        sys::call(|k| self.signal(k));
    }

    pub fn begin_wait(&self, k: &Kernel, timeout: Timeout) -> Wait {
        Wait::begin(k, timeout)
    }

    pub fn poll_wait(&self, k: &mut Kernel, wait: &Wait) -> Poll<WaitResult> {
        k.sem_obtain_until(self.sem, wait.deadline)
            .map(|outcome| match outcome {
                Ok(()) => WaitResult::Signaled {
                    elapsed: wait.elapsed_ms(k),
                },
                Err(TimedOut) => WaitResult::TimedOut,
            })
    }

    /// Block until signaled or `timeout` expires
    pub fn wait(&self, timeout: Timeout) -> WaitResult {
        let wait = sys::with(|k| self.begin_wait(k, timeout));
        sys::block_on(|k| self.poll_wait(k, &wait))
    }

    pub fn free(self, k: &mut Kernel) {
        k.sem_destroy(self.sem);
    }
}

/// Bounded queue of pointer-sized values
///
/// Backed by two ports: `port` carries posted messages, `spare` holds the
/// empty ones. A full mailbox is one whose spare port is empty, so a
/// blocking post simply waits on `spare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox {
    port: PortId,
    spare: PortId,
}

impl Mailbox {
    /// Mailbox holding up to `capacity` values
    pub fn new(k: &mut Kernel, capacity: usize) -> Result<Self> {
        let port = k.port_create(PortEvent::None)?;
        let spare = match k.port_create(PortEvent::None) {
            Ok(spare) => spare,
            Err(e) => {
                k.port_destroy(port);
                return Err(e);
            }
        };
        let mbox = Self { port, spare };
        for _ in 0..capacity {
            match k.msg_create(0, None) {
                Ok(msg) => k.port_put(spare, msg),
                Err(e) => {
                    mbox.free(k);
                    return Err(e);
                }
            }
        }
        Ok(mbox)
    }

    /// Post without blocking
    pub fn try_post(&self, k: &mut Kernel, payload: usize) -> Result<()> {
        let Some(msg) = k.port_try_get(self.spare) else {
            warn!("mailbox {:?} full, dropping post", self.port);
            return Err(Error::MailboxFull);
        };
        k.msg_set_payload(msg, payload);
        k.port_put(self.port, msg);
        Ok(())
    }

    /// [`Mailbox::try_post`] from process context, yielding to a more
    /// urgent receiver
    pub fn post_now(&self, payload: usize) -> Result<()> {
        sys::call(|k| self.try_post(k, payload))
    }

    pub fn poll_post(&self, k: &mut Kernel, payload: usize) -> Poll<()> {
        k.port_get(self.spare).map(|msg| {
            k.msg_set_payload(msg, payload);
            k.port_put(self.port, msg);
        })
    }

    /// Post, blocking while the mailbox is full
    pub fn post(&self, payload: usize) {
        sys::block_on(|k| self.poll_post(k, payload));
    }

    pub fn begin_fetch(&self, k: &Kernel, timeout: Timeout) -> Wait {
        Wait::begin(k, timeout)
    }

    pub fn poll_fetch(&self, k: &mut Kernel, wait: &Wait) -> Poll<Fetched> {
        k.port_get_until(self.port, wait.deadline)
            .map(|outcome| match outcome {
                Ok(msg) => {
                    let payload = self.recycle(k, msg);
                    Fetched::Message {
                        payload,
                        elapsed: wait.elapsed_ms(k),
                    }
                }
                Err(TimedOut) => Fetched::TimedOut,
            })
    }

    /// Block until a value arrives or `timeout` expires
    pub fn fetch(&self, timeout: Timeout) -> Fetched {
        let wait = sys::with(|k| self.begin_fetch(k, timeout));
        sys::block_on(|k| self.poll_fetch(k, &wait))
    }

    /// Take a value if one is queued
    pub fn try_fetch(&self, k: &mut Kernel) -> Option<usize> {
        let msg = k.port_try_get(self.port)?;
        Some(self.recycle(k, msg))
    }

    /// Queued values
    pub fn len(&self, k: &Kernel) -> usize {
        k.port_len(self.port)
    }

    pub fn is_empty(&self, k: &Kernel) -> bool {
        self.len(k) == 0
    }

    /// Read the payload and return the message to the spare pool
    fn recycle(&self, k: &mut Kernel, msg: crate::port::MsgId) -> usize {
        let payload = k.msg_payload(msg);
        k.port_put(self.spare, msg);
        payload
    }

    /// Destroy the mailbox, discarding anything still queued
    pub fn free(self, k: &mut Kernel) {
        let mut dropped = 0;
        while let Some(msg) = k.port_try_get(self.port) {
            k.msg_destroy(msg);
            dropped += 1;
        }
        if dropped > 0 {
            warn!("mailbox {:?} freed with {} queued values", self.port, dropped);
        }
        while let Some(msg) = k.port_try_get(self.spare) {
            k.msg_destroy(msg);
        }
        k.port_destroy(self.port);
        k.port_destroy(self.spare);
    }
}

/// Start a guest thread
pub fn thread_new(
    name: &str,
    entry: EntryFn,
    stack: &'static mut [u8],
    priority: Priority,
) -> Result<Pid, SpawnError> {
    sys::spawn(name, entry, stack, priority)
}

/// Milliseconds since boot
pub fn now_ms() -> u64 {
    sys::with(|k| k.timer().now_ms())
}

/// Short critical section for the guest's own data structures
pub fn protect<R>(f: impl FnOnce() -> R) -> R {
    critical_section::with(|_| f())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{boot, reschedule};
    use crate::process::ProcessState;

    #[test]
    fn test_timeout_from_millis() {
        let config = KernelConfig::default().with_tick_hz(100);
        assert_eq!(Timeout::from_millis(0, &config), Timeout::Forever);
        assert_eq!(Timeout::from_millis(10, &config), Timeout::Ticks(1));
        // Partial ticks round up, never down to zero
        assert_eq!(Timeout::from_millis(1, &config), Timeout::Ticks(1));
        assert_eq!(Timeout::from_millis(25, &config), Timeout::Ticks(3));
    }

    #[test]
    fn test_mutex_excludes() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::NORMAL]);
        let (a, b) = (pids[0], pids[1]);
        let m = Mutex::new(&mut k).unwrap();

        assert_eq!(m.poll_acquire(&mut k), Poll::Ready(()));
        k.yield_now();
        assert_eq!(reschedule(&mut k), Some(b));
        assert!(!m.try_acquire(&mut k));
        assert!(m.poll_acquire(&mut k).is_pending());
        assert_eq!(reschedule(&mut k), Some(a));

        m.release(&mut k);
        k.yield_now();
        assert_eq!(reschedule(&mut k), Some(b));
        assert_eq!(m.poll_acquire(&mut k), Poll::Ready(()));
        m.release(&mut k);
        m.free(&mut k);
    }

    #[test]
    fn test_semaphore_wait_signaled() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let a = pids[0];
        let sem = Semaphore::new(&mut k, 0).unwrap();
        let wait = sem.begin_wait(&k, Timeout::Ticks(10));
        assert!(sem.poll_wait(&mut k, &wait).is_pending());
        reschedule(&mut k);

        for _ in 0..3 {
            k.tick();
        }
        k.irq_enter();
        sem.signal(&mut k);
        assert!(k.irq_exit());
        assert_eq!(reschedule(&mut k), Some(a));
        assert_eq!(
            sem.poll_wait(&mut k, &wait),
            Poll::Ready(WaitResult::Signaled { elapsed: 3 })
        );
    }

    #[test]
    fn test_semaphore_wait_times_out() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let a = pids[0];
        let sem = Semaphore::new(&mut k, 0).unwrap();
        let wait = sem.begin_wait(&k, Timeout::Ticks(2));
        assert!(sem.poll_wait(&mut k, &wait).is_pending());
        reschedule(&mut k);

        k.tick();
        assert_eq!(k.state(a), ProcessState::Waiting);
        k.tick();
        assert_eq!(reschedule(&mut k), Some(a));
        assert_eq!(sem.poll_wait(&mut k, &wait), Poll::Ready(WaitResult::TimedOut));

        // The next wait starts clean
        sem.signal(&mut k);
        let wait = sem.begin_wait(&k, Timeout::Ticks(2));
        assert!(sem.poll_wait(&mut k, &wait).is_ready());
    }

    /// Every ordering of one release against one timer expiry: exactly one
    /// outcome, and the unit is never lost or handed out twice
    #[test]
    fn test_timeout_race_interleavings() {
        for timeout in 1..=3u64 {
            for release_at in 0..=4u64 {
                for release_first in [true, false] {
                    let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
                    let a = pids[0];
                    let sem = Semaphore::new(&mut k, 0).unwrap();
                    let wait = sem.begin_wait(&k, Timeout::Ticks(timeout));
                    assert!(sem.poll_wait(&mut k, &wait).is_pending());
                    reschedule(&mut k);

                    let mut outcome = None;
                    for t in 0..5 {
                        let release = |k: &mut Kernel| {
                            k.irq_enter();
                            sem.signal(k);
                            k.irq_exit();
                        };
                        if t == release_at && release_first {
                            release(&mut k);
                        }
                        k.tick();
                        if t == release_at && !release_first {
                            release(&mut k);
                        }
                        if outcome.is_none() && reschedule(&mut k) == Some(a) {
                            match sem.poll_wait(&mut k, &wait) {
                                Poll::Ready(result) => outcome = Some(result),
                                Poll::Pending => panic!("woken waiter blocked again"),
                            }
                        }
                    }

                    // The tick that expires the wait is number timeout - 1
                    let expiry = timeout - 1;
                    let signal_first = release_at < expiry || (release_at == expiry && release_first);
                    let case = (timeout, release_at, release_first);
                    match outcome {
                        Some(WaitResult::Signaled { .. }) => {
                            assert!(signal_first, "{:?}", case);
                            assert_eq!(k.sem_count(sem.sem), 0, "{:?}", case);
                        }
                        Some(WaitResult::TimedOut) => {
                            assert!(!signal_first, "{:?}", case);
                            assert_eq!(k.sem_count(sem.sem), 1, "{:?}", case);
                        }
                        None => panic!("waiter never resumed {:?}", case),
                    }
                    assert_eq!(k.sem_waiters(sem.sem), 0);
                    assert!(k.process(a).unwrap().pending().is_empty(), "{:?}", case);
                }
            }
        }
    }

    /// Every ordering of one post against one fetch timeout: the value is
    /// either fetched or left queued, never lost or delivered twice
    #[test]
    fn test_mailbox_timeout_race_interleavings() {
        for timeout in 1..=3u64 {
            for post_at in 0..=4u64 {
                for post_first in [true, false] {
                    let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
                    let rx = pids[0];
                    let mbox = Mailbox::new(&mut k, 1).unwrap();
                    let wait = mbox.begin_fetch(&k, Timeout::Ticks(timeout));
                    assert!(mbox.poll_fetch(&mut k, &wait).is_pending());
                    reschedule(&mut k);

                    let post = |k: &mut Kernel| {
                        k.irq_enter();
                        mbox.try_post(k, 0xBEEF).unwrap();
                        k.irq_exit();
                    };
                    let mut outcome = None;
                    for t in 0..5 {
                        if t == post_at && post_first {
                            post(&mut k);
                        }
                        k.tick();
                        if t == post_at && !post_first {
                            post(&mut k);
                        }
                        if outcome.is_none() && reschedule(&mut k) == Some(rx) {
                            match mbox.poll_fetch(&mut k, &wait) {
                                Poll::Ready(fetched) => outcome = Some(fetched),
                                Poll::Pending => panic!("woken receiver blocked again"),
                            }
                        }
                    }

                    let expiry = timeout - 1;
                    let post_wins = post_at < expiry || (post_at == expiry && post_first);
                    let case = (timeout, post_at, post_first);
                    match outcome {
                        Some(Fetched::Message { payload, .. }) => {
                            assert!(post_wins, "{:?}", case);
                            assert_eq!(payload, 0xBEEF, "{:?}", case);
                            assert!(mbox.is_empty(&k), "{:?}", case);
                        }
                        Some(Fetched::TimedOut) => {
                            assert!(!post_wins, "{:?}", case);
                            assert_eq!(mbox.len(&k), 1, "{:?}", case);
                        }
                        None => panic!("receiver never resumed {:?}", case),
                    }
                    assert_eq!(k.port_receivers(mbox.port), 0);
                    assert!(k.process(rx).unwrap().pending().is_empty(), "{:?}", case);
                }
            }
        }
    }

    #[test]
    fn test_mailbox_fifo_and_full() {
        let (mut k, _) = boot(&[Priority::NORMAL]);
        let mbox = Mailbox::new(&mut k, 2).unwrap();
        assert!(mbox.is_empty(&k));
        mbox.try_post(&mut k, 0x100).unwrap();
        mbox.try_post(&mut k, 0x200).unwrap();
        assert_eq!(mbox.try_post(&mut k, 0x300), Err(Error::MailboxFull));
        assert_eq!(mbox.len(&k), 2);

        assert_eq!(mbox.try_fetch(&mut k), Some(0x100));
        // Space freed by the fetch is reusable
        mbox.try_post(&mut k, 0x300).unwrap();
        assert_eq!(mbox.try_fetch(&mut k), Some(0x200));
        assert_eq!(mbox.try_fetch(&mut k), Some(0x300));
        assert_eq!(mbox.try_fetch(&mut k), None);
        mbox.free(&mut k);
    }

    #[test]
    fn test_mailbox_fetch_wakes_on_post() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let (rx, tx) = (pids[0], pids[1]);
        let mbox = Mailbox::new(&mut k, 4).unwrap();

        let wait = mbox.begin_fetch(&k, Timeout::Forever);
        assert!(mbox.poll_fetch(&mut k, &wait).is_pending());
        assert_eq!(reschedule(&mut k), Some(tx));

        assert_eq!(mbox.poll_post(&mut k, 0xBEEF), Poll::Ready(()));
        assert_eq!(reschedule(&mut k), Some(rx));
        assert_eq!(
            mbox.poll_fetch(&mut k, &wait),
            Poll::Ready(Fetched::Message {
                payload: 0xBEEF,
                elapsed: 0
            })
        );
    }

    #[test]
    fn test_mailbox_fetch_times_out() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let rx = pids[0];
        let mbox = Mailbox::new(&mut k, 1).unwrap();
        let wait = mbox.begin_fetch(&k, Timeout::Ticks(1));
        assert!(mbox.poll_fetch(&mut k, &wait).is_pending());
        reschedule(&mut k);

        k.tick();
        assert_eq!(reschedule(&mut k), Some(rx));
        assert_eq!(mbox.poll_fetch(&mut k, &wait), Poll::Ready(Fetched::TimedOut));

        // A post after the timeout stays queued for the next fetch
        mbox.try_post(&mut k, 7).unwrap();
        assert_eq!(mbox.try_fetch(&mut k), Some(7));
    }

    #[test]
    fn test_mailbox_post_blocks_when_full() {
        let (mut k, pids) = boot(&[Priority::NORMAL, Priority::LOW]);
        let (tx, rx) = (pids[0], pids[1]);
        let mbox = Mailbox::new(&mut k, 1).unwrap();

        assert_eq!(mbox.poll_post(&mut k, 1), Poll::Ready(()));
        assert!(mbox.poll_post(&mut k, 2).is_pending());
        assert_eq!(reschedule(&mut k), Some(rx));

        assert_eq!(mbox.try_fetch(&mut k), Some(1));
        assert_eq!(reschedule(&mut k), Some(tx));
        assert_eq!(mbox.poll_post(&mut k, 2), Poll::Ready(()));
        assert_eq!(mbox.len(&k), 1);
    }

    #[test]
    fn test_mailbox_capacity_exhausts_pool() {
        let mut k = Kernel::new(KernelConfig::default());
        assert_eq!(
            Mailbox::new(&mut k, crate::config::MAX_MESSAGES + 1),
            Err(Error::MessagePoolExhausted)
        );
        // Everything allocated on the way was handed back
        for _ in 0..crate::config::MAX_PORTS {
            k.port_create(PortEvent::None).unwrap();
        }
        for _ in 0..crate::config::MAX_MESSAGES {
            k.msg_create(0, None).unwrap();
        }
    }
}
