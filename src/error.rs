//! Recoverable kernel errors
//!
//! Only resource exhaustion is recoverable. Broken preconditions (undersized
//! stacks, destroying a primitive with waiters, blocking from an interrupt)
//! leave no safe state to unwind to and are kernel assertions instead.
//!
//! Author: Moroya Sakamoto

use core::fmt;

use snafu::Snafu;

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("process table is full"))]
    ProcessTableFull,
    #[snafu(display("semaphore table is full"))]
    SemaphoreTableFull,
    #[snafu(display("port table is full"))]
    PortTableFull,
    #[snafu(display("message pool is exhausted"))]
    MessagePoolExhausted,
    #[snafu(display("mailbox is full"))]
    MailboxFull,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A spawn that did not happen
///
/// Carries the caller's stack back untouched so it can be reused.
#[derive(Debug)]
pub struct SpawnError {
    pub error: Error,
    pub stack: &'static mut [u8],
}

impl SpawnError {
    pub fn into_stack(self) -> &'static mut [u8] {
        self.stack
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spawn failed: {}", self.error)
    }
}

impl From<SpawnError> for Error {
    fn from(e: SpawnError) -> Self {
        e.error
    }
}
