//! Kernel limits and boot configuration
//!
//! Every kernel table is statically sized here. Nothing is allocated after
//! boot; a full table is reported as a recoverable [`crate::Error`].
//!
//! Author: Moroya Sakamoto

use static_assertions::const_assert;

/// Maximum processes the kernel can manage
pub const MAX_PROCESSES: usize = 16;

/// Maximum live semaphores
pub const MAX_SEMAPHORES: usize = 32;

/// Maximum live message ports
pub const MAX_PORTS: usize = 16;

/// Size of the kernel message pool
pub const MAX_MESSAGES: usize = 64;

/// Number of priority bands (priority values `0..PRIORITY_LEVELS`)
pub const PRIORITY_LEVELS: usize = 8;

/// Process name length (bytes)
pub const NAME_LEN: usize = 8;

/// Pattern written over a fresh stack for the stack monitor
pub const STACK_FILL: u8 = 0xA5;

// Handles are stored as u8, the ready bitmap as u32.
const_assert!(MAX_PROCESSES <= u8::MAX as usize);
const_assert!(MAX_SEMAPHORES <= u8::MAX as usize);
const_assert!(MAX_PORTS <= u8::MAX as usize);
const_assert!(MAX_MESSAGES <= u8::MAX as usize);
const_assert!(PRIORITY_LEVELS <= 32);

/// Boot-time kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct KernelConfig {
    /// System tick frequency in Hz
    pub tick_hz: u32,
    /// Round-robin time slice in ticks (0 disables time slicing)
    pub quantum: u32,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            tick_hz: 1000,
            quantum: 5,
        }
    }

    pub const fn with_tick_hz(self, tick_hz: u32) -> Self {
        Self { tick_hz, ..self }
    }

    pub const fn with_quantum(self, quantum: u32) -> Self {
        Self { quantum, ..self }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
