//! Architecture ports
//!
//! A port provides the initial context frame written onto a fresh stack,
//! a way to pend the deferred context switch, and the idle instruction.
//! The switch itself is [`crate::kernel::Kernel::switch_context`]; the port
//! only saves and restores registers around it.
//!
//! Author: Moroya Sakamoto

cfg_if::cfg_if! {
    if #[cfg(all(feature = "cortex-m", target_arch = "arm"))] {
        mod cortex_m;
        pub use self::cortex_m::*;
    } else {
        mod host;
        pub use self::host::*;
    }
}

/// Write `words` at byte `offset` of `stack`, native endian
pub(crate) fn write_words(stack: &mut [u8], offset: usize, words: &[usize]) {
    const WORD: usize = core::mem::size_of::<usize>();
    for (i, word) in words.iter().enumerate() {
        let at = offset + i * WORD;
        stack[at..at + WORD].copy_from_slice(&word.to_ne_bytes());
    }
}
