// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Synchronization between the host and the GPU.
//!
//! Work submitted to the GPU completes asynchronously, so the host must not recycle a resource
//! that a pending submission may still read. Every command buffer owns a [`Fence`], and every
//! fence has a [`SignalCounter`] that goes up by one each time the fence is observed to signal.
//!
//! When a pooled resource is used by a command buffer it records a [`CompletionToken`]: the
//! fence's counter together with the value it had at that moment. The submission that follows
//! will signal the fence, pushing the counter past the recorded value, at which point the
//! resource is free to be reused. That rule is [`is_reclaimable`].

pub use self::{
    fence::{Fence, FenceState},
    handoff::Handoff,
    semaphore::Semaphore,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

mod fence;
mod handoff;
mod semaphore;

/// Returns whether work tagged when a fence's counter was `tagged_at` has completed, given the
/// counter's `current` value.
#[inline]
pub const fn is_reclaimable(tagged_at: u64, current: u64) -> bool {
    current > tagged_at
}

/// The number of times a fence has been observed to signal.
///
/// Cloning gives another handle to the same counter. The counter only ever increases.
#[derive(Clone, Debug, Default)]
pub struct SignalCounter(Arc<AtomicU64>);

impl SignalCounter {
    /// Creates a new counter starting at zero.
    #[inline]
    pub fn new() -> Self {
        SignalCounter::default()
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Increments the counter, marking everything tagged so far as complete. Returns the new
    /// value.
    #[inline]
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns whether both handles refer to the same counter.
    #[inline]
    pub fn ptr_eq(&self, other: &SignalCounter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns a token that becomes reclaimable the next time the counter advances.
    #[inline]
    pub fn token(&self) -> CompletionToken {
        CompletionToken {
            counter: self.clone(),
            tagged_at: self.get(),
        }
    }
}

/// A snapshot of a [`SignalCounter`], recorded when a resource is used by a submission.
#[derive(Clone, Debug)]
pub struct CompletionToken {
    counter: SignalCounter,
    tagged_at: u64,
}

impl CompletionToken {
    #[inline]
    pub fn counter(&self) -> &SignalCounter {
        &self.counter
    }

    /// The value the counter had when the token was taken.
    #[inline]
    pub fn tagged_at(&self) -> u64 {
        self.tagged_at
    }

    /// Returns whether the work the token was taken for has completed.
    #[inline]
    pub fn is_reclaimable(&self) -> bool {
        is_reclaimable(self.tagged_at, self.counter.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclaimable_only_past_the_snapshot() {
        assert!(!is_reclaimable(3, 2));
        assert!(!is_reclaimable(3, 3));
        assert!(is_reclaimable(3, 4));
    }

    #[test]
    fn token_follows_its_counter() {
        let counter = SignalCounter::new();
        counter.advance();

        let token = counter.token();
        assert_eq!(token.tagged_at(), 1);
        assert!(!token.is_reclaimable());

        counter.advance();
        assert!(token.is_reclaimable());

        // A token taken after the advance waits for the next one.
        let later = counter.token();
        assert!(!later.is_reclaimable());
        assert!(later.counter().ptr_eq(&counter));
        assert!(!later.counter().ptr_eq(&SignalCounter::new()));
    }
}
