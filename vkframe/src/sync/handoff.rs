// Copyright (c) 2026 The vkframe developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use parking_lot::{Condvar, Mutex};

/// A slot through which one thread hands a value to another.
///
/// The slot holds at most one value. [`put`](Self::put) blocks while the slot is full and
/// [`take`](Self::take) blocks while it is empty, so a producer and a consumer sharing a
/// `Handoff` strictly alternate.
#[derive(Debug)]
pub struct Handoff<T> {
    slot: Mutex<Option<T>>,
    changed: Condvar,
}

impl<T> Handoff<T> {
    #[inline]
    pub fn new() -> Self {
        Handoff {
            slot: Mutex::new(None),
            changed: Condvar::new(),
        }
    }

    /// Places `value` in the slot, waiting for the consumer to take the previous one first.
    pub fn put(&self, value: T) {
        let mut slot = self.slot.lock();

        while slot.is_some() {
            self.changed.wait(&mut slot);
        }

        *slot = Some(value);
        self.changed.notify_all();
    }

    /// Waits for a value and removes it from the slot.
    pub fn take(&self) -> T {
        let mut slot = self.slot.lock();

        loop {
            if let Some(value) = slot.take() {
                self.changed.notify_all();
                return value;
            }

            self.changed.wait(&mut slot);
        }
    }

    /// Removes the value in the slot, if there is one, without waiting.
    pub fn try_take(&self) -> Option<T> {
        let value = self.slot.lock().take();

        if value.is_some() {
            self.changed.notify_all();
        }

        value
    }
}

impl<T> Default for Handoff<T> {
    #[inline]
    fn default() -> Self {
        Handoff::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn values_arrive_in_order() {
        let handoff = Arc::new(Handoff::new());
        let producer = {
            let handoff = handoff.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    handoff.put(i);
                }
            })
        };

        let received: Vec<i32> = (0..100).map(|_| handoff.take()).collect();
        producer.join().unwrap();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert_eq!(handoff.try_take(), None);
    }

    #[test]
    fn ping_pong() {
        let start = Arc::new(Handoff::new());
        let done = Arc::new(Handoff::new());
        let worker = {
            let (start, done) = (start.clone(), done.clone());
            thread::spawn(move || {
                while let Some(n) = start.take() {
                    done.put(n * 2);
                }
            })
        };

        for n in 1..=10u32 {
            start.put(Some(n));
            assert_eq!(done.take(), n * 2);
        }

        start.put(None);
        worker.join().unwrap();
    }
}
