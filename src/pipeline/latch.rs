//! Countdown latch used as the stage join barrier.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct CountdownLatch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        match self.remaining.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Decrement the count. Returns `true` for the call that reached zero.
    pub fn count_down(&self) -> bool {
        let mut remaining = self.lock();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        if *remaining == 0 {
            self.zero.notify_all();
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> usize {
        *self.lock()
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.lock();
        while *remaining > 0 {
            remaining = match self.zero.wait(remaining) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Block until zero or `timeout` elapses. Returns `true` if zero was reached.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.lock();
        while *remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            remaining = match self.zero.wait_timeout(remaining, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
