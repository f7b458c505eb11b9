//! Sticky binary event
//!
//! The single suspension primitive used by the driver's threads.  An
//! event stays signalled until explicitly reset, so a signal delivered
//! before the waiter arrives is not lost.  Every wait site documents
//! its wake source at the point of use.

use std::sync::{Condvar, Mutex};

pub(crate) struct Event {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Signal the event and wake all waiters.  The event stays
    /// signalled until [`reset`](Self::reset).
    pub fn signal(&self) {
        *self.signalled.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.signalled.lock().unwrap() = false;
    }

    /// Block until the event is signalled.  Does not consume the
    /// signal.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock().unwrap();
        while !*signalled {
            signalled = self.condvar.wait(signalled).unwrap();
        }
    }
}

#[cfg(test)]
#[path = "tests/event.rs"]
mod tests;
