use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Process-wide stop flag that threads can poll or block on
#[derive(Debug, Clone)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Release);

        // Lock briefly so a waiter between its check and its wait sees the notify
        let _guard = self.shared.mutex.lock();
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn wait_cancellation(&self) {
        let mut guard = self.shared.mutex.lock();
        while !self.cancelled() {
            self.shared.condvar.wait(&mut guard);
        }
    }

    /// Wait at most `timeout`. Returns `true` if stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.shared.mutex.lock();
        if !self.cancelled() {
            self.shared.condvar.wait_for(&mut guard, timeout);
        }
        self.cancelled()
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn cancel_wakes_waiters() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            thread::spawn(move || sos.wait_cancellation())
        };
        thread::sleep(Duration::from_millis(10));
        sos.cancel();
        waiter.join().unwrap();
        assert!(sos.cancelled());
    }

    #[test]
    fn wait_timeout_expires() {
        let sos = SignalOfStop::new();
        assert!(!sos.wait_timeout(Duration::from_millis(5)));
        sos.cancel();
        assert!(sos.wait_timeout(Duration::from_secs(5)));
    }
}
