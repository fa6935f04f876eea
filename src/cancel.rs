//! Cooperative cancellation shared between a generation and its watcher.
//!
//! The generation registers abort callbacks (closing its connection); a
//! watcher thread polls a predicate and fires them. Either side may also
//! call [`CancelManager::cancel`] directly.
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Idle,
    Monitoring,
    Cancelled,
    Stopped,
}

impl CancelState {
    const fn as_u8(self) -> u8 {
        match self {
            CancelState::Idle => 0,
            CancelState::Monitoring => 1,
            CancelState::Cancelled => 2,
            CancelState::Stopped => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => CancelState::Monitoring,
            2 => CancelState::Cancelled,
            3 => CancelState::Stopped,
            _ => CancelState::Idle,
        }
    }
}

/// Handle returned by [`CancelManager::add_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Box<dyn FnOnce() + Send>;

struct Shared {
    state: AtomicU8,
    next_callback: AtomicU64,
    callbacks: Mutex<Vec<(CallbackId, Callback)>>,
    wake_lock: Mutex<()>,
    wake: Condvar,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> CancelState {
        CancelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CancelState, to: CancelState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn notify_watcher(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    fn cancel(&self) {
        let moved = self.transition(CancelState::Idle, CancelState::Cancelled)
            || self.transition(CancelState::Monitoring, CancelState::Cancelled);
        if !moved {
            return;
        }
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        tracing::debug!(callbacks = callbacks.len(), "cancellation requested");
        for (_, callback) in callbacks {
            callback();
        }
        self.notify_watcher();
    }
}

/// Clonable handle over one cancellation state machine.
///
/// `Idle → Monitoring → {Cancelled, Stopped}`; `cancel` is also valid from
/// `Idle`. Clones share state.
#[derive(Clone)]
pub struct CancelManager {
    shared: Arc<Shared>,
}

impl CancelManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(CancelState::Idle.as_u8()),
                next_callback: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
                wake_lock: Mutex::new(()),
                wake: Condvar::new(),
                watcher: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> CancelState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == CancelState::Cancelled
    }

    /// Spawn a watcher that checks `predicate` every `delay` and cancels on
    /// the first `true`.
    ///
    /// Returns `false` without spawning unless the manager is idle.
    pub fn start_monitor<F>(&self, delay: Duration, predicate: F) -> bool
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if !self
            .shared
            .transition(CancelState::Idle, CancelState::Monitoring)
        {
            return false;
        }
        let weak = Arc::downgrade(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("cancel-watcher".into())
            .spawn(move || watch(&weak, delay, predicate));
        match spawned {
            Ok(handle) => {
                *self.shared.watcher.lock() = Some(handle);
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn cancel watcher");
                self.shared
                    .transition(CancelState::Monitoring, CancelState::Idle);
                false
            }
        }
    }

    /// Normal completion: `Monitoring → Stopped` without running callbacks.
    ///
    /// Waits for the watcher thread to exit.
    pub fn stop_monitor(&self) {
        if self
            .shared
            .transition(CancelState::Monitoring, CancelState::Stopped)
        {
            self.shared.notify_watcher();
        }
        let handle = self.shared.watcher.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("cancel watcher panicked");
            }
        }
    }

    /// Cancel now and run every registered callback once.
    ///
    /// No effect once stopped or already cancelled.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Register an abort callback. Runs immediately when already cancelled.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = CallbackId(self.shared.next_callback.fetch_add(1, Ordering::Relaxed));
        let mut callbacks = self.shared.callbacks.lock();
        if self.shared.state() == CancelState::Cancelled {
            drop(callbacks);
            callback();
            return id;
        }
        callbacks.push((id, Box::new(callback)));
        id
    }

    /// Returns whether the callback was still registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.shared.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }
}

impl Default for CancelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Watcher loop. Exits when the state leaves `Monitoring` or every handle
/// to the manager is gone.
fn watch<F>(weak: &Weak<Shared>, delay: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    loop {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        {
            let mut guard = shared.wake_lock.lock();
            if shared.state() != CancelState::Monitoring {
                return;
            }
            shared.wake.wait_for(&mut guard, delay);
        }
        if shared.state() != CancelState::Monitoring {
            return;
        }
        if predicate() {
            shared.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            let c = Arc::clone(&c);
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_cancel_runs_callbacks_once() {
        let manager = CancelManager::new();
        let (count, make) = counter();
        manager.add_callback(make());
        manager.add_callback(make());
        manager.cancel();
        manager.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(manager.is_cancelled());
    }

    #[test]
    fn test_callback_after_cancel_runs_immediately() {
        let manager = CancelManager::new();
        manager.cancel();
        let (count, make) = counter();
        manager.add_callback(make());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_callback_does_not_run() {
        let manager = CancelManager::new();
        let (count, make) = counter();
        let id = manager.add_callback(make());
        assert!(manager.remove_callback(id));
        assert!(!manager.remove_callback(id));
        manager.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_monitor_requires_idle() {
        let manager = CancelManager::new();
        manager.cancel();
        assert!(!manager.start_monitor(Duration::from_millis(1), || true));
        assert_eq!(manager.state(), CancelState::Cancelled);
    }

    #[test]
    fn test_monitor_cancels_when_predicate_turns_true() {
        let manager = CancelManager::new();
        let (count, make) = counter();
        manager.add_callback(make());
        let polls = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&polls);
        assert!(manager.start_monitor(Duration::from_millis(5), move || {
            p.fetch_add(1, Ordering::SeqCst) >= 2
        }));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !manager.is_cancelled() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(manager.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(polls.load(Ordering::SeqCst) >= 3);
        manager.stop_monitor();
        assert_eq!(manager.state(), CancelState::Cancelled);
    }

    #[test]
    fn test_stop_monitor_skips_callbacks() {
        let manager = CancelManager::new();
        let (count, make) = counter();
        manager.add_callback(make());
        assert!(manager.start_monitor(Duration::from_secs(60), || true));
        manager.stop_monitor();
        assert_eq!(manager.state(), CancelState::Stopped);
        manager.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!manager.is_cancelled());
    }
}
