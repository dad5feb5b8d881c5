//! Concurrency primitives shared by the resolver, collector and trigger.
//!
//! [`ScanMutex`] serializes every pass that produces the authoritative image
//! list. [`ProbeSemaphore`] bounds simultaneous network probes so a page with
//! thousands of images cannot starve the network or the host page.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore, watch};

/// Admission slots for size probing.
pub const PROBE_SLOTS: usize = 8;

/// Admission slots for bulk fetches.
pub const BULK_SLOTS: usize = 32;

/// Exclusive async lock with a non-acquiring idle wait.
#[derive(Debug)]
pub struct ScanMutex {
    lock: Mutex<()>,
    busy: watch::Sender<bool>,
}

impl Default for ScanMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMutex {
    #[must_use]
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            lock: Mutex::new(()),
            busy,
        }
    }

    /// Waits for exclusive access. The lock is released when the guard is
    /// dropped or passed to [`ScanGuard::release`].
    pub async fn acquire(&self) -> ScanGuard<'_> {
        let guard = self.lock.lock().await;
        self.busy.send_replace(true);
        ScanGuard {
            _guard: guard,
            busy: &self.busy,
        }
    }

    /// Whether a holder currently owns the lock.
    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Waits until no holder owns the lock, without acquiring it.
    ///
    /// Another holder may take the lock right after this returns; callers
    /// needing a consistent view must re-check.
    pub async fn wait_idle(&self) {
        let mut busy = self.busy.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        drop(busy.wait_for(|held| !*held).await);
    }
}

/// Holder of a [`ScanMutex`].
#[derive(Debug)]
pub struct ScanGuard<'lock> {
    _guard: MutexGuard<'lock, ()>,
    busy: &'lock watch::Sender<bool>,
}

impl ScanGuard<'_> {
    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.busy.send_replace(false);
    }
}

/// Fixed-ceiling admission control.
#[derive(Debug, Clone)]
pub struct ProbeSemaphore {
    slots: Arc<Semaphore>,
    ceiling: usize,
}

impl ProbeSemaphore {
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(ceiling)),
            ceiling,
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Permit {
        // The semaphore is never closed, so `Err` cannot happen; an empty
        // permit keeps the caller going regardless.
        Permit {
            inner: Arc::clone(&self.slots).acquire_owned().await.ok(),
        }
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }
}

/// An occupied [`ProbeSemaphore`] slot. Released on drop; explicit release
/// is idempotent.
#[derive(Debug)]
pub struct Permit {
    inner: Option<OwnedSemaphorePermit>,
}

impl Permit {
    pub fn release(&mut self) {
        self.inner.take();
    }

    pub const fn is_held(&self) -> bool {
        self.inner.is_some()
    }
}
