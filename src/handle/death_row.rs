//! Cross-thread hand-off of native frees.
//!
//! Any thread may push; only the privileged thread drains. The queue lock is
//! held for the push or the swap and never across a native call.

use crate::handle::registry::ScopeId;
use crate::handle::{DeferredTeardown, HandleId, HandleKind, NativeAddr};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOrigin {
    /// The last wrapper was dropped while still valid.
    Finalized,
    /// `invalidate` was called, possibly off the privileged thread.
    Invalidated,
}

#[derive(Debug, Clone)]
pub(crate) enum Reclaim {
    Release {
        handle: HandleId,
        addr: NativeAddr,
        kind: HandleKind,
        scope: ScopeId,
        origin: ReclaimOrigin,
    },
    /// Bulk frees postponed by pinned handles.
    EndScopes(Arc<DeferredTeardown>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub released: usize,
    pub dropped: usize,
    pub scopes_ended: usize,
}

impl ReclaimStats {
    pub fn is_empty(&self) -> bool {
        self.released == 0 && self.dropped == 0 && self.scopes_ended == 0
    }
}

#[derive(Debug, Default)]
pub struct DeathRow {
    queue: Mutex<Vec<Reclaim>>,
    closed: AtomicBool,
    dropped_after_close: AtomicU64,
}

impl DeathRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request. After [`DeathRow::close`] the request is dropped.
    pub(crate) fn push(&self, request: Reclaim) {
        if self.closed.load(Ordering::Acquire) {
            self.dropped_after_close.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut queue = self.queue.lock();
        // Re-check under the lock so close() cannot race a late push.
        if self.closed.load(Ordering::Acquire) {
            self.dropped_after_close.fetch_add(1, Ordering::Relaxed);
            return;
        }
        queue.push(request);
    }

    /// Swaps out everything queued so far.
    pub(crate) fn take(&self) -> Vec<Reclaim> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// The host connection is gone: nothing queued can be freed any more.
    pub fn close(&self) {
        let mut queue = self.queue.lock();
        self.closed.store(true, Ordering::Release);
        let pending = queue.len() as u64;
        queue.clear();
        if pending > 0 {
            self.dropped_after_close.fetch_add(pending, Ordering::Relaxed);
            debug!(pending, "death row closed with pending reclaim requests");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn dropped_after_close(&self) -> u64 {
        self.dropped_after_close.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::{DeathRow, Reclaim, ReclaimOrigin};
    use crate::handle::registry::ScopeId;
    use crate::handle::{HandleId, HandleKind, NativeAddr};
    use std::sync::Arc;
    use std::thread;

    fn release(id: u64) -> Reclaim {
        Reclaim::Release {
            handle: HandleId(id),
            addr: NativeAddr::new(id),
            kind: HandleKind::Other,
            scope: ScopeId(1),
            origin: ReclaimOrigin::Finalized,
        }
    }

    #[test]
    fn take_swaps_out_all_requests_pushed_from_other_threads() {
        let death_row = Arc::new(DeathRow::new());
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let death_row = Arc::clone(&death_row);
                thread::spawn(move || {
                    for i in 0..25 {
                        death_row.push(release(t * 100 + i + 1));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }
        assert_eq!(death_row.take().len(), 100);
        assert!(death_row.take().is_empty());
    }

    #[test]
    fn requests_after_close_are_dropped_silently() {
        let death_row = DeathRow::new();
        death_row.push(release(1));
        death_row.close();
        death_row.push(release(2));
        assert!(death_row.is_empty());
        assert!(death_row.is_closed());
        assert_eq!(death_row.dropped_after_close(), 2);
    }
}
