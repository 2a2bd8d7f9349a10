//! Managed wrappers around native, scope-allocated memory.
//!
//! A [`Handle`] owns a reference to one native address plus its validity and
//! pin state. The address is only ever handed out while the handle is pinned
//! and valid; once invalid, every access fails with
//! [`BridgeError::StaleHandle`] and the address is never read again.
//!
//! The wrapper's own lifetime is independent of the native memory. When the
//! last clone of a still valid handle is dropped (on any thread), a release
//! request is queued on the [`DeathRow`]; the privileged thread performs the
//! native free on its next re-entry.

pub mod death_row;
pub mod registry;

use crate::error::BridgeError;
use crate::handle::death_row::{DeathRow, Reclaim, ReclaimOrigin};
use crate::handle::registry::ScopeId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Opaque 64-bit token naming one native structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeAddr(u64);

impl NativeAddr {
    pub const NULL: NativeAddr = NativeAddr(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Registration-ordered identifier. Larger ids were registered later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Plan,
    Portal,
    ErrorData,
    Tuple,
    TupleDesc,
    Relation,
    Other,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Plan => write!(f, "plan"),
            HandleKind::Portal => write!(f, "portal"),
            HandleKind::ErrorData => write!(f, "error data"),
            HandleKind::Tuple => write!(f, "tuple"),
            HandleKind::TupleDesc => write!(f, "tuple descriptor"),
            HandleKind::Relation => write!(f, "relation"),
            HandleKind::Other => write!(f, "native"),
        }
    }
}

/// Bulk scope frees postponed until the last pinned handle in the torn-down
/// subtree is released. `outstanding` starts at one for the teardown itself.
/// A parent torn down while this one is still pending becomes its
/// successor and waits for it.
#[derive(Debug)]
pub(crate) struct DeferredTeardown {
    pub(crate) scopes: Vec<ScopeId>,
    outstanding: AtomicUsize,
    successor: Mutex<Option<Arc<DeferredTeardown>>>,
}

impl DeferredTeardown {
    pub(crate) fn new(scopes: Vec<ScopeId>) -> Self {
        Self {
            scopes,
            outstanding: AtomicUsize::new(1),
            successor: Mutex::new(None),
        }
    }

    pub(crate) fn hold(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this was the last outstanding hold.
    pub(crate) fn release(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn set_successor(&self, successor: Arc<DeferredTeardown>) {
        successor.hold();
        *self.successor.lock() = Some(successor);
    }

    pub(crate) fn take_successor(&self) -> Option<Arc<DeferredTeardown>> {
        self.successor.lock().take()
    }
}

#[derive(Debug, Clone)]
enum PendingInvalidation {
    Release,
    Teardown(Arc<DeferredTeardown>),
}

#[derive(Debug)]
struct Slot {
    valid: bool,
    pins: u32,
    pending: Option<PendingInvalidation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TeardownOutcome {
    AlreadyInvalid,
    Invalidated,
    Deferred,
}

/// State shared between a wrapper and the scope registry.
#[derive(Debug)]
pub(crate) struct HandleState {
    pub(crate) id: HandleId,
    pub(crate) addr: NativeAddr,
    pub(crate) kind: HandleKind,
    pub(crate) scope: ScopeId,
    pub(crate) created_at: Instant,
    slot: Mutex<Slot>,
    unpinned: Condvar,
}

impl HandleState {
    pub(crate) fn new(id: HandleId, addr: NativeAddr, kind: HandleKind, scope: ScopeId) -> Self {
        Self {
            id,
            addr,
            kind,
            scope,
            created_at: Instant::now(),
            slot: Mutex::new(Slot {
                valid: true,
                pins: 0,
                pending: None,
            }),
            unpinned: Condvar::new(),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.slot.lock().valid
    }

    pub(crate) fn pins(&self) -> u32 {
        self.slot.lock().pins
    }

    /// Still valid, but an invalidation waits on the last unpin.
    pub(crate) fn is_retiring(&self) -> bool {
        let slot = self.slot.lock();
        slot.valid && slot.pending.is_some()
    }

    fn release_request(&self, origin: ReclaimOrigin) -> Reclaim {
        Reclaim::Release {
            handle: self.id,
            addr: self.addr,
            kind: self.kind,
            scope: self.scope,
            origin,
        }
    }

    fn stale(&self) -> BridgeError {
        BridgeError::StaleHandle {
            handle: self.id,
            kind: self.kind,
        }
    }

    /// Explicit invalidation. Returns the release request when this call
    /// performed the transition; a pinned handle is only marked.
    fn invalidate(&self) -> Option<Reclaim> {
        let mut slot = self.slot.lock();
        if !slot.valid {
            return None;
        }
        if slot.pins > 0 {
            if slot.pending.is_none() {
                slot.pending = Some(PendingInvalidation::Release);
            }
            return None;
        }
        slot.valid = false;
        Some(self.release_request(ReclaimOrigin::Invalidated))
    }

    /// Collection of the last wrapper. No wrapper means no pin guard.
    fn finalize(&self) -> Option<Reclaim> {
        let mut slot = self.slot.lock();
        if !slot.valid {
            return None;
        }
        debug_assert_eq!(slot.pins, 0);
        slot.valid = false;
        slot.pending = None;
        Some(self.release_request(ReclaimOrigin::Finalized))
    }

    /// Invalidation on behalf of a scope teardown. Pending explicit releases
    /// are superseded because the bulk free covers the memory.
    pub(crate) fn invalidate_for_teardown(
        &self,
        teardown: &Arc<DeferredTeardown>,
        wait: Option<Duration>,
    ) -> TeardownOutcome {
        let mut slot = self.slot.lock();
        if !slot.valid {
            return TeardownOutcome::AlreadyInvalid;
        }
        if slot.pins > 0 {
            if let Some(timeout) = wait {
                self.wait_unpinned(&mut slot, timeout);
            }
            if !slot.valid {
                return TeardownOutcome::AlreadyInvalid;
            }
        }
        if slot.pins > 0 {
            teardown.hold();
            slot.pending = Some(PendingInvalidation::Teardown(Arc::clone(teardown)));
            return TeardownOutcome::Deferred;
        }
        slot.valid = false;
        slot.pending = None;
        TeardownOutcome::Invalidated
    }

    fn wait_unpinned(&self, slot: &mut MutexGuard<'_, Slot>, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while slot.valid && slot.pins > 0 {
            if self.unpinned.wait_until(slot, deadline).timed_out() {
                break;
            }
        }
    }

    /// Once an invalidation is pending only the existing pins may finish.
    fn pin(&self) -> Result<(), BridgeError> {
        let mut slot = self.slot.lock();
        if !slot.valid || slot.pending.is_some() {
            return Err(self.stale());
        }
        slot.pins += 1;
        Ok(())
    }

    fn unpin(&self) -> Option<Reclaim> {
        let mut slot = self.slot.lock();
        slot.pins = slot.pins.saturating_sub(1);
        if slot.pins > 0 {
            return None;
        }
        self.unpinned.notify_all();
        let pending = slot.pending.take()?;
        slot.valid = false;
        match pending {
            PendingInvalidation::Release => Some(self.release_request(ReclaimOrigin::Invalidated)),
            PendingInvalidation::Teardown(teardown) => {
                if teardown.release() {
                    Some(Reclaim::EndScopes(teardown))
                } else {
                    None
                }
            }
        }
    }
}

struct HandleCore {
    state: Arc<HandleState>,
    death_row: Arc<DeathRow>,
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        if let Some(request) = self.state.finalize() {
            self.death_row.push(request);
        }
    }
}

/// Managed wrapper for one native structure. Clones share validity.
#[derive(Clone)]
pub struct Handle {
    core: Arc<HandleCore>,
}

impl Handle {
    pub(crate) fn new(state: Arc<HandleState>, death_row: Arc<DeathRow>) -> Self {
        Self {
            core: Arc::new(HandleCore { state, death_row }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.core.state.id
    }

    pub fn kind(&self) -> HandleKind {
        self.core.state.kind
    }

    pub fn scope(&self) -> ScopeId {
        self.core.state.scope
    }

    pub fn is_valid(&self) -> bool {
        self.core.state.is_valid()
    }

    pub fn pin_count(&self) -> u32 {
        self.core.state.pins()
    }

    /// True while an invalidation or scope teardown is deferred by pins.
    /// A retiring handle refuses new pins.
    pub fn is_retiring(&self) -> bool {
        self.core.state.is_retiring()
    }

    /// Pins the handle; the address stays usable until the guard drops.
    pub fn pin(&self) -> Result<PinGuard<'_>, BridgeError> {
        self.core.state.pin()?;
        Ok(PinGuard { handle: self })
    }

    /// Runs `body` with the native address while pinned. Unpins on every
    /// exit path, unwinding included.
    pub fn with_pin<R>(&self, body: impl FnOnce(NativeAddr) -> R) -> Result<R, BridgeError> {
        let guard = self.pin()?;
        Ok(body(guard.addr()))
    }

    /// Invalidates the handle, queueing its native release. Idempotent.
    /// Returns false when already invalid or when the invalidation is
    /// deferred to the last unpin.
    pub fn invalidate(&self) -> bool {
        match self.core.state.invalidate() {
            Some(request) => {
                self.core.death_row.push(request);
                true
            }
            None => false,
        }
    }

    pub fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn stale_error(&self) -> BridgeError {
        self.core.state.stale()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("scope", &self.scope())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Scoped pin on a [`Handle`].
#[derive(Debug)]
pub struct PinGuard<'a> {
    handle: &'a Handle,
}

impl PinGuard<'_> {
    pub fn addr(&self) -> NativeAddr {
        self.handle.core.state.addr
    }

    pub fn handle(&self) -> &Handle {
        self.handle
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        if let Some(request) = self.handle.core.state.unpin() {
            self.handle.core.death_row.push(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::death_row::{DeathRow, Reclaim, ReclaimOrigin};
    use crate::handle::registry::ScopeId;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn handle(raw: u64, death_row: &Arc<DeathRow>) -> Handle {
        let state = Arc::new(HandleState::new(
            HandleId(raw),
            NativeAddr::new(raw * 0x10),
            HandleKind::Tuple,
            ScopeId(1),
        ));
        Handle::new(state, Arc::clone(death_row))
    }

    #[test]
    fn invalidate_is_idempotent_and_stales_every_access() {
        let death_row = Arc::new(DeathRow::new());
        let h = handle(1, &death_row);
        assert!(h.invalidate());
        assert!(!h.invalidate());
        assert!(!h.is_valid());
        assert_eq!(death_row.len(), 1);

        let err = h.with_pin(|addr| addr.get()).expect_err("stale");
        assert!(matches!(err, BridgeError::StaleHandle { .. }));
        assert!(h.pin().is_err());
    }

    #[test]
    fn dropping_last_valid_clone_queues_one_release() {
        let death_row = Arc::new(DeathRow::new());
        let h = handle(2, &death_row);
        let clone = h.clone();
        drop(h);
        assert!(death_row.is_empty());
        drop(clone);
        let queued = death_row.take();
        assert_eq!(queued.len(), 1);
        assert!(matches!(
            queued[0],
            Reclaim::Release {
                origin: ReclaimOrigin::Finalized,
                ..
            }
        ));
    }

    #[test]
    fn dropping_an_invalidated_handle_queues_nothing_more() {
        let death_row = Arc::new(DeathRow::new());
        let h = handle(3, &death_row);
        h.invalidate();
        drop(h);
        assert_eq!(death_row.len(), 1);
    }

    #[test]
    fn invalidation_waits_for_last_unpin() {
        let death_row = Arc::new(DeathRow::new());
        let h = handle(4, &death_row);
        let outer = h.pin().expect("pin");
        let inner = h.pin().expect("nested pin");
        assert!(!h.invalidate());
        assert!(h.is_valid());
        drop(inner);
        assert!(h.is_valid());
        assert!(h.is_retiring());
        assert!(h.pin().is_err(), "no new pins once invalidation is pending");
        assert_eq!(outer.addr(), NativeAddr::new(0x40));
        drop(outer);
        assert!(!h.is_valid());
        assert_eq!(death_row.len(), 1);
    }

    #[test]
    fn pin_is_released_when_body_panics() {
        let death_row = Arc::new(DeathRow::new());
        let h = handle(5, &death_row);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = h.with_pin(|addr| -> u64 { panic!("routine failed at {addr}") });
        }));
        assert!(result.is_err());
        assert_eq!(h.pin_count(), 0);
    }

    #[test]
    fn deferred_teardown_releases_scopes_at_last_hold() {
        let death_row = Arc::new(DeathRow::new());
        let h = handle(6, &death_row);
        let teardown = Arc::new(DeferredTeardown::new(vec![ScopeId(1)]));
        let guard = h.pin().expect("pin");
        let outcome = h.core.state.invalidate_for_teardown(&teardown, None);
        assert_eq!(outcome, TeardownOutcome::Deferred);
        assert!(!teardown.release());
        assert!(h.is_valid());
        let err = h.pin().expect_err("torn-down handle takes no new pins");
        assert!(matches!(err, BridgeError::StaleHandle { .. }));
        assert_eq!(h.pin_count(), 1);
        drop(guard);
        assert!(!h.is_valid());
        let queued = death_row.take();
        assert!(matches!(&queued[..], [Reclaim::EndScopes(t)] if t.scopes == vec![ScopeId(1)]));
    }
}
