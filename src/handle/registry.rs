//! Scope tree and the handles registered to each scope.
//!
//! Scope teardown runs on the privileged thread. The registry lock guards
//! only the tree and handle maps; it is released before any handle is
//! invalidated and before the host is called.

use crate::config::PinPolicy;
use crate::error::BridgeError;
use crate::handle::death_row::{Reclaim, ReclaimStats};
use crate::handle::{
    DeferredTeardown, HandleId, HandleKind, HandleState, NativeAddr, TeardownOutcome,
};
use crate::host::NativeHost;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) u64);

impl ScopeId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Session,
    Transaction,
    Subtransaction,
    Statement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeStatus {
    Live,
    /// Torn down, bulk free not yet performed.
    Ending,
}

#[derive(Debug)]
struct ScopeEntry {
    kind: ScopeKind,
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    status: ScopeStatus,
    handles: BTreeMap<HandleId, Arc<HandleState>>,
    deferred: Option<Arc<DeferredTeardown>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownEvent {
    Invalidated(HandleId),
    Deferred(HandleId),
    ScopeFreed(ScopeId),
}

#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Torn-down scopes, child before parent.
    pub scopes: Vec<ScopeId>,
    pub events: Vec<TeardownEvent>,
    pub invalidated: usize,
    pub deferred: usize,
    /// False when pinned handles postponed the bulk free.
    pub freed: bool,
}

#[derive(Debug, Clone)]
pub struct LeakWarning {
    pub handle: HandleId,
    pub kind: HandleKind,
    pub scope: ScopeId,
    pub age: Duration,
}

#[derive(Debug, Default)]
struct RegistryInner {
    scopes: HashMap<ScopeId, ScopeEntry>,
    next_scope: u64,
}

impl RegistryInner {
    fn live(&self, scope: ScopeId) -> Option<&ScopeEntry> {
        self.scopes
            .get(&scope)
            .filter(|entry| entry.status == ScopeStatus::Live)
    }

    /// Marks the live part of `scope`'s subtree as ending. Live scopes are
    /// returned child before parent, most recently opened child first; their
    /// handles most recently registered first. Subtrees already pending a
    /// deferred free are returned separately.
    fn begin_teardown(
        &mut self,
        scope: ScopeId,
        order: &mut Vec<ScopeId>,
        handles: &mut Vec<Arc<HandleState>>,
        pending: &mut Vec<Arc<DeferredTeardown>>,
    ) {
        let Some(entry) = self.scopes.get(&scope) else {
            return;
        };
        if entry.status == ScopeStatus::Ending {
            pending.extend(entry.deferred.iter().cloned());
            return;
        }
        let children: Vec<ScopeId> = entry.children.iter().rev().copied().collect();
        for child in children {
            self.begin_teardown(child, order, handles, pending);
        }
        if let Some(entry) = self.scopes.get_mut(&scope) {
            entry.status = ScopeStatus::Ending;
            handles.extend(entry.handles.values().rev().cloned());
            order.push(scope);
        }
    }

    fn remove(&mut self, scope: ScopeId) {
        let Some(entry) = self.scopes.remove(&scope) else {
            return;
        };
        if let Some(parent) = entry.parent.and_then(|p| self.scopes.get_mut(&p)) {
            parent.children.retain(|c| *c != scope);
        }
    }
}

#[derive(Debug, Default)]
pub struct ScopeRegistry {
    inner: Mutex<RegistryInner>,
    next_handle: AtomicU64,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_scope(
        &self,
        parent: Option<ScopeId>,
        kind: ScopeKind,
    ) -> Result<ScopeId, BridgeError> {
        let mut inner = self.inner.lock();
        if let Some(parent) = parent {
            if inner.live(parent).is_none() {
                return Err(BridgeError::ScopeEnded { scope: parent });
            }
        }
        inner.next_scope += 1;
        let id = ScopeId(inner.next_scope);
        inner.scopes.insert(
            id,
            ScopeEntry {
                kind,
                parent,
                children: Vec::new(),
                status: ScopeStatus::Live,
                handles: BTreeMap::new(),
                deferred: None,
            },
        );
        if let Some(parent) = parent.and_then(|p| inner.scopes.get_mut(&p)) {
            parent.children.push(id);
        }
        Ok(id)
    }

    pub(crate) fn register(
        &self,
        scope: ScopeId,
        addr: NativeAddr,
        kind: HandleKind,
    ) -> Result<Arc<HandleState>, BridgeError> {
        if addr.is_null() {
            return Err(BridgeError::Validation(format!(
                "cannot wrap a null {kind} address"
            )));
        }
        let mut inner = self.inner.lock();
        let Some(entry) = inner
            .scopes
            .get_mut(&scope)
            .filter(|entry| entry.status == ScopeStatus::Live)
        else {
            return Err(BridgeError::ScopeEnded { scope });
        };
        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let state = Arc::new(HandleState::new(id, addr, kind, scope));
        entry.handles.insert(id, Arc::clone(&state));
        Ok(state)
    }

    pub fn is_live(&self, scope: ScopeId) -> bool {
        self.inner.lock().live(scope).is_some()
    }

    pub fn kind(&self, scope: ScopeId) -> Option<ScopeKind> {
        self.inner.lock().scopes.get(&scope).map(|e| e.kind)
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.inner.lock().scopes.get(&scope).and_then(|e| e.parent)
    }

    /// Scopes known to the registry, including those awaiting a deferred free.
    pub fn scope_count(&self) -> usize {
        self.inner.lock().scopes.len()
    }

    /// Valid handles still registered to `scope`.
    pub fn live_handles(&self, scope: ScopeId) -> usize {
        self.inner
            .lock()
            .scopes
            .get(&scope)
            .map(|e| e.handles.values().filter(|h| h.is_valid()).count())
            .unwrap_or(0)
    }

    pub fn check_leaks(&self, threshold: Duration) -> Vec<LeakWarning> {
        let inner = self.inner.lock();
        let mut out: Vec<LeakWarning> = inner
            .scopes
            .values()
            .flat_map(|entry| entry.handles.values())
            .filter_map(|state| {
                let age = state.created_at.elapsed();
                (age >= threshold && state.is_valid()).then(|| LeakWarning {
                    handle: state.id,
                    kind: state.kind,
                    scope: state.scope,
                    age,
                })
            })
            .collect();
        out.sort_by_key(|w| w.handle);
        out
    }

    /// Ends `scope` and its descendants: every handle is invalidated
    /// (children first) before any bulk free is issued.
    pub(crate) fn end_scope(
        &self,
        scope: ScopeId,
        policy: PinPolicy,
        host: &dyn NativeHost,
    ) -> Result<TeardownReport, BridgeError> {
        let mut order = Vec::new();
        let mut handles = Vec::new();
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.live(scope).is_none() {
                return Err(BridgeError::ScopeEnded { scope });
            }
            inner.begin_teardown(scope, &mut order, &mut handles, &mut pending);
        }

        let teardown = Arc::new(DeferredTeardown::new(order.clone()));
        for child in &pending {
            child.set_successor(Arc::clone(&teardown));
        }
        let wait = match policy {
            PinPolicy::Defer => None,
            PinPolicy::Block { timeout_ms } => Some(Duration::from_millis(timeout_ms)),
        };

        let mut report = TeardownReport {
            scopes: order,
            ..TeardownReport::default()
        };
        for state in handles {
            match state.invalidate_for_teardown(&teardown, wait) {
                TeardownOutcome::AlreadyInvalid => {}
                TeardownOutcome::Invalidated => {
                    report.invalidated += 1;
                    report.events.push(TeardownEvent::Invalidated(state.id));
                }
                TeardownOutcome::Deferred => {
                    if wait.is_some() {
                        warn!(handle = %state.id, kind = %state.kind, "pin wait timed out during scope teardown; deferring");
                    }
                    report.deferred += 1;
                    report.events.push(TeardownEvent::Deferred(state.id));
                }
            }
        }

        if teardown.release() {
            self.free_scopes(teardown, host, &mut report.events);
            report.freed = true;
        } else {
            warn!(
                %scope,
                deferred = report.deferred,
                waiting_on_children = pending.len(),
                "scope teardown postponed by pinned handles"
            );
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.scopes.get_mut(&scope) {
                entry.deferred = Some(teardown);
            }
        }
        debug!(
            %scope,
            scopes = report.scopes.len(),
            invalidated = report.invalidated,
            deferred = report.deferred,
            "scope ended"
        );
        Ok(report)
    }

    /// Bulk-frees a completed teardown, then any successor it unblocks.
    fn free_scopes(
        &self,
        teardown: Arc<DeferredTeardown>,
        host: &dyn NativeHost,
        events: &mut Vec<TeardownEvent>,
    ) -> usize {
        let mut freed = 0;
        let mut next = Some(teardown);
        while let Some(teardown) = next.take() {
            for scope in &teardown.scopes {
                host.end_scope(*scope);
                events.push(TeardownEvent::ScopeFreed(*scope));
                freed += 1;
            }
            {
                let mut inner = self.inner.lock();
                for scope in &teardown.scopes {
                    inner.remove(*scope);
                }
            }
            next = teardown.take_successor().filter(|s| s.release());
        }
        freed
    }

    /// Performs the drained requests. A release whose scope is no longer
    /// live is dropped: the bulk free owns that memory.
    pub(crate) fn reclaim(&self, requests: Vec<Reclaim>, host: &dyn NativeHost) -> ReclaimStats {
        let mut stats = ReclaimStats::default();
        for request in requests {
            match request {
                Reclaim::Release {
                    handle,
                    addr,
                    kind,
                    scope,
                    origin,
                } => {
                    let owned = {
                        let mut inner = self.inner.lock();
                        match inner
                            .scopes
                            .get_mut(&scope)
                            .filter(|e| e.status == ScopeStatus::Live)
                        {
                            Some(entry) => entry.handles.remove(&handle).is_some(),
                            None => false,
                        }
                    };
                    if owned {
                        host.release(kind, addr);
                        stats.released += 1;
                    } else {
                        debug!(%handle, %scope, ?origin, "reclaim dropped; scope already ended");
                        stats.dropped += 1;
                    }
                }
                Reclaim::EndScopes(teardown) => {
                    let mut events = Vec::new();
                    stats.scopes_ended += self.free_scopes(teardown, host, &mut events);
                }
            }
        }
        stats
    }
}
