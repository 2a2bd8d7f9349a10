//! The bridge facade: one session per backend connection.
//!
//! Every native call goes through the entry gate: the calling thread must be
//! the privileged thread, no unhandled error may be pending, and queued
//! reclaim requests are performed before the new call is issued.

use crate::config::{BridgeConfig, PinPolicy};
use crate::cursor::{Cursor, CursorOptions};
use crate::error::BridgeError;
use crate::error_bridge::{ErrorBridge, ErrorRecord, Severity, SqlState};
use crate::handle::death_row::{DeathRow, ReclaimStats};
use crate::handle::registry::{LeakWarning, ScopeId, ScopeKind, ScopeRegistry, TeardownReport};
use crate::handle::{Handle, HandleKind, NativeAddr};
use crate::host::{NativeHost, Row, TypeOid, Value};
use crate::metrics::{MetricsRecorder, SessionMetrics};
use crate::plan::{Plan, PlanCache, PlanCacheStats, PlanKey};
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Frame {
    scope: ScopeId,
    kind: ScopeKind,
}

/// A named subtransaction opened by [`Session::savepoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    scope: ScopeId,
    name: String,
}

impl Savepoint {
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct SessionInner {
    host: Arc<dyn NativeHost>,
    config: BridgeConfig,
    registry: ScopeRegistry,
    death_row: Arc<DeathRow>,
    plans: Mutex<PlanCache>,
    errors: ErrorBridge,
    stack: Mutex<Vec<Frame>>,
    metrics: MetricsRecorder,
    root: ScopeId,
    next_portal: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.host.is_privileged_thread() {
            let pending = self.death_row.take();
            self.registry.reclaim(pending, &*self.host);
            if self.registry.is_live(self.root) {
                if let Err(err) = self
                    .registry
                    .end_scope(self.root, PinPolicy::Defer, &*self.host)
                {
                    debug!(root = %self.root, %err, "session scope already gone");
                }
            }
        }
        self.death_row.close();
        info!(root = %self.root, "session closed");
    }
}

/// Cheaply clonable; clones share all state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("root", &self.inner.root)
            .field("current_scope", &self.current_scope())
            .field("blocked", &self.inner.errors.is_blocked())
            .finish()
    }
}

impl Session {
    /// Opens the session root scope. Must run on the privileged thread.
    pub fn open(host: Arc<dyn NativeHost>, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        if !host.is_privileged_thread() {
            return Err(BridgeError::WrongThread);
        }
        let capacity =
            NonZeroUsize::new(config.plan_cache_capacity).ok_or_else(|| BridgeError::InvalidConfig {
                message: "plan_cache_capacity must be at least 1".into(),
            })?;
        let registry = ScopeRegistry::new();
        let root = registry.open_scope(None, ScopeKind::Session)?;
        host.begin_scope(root, None, ScopeKind::Session);
        info!(
            %root,
            plan_cache_capacity = config.plan_cache_capacity,
            cursor_batch_size = config.cursor_batch_size,
            pin_policy = ?config.pin_policy,
            "session opened"
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                host,
                registry,
                death_row: Arc::new(DeathRow::new()),
                plans: Mutex::new(PlanCache::new(capacity)),
                errors: ErrorBridge::new(),
                stack: Mutex::new(vec![Frame {
                    scope: root,
                    kind: ScopeKind::Session,
                }]),
                metrics: MetricsRecorder::default(),
                root,
                next_portal: AtomicU64::new(0),
                config,
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ScopeRegistry {
        &self.inner.registry
    }

    pub fn root_scope(&self) -> ScopeId {
        self.inner.root
    }

    /// Innermost open scope: the one new handles are registered under.
    pub fn current_scope(&self) -> ScopeId {
        self.inner
            .stack
            .lock()
            .last()
            .map(|frame| frame.scope)
            .unwrap_or(self.inner.root)
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_scope().is_some()
    }

    pub fn unhandled_error(&self) -> Option<Arc<ErrorRecord>> {
        self.inner.errors.unhandled()
    }

    /// Requests waiting on the death row.
    pub fn pending_reclaims(&self) -> usize {
        self.inner.death_row.len()
    }

    fn privileged(&self) -> Result<(), BridgeError> {
        if self.inner.host.is_privileged_thread() {
            Ok(())
        } else {
            Err(BridgeError::WrongThread)
        }
    }

    fn enter(&self) -> Result<ReclaimStats, BridgeError> {
        self.privileged()?;
        if let Err(err) = self.inner.errors.check() {
            self.inner.metrics.blocked_call();
            return Err(err);
        }
        Ok(self.reclaim_pending())
    }

    fn reclaim_pending(&self) -> ReclaimStats {
        let requests = self.inner.death_row.take();
        if requests.is_empty() {
            return ReclaimStats::default();
        }
        let stats = self.inner.registry.reclaim(requests, &*self.inner.host);
        self.inner.metrics.reclaimed(stats);
        if stats.scopes_ended > 0 {
            self.inner.plans.lock().purge_invalid();
        }
        stats
    }

    /// Performs queued native frees. Higher layers call this on every
    /// re-entry from managed code; every native call here also does so.
    pub fn drain_and_reclaim(&self) -> Result<ReclaimStats, BridgeError> {
        self.enter()
    }

    /// Captures the host's error report for a failed call and raises it.
    fn native_failure(&self) -> BridgeError {
        let scope = self.current_scope();
        let record = match self.inner.host.copy_error(scope) {
            Some(data) => {
                let handle = match self.wrap_in(data.addr, HandleKind::ErrorData, scope) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        debug!(%scope, addr = %data.addr, %err, "error copy left to the scope free");
                        None
                    }
                };
                ErrorRecord::from_native(data, handle)
            }
            None => ErrorRecord::synthetic(
                Severity::Error,
                SqlState::new(SqlState::INTERNAL_ERROR),
                "native call failed without an error report",
            ),
        };
        BridgeError::Native(self.inner.errors.raise(record))
    }

    pub fn wrap(&self, addr: NativeAddr, kind: HandleKind) -> Result<Handle, BridgeError> {
        self.wrap_in(addr, kind, self.current_scope())
    }

    /// Registers a freshly allocated native structure owned by `scope`.
    pub fn wrap_in(
        &self,
        addr: NativeAddr,
        kind: HandleKind,
        scope: ScopeId,
    ) -> Result<Handle, BridgeError> {
        self.privileged()?;
        let state = self.inner.registry.register(scope, addr, kind)?;
        self.inner.metrics.handle_wrapped();
        Ok(Handle::new(state, Arc::clone(&self.inner.death_row)))
    }

    /// Invalidates `handle` and, when possible, performs its release at
    /// once. Off the privileged thread, or while an unhandled error is
    /// pending, the release waits on the death row.
    pub fn invalidate(&self, handle: &Handle) -> bool {
        let invalidated = handle.invalidate();
        if invalidated && self.inner.host.is_privileged_thread() && !self.inner.errors.is_blocked()
        {
            self.reclaim_pending();
        }
        invalidated
    }

    fn push_scope(&self, kind: ScopeKind) -> Result<ScopeId, BridgeError> {
        let parent = self.current_scope();
        let scope = self.inner.registry.open_scope(Some(parent), kind)?;
        self.inner.host.begin_scope(scope, Some(parent), kind);
        self.inner.stack.lock().push(Frame { scope, kind });
        Ok(scope)
    }

    fn transaction_scope(&self) -> Option<ScopeId> {
        self.inner
            .stack
            .lock()
            .iter()
            .find(|frame| frame.kind == ScopeKind::Transaction)
            .map(|frame| frame.scope)
    }

    fn teardown(&self, scope: ScopeId) -> Result<TeardownReport, BridgeError> {
        let report =
            self.inner
                .registry
                .end_scope(scope, self.inner.config.pin_policy, &*self.inner.host)?;
        let freed = if report.freed { report.scopes.len() } else { 0 };
        self.inner.metrics.teardown(freed, report.deferred);
        let registry = &self.inner.registry;
        self.inner
            .stack
            .lock()
            .retain(|frame| registry.is_live(frame.scope));
        self.inner.plans.lock().purge_invalid();
        Ok(report)
    }

    /// Host-driven end of `scope` and its descendants. Runs while an
    /// unhandled error is pending: the host ends scopes on its abort path.
    pub fn end_scope(&self, scope: ScopeId) -> Result<TeardownReport, BridgeError> {
        self.privileged()?;
        if scope == self.inner.root {
            return Err(BridgeError::Validation(
                "the session scope ends with the session".into(),
            ));
        }
        self.teardown(scope)
    }

    pub fn begin(&self) -> Result<ScopeId, BridgeError> {
        self.enter()?;
        if self.in_transaction() {
            return Err(BridgeError::Validation(
                "a transaction is already in progress".into(),
            ));
        }
        let scope = self.push_scope(ScopeKind::Transaction)?;
        debug!(%scope, "transaction started");
        Ok(scope)
    }

    pub fn savepoint(&self, name: &str) -> Result<Savepoint, BridgeError> {
        self.enter()?;
        if !self.in_transaction() {
            return Err(BridgeError::Validation(format!(
                "savepoint '{name}' requires a transaction"
            )));
        }
        let scope = self.push_scope(ScopeKind::Subtransaction)?;
        debug!(%scope, savepoint = name, "savepoint established");
        Ok(Savepoint {
            scope,
            name: name.to_string(),
        })
    }

    fn live_savepoint(&self, savepoint: &Savepoint) -> Result<(), BridgeError> {
        if self.inner.registry.is_live(savepoint.scope) {
            Ok(())
        } else {
            Err(BridgeError::ScopeEnded {
                scope: savepoint.scope,
            })
        }
    }

    pub fn release_savepoint(&self, savepoint: &Savepoint) -> Result<TeardownReport, BridgeError> {
        self.enter()?;
        self.live_savepoint(savepoint)?;
        self.teardown(savepoint.scope)
    }

    /// Rolls back the subtransaction and everything opened inside it.
    /// Clears a pending unhandled error.
    pub fn rollback_savepoint(&self, savepoint: &Savepoint) -> Result<TeardownReport, BridgeError> {
        self.privileged()?;
        self.live_savepoint(savepoint)?;
        self.recover();
        self.teardown(savepoint.scope)
    }

    /// Fails with the unhandled error, if any, and then leaves the
    /// transaction open for [`Session::abort`].
    pub fn commit(&self) -> Result<TeardownReport, BridgeError> {
        self.enter()?;
        let scope = self
            .transaction_scope()
            .ok_or_else(|| BridgeError::Validation("no transaction in progress".into()))?;
        let report = self.teardown(scope)?;
        debug!(%scope, "transaction committed");
        Ok(report)
    }

    /// Aborts everything above the session scope and clears a pending
    /// unhandled error.
    pub fn abort(&self) -> Result<Option<TeardownReport>, BridgeError> {
        self.privileged()?;
        self.recover();
        let outermost = self.inner.stack.lock().get(1).map(|frame| frame.scope);
        match outermost {
            Some(scope) => {
                let report = self.teardown(scope)?;
                debug!(%scope, "transaction aborted");
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    fn recover(&self) {
        if let Some(record) = self.inner.errors.clear() {
            info!(sqlstate = %record.sqlstate(), "unhandled error cleared by rollback");
        }
        self.reclaim_pending();
    }

    /// Runs `body` inside a statement scope, ending the scope on every exit,
    /// unwinding included.
    pub fn with_statement<R>(
        &self,
        body: impl FnOnce(&Session) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        self.enter()?;
        let guard = StatementGuard {
            session: self,
            scope: self.push_scope(ScopeKind::Statement)?,
            armed: true,
        };
        let result = body(self);
        guard.finish()?;
        result
    }

    fn end_statement(&self, scope: ScopeId) -> Result<(), BridgeError> {
        if self.inner.registry.is_live(scope) {
            self.teardown(scope)?;
        }
        Ok(())
    }

    /// Routine boundary. A routine that returns `Ok` after a native failure
    /// was swallowed still fails with the unhandled error.
    pub fn invoke<R>(
        &self,
        routine: impl FnOnce(&Session) -> Result<R, BridgeError>,
    ) -> Result<R, BridgeError> {
        let result = routine(self);
        match (result, self.inner.errors.unhandled()) {
            (Ok(_), Some(record)) => {
                warn!(sqlstate = %record.sqlstate(), "routine returned normally over an unhandled error");
                Err(BridgeError::UnhandledError(record))
            }
            (result, _) => result,
        }
    }

    /// Prepares through the plan cache under the current scope.
    pub fn prepare(&self, text: &str, param_types: &[TypeOid]) -> Result<Plan, BridgeError> {
        self.enter()?;
        let key = PlanKey::new(text, param_types);
        if let Some(plan) = self.inner.plans.lock().lookup(&key) {
            return Ok(plan);
        }
        let scope = self.current_scope();
        self.inner.metrics.native_call();
        let addr = self
            .inner
            .host
            .prepare(scope, text, param_types)
            .map_err(|_| self.native_failure())?;
        let handle = self.wrap_in(addr, HandleKind::Plan, scope)?;
        let plan = Plan::new(key, handle);
        let evicted = self.inner.plans.lock().insert(plan.clone());
        if !evicted.is_empty() {
            drop(evicted);
            self.reclaim_pending();
        }
        Ok(plan)
    }

    /// Invalidates `plan` and removes it from the cache.
    pub fn close_plan(&self, plan: &Plan) -> bool {
        let closed = self.inner.plans.lock().close(plan);
        if closed && self.inner.host.is_privileged_thread() && !self.inner.errors.is_blocked() {
            self.reclaim_pending();
        }
        closed
    }

    fn check_arity(plan: &Plan, params: &[Value]) -> Result<(), BridgeError> {
        if params.len() == plan.param_types().len() {
            Ok(())
        } else {
            Err(BridgeError::Validation(format!(
                "plan expects {} parameters, got {}",
                plan.param_types().len(),
                params.len()
            )))
        }
    }

    pub fn execute(&self, plan: &Plan, params: &[Value]) -> Result<u64, BridgeError> {
        self.execute_with_count(plan, params, 0)
    }

    /// Runs `plan`, processing at most `count` rows (0 for all).
    pub fn execute_with_count(
        &self,
        plan: &Plan,
        params: &[Value],
        count: u64,
    ) -> Result<u64, BridgeError> {
        Self::check_arity(plan, params)?;
        self.enter()?;
        let guard = plan.handle().pin()?;
        self.inner.metrics.native_call();
        self.inner
            .host
            .execute(guard.addr(), params, count)
            .map_err(|_| self.native_failure())
    }

    pub fn open_cursor(
        &self,
        plan: &Plan,
        params: &[Value],
        options: CursorOptions,
    ) -> Result<Cursor, BridgeError> {
        Self::check_arity(plan, params)?;
        self.enter()?;
        let name = options.name.clone().unwrap_or_else(|| {
            let n = self.inner.next_portal.fetch_add(1, Ordering::Relaxed) + 1;
            format!("<unnamed portal {n}>")
        });
        let scope = self.current_scope();
        let portal = {
            let guard = plan.handle().pin()?;
            self.inner.metrics.native_call();
            self.inner
                .host
                .cursor_open(scope, guard.addr(), &name, params)
                .map_err(|_| self.native_failure())?
        };
        let handle = self.wrap_in(portal.addr, HandleKind::Portal, scope)?;
        let batch_size = options
            .batch_size
            .unwrap_or(self.inner.config.cursor_batch_size);
        debug!(portal = %name, %scope, batch_size, row_limit = ?options.row_limit, "cursor opened");
        Ok(Cursor::new(
            self.clone(),
            name,
            handle,
            portal.columns,
            options.row_limit,
            batch_size,
        ))
    }

    pub(crate) fn fetch(&self, portal: &Handle, count: usize) -> Result<Vec<Row>, BridgeError> {
        self.enter()?;
        let guard = portal.pin()?;
        self.inner.metrics.native_call();
        self.inner.metrics.cursor_fetch();
        self.inner
            .host
            .cursor_fetch(guard.addr(), count)
            .map_err(|_| self.native_failure())
    }

    /// Valid handles older than the configured threshold, each logged.
    pub fn check_leaks(&self) -> Vec<LeakWarning> {
        let threshold = Duration::from_millis(self.inner.config.leak_warning_ms);
        let leaks = self.inner.registry.check_leaks(threshold);
        for leak in &leaks {
            warn!(
                handle = %leak.handle,
                kind = %leak.kind,
                scope = %leak.scope,
                age_ms = leak.age.as_millis() as u64,
                "possible handle leak"
            );
        }
        leaks
    }

    pub fn plan_cache_stats(&self) -> PlanCacheStats {
        self.inner.plans.lock().stats()
    }

    pub fn metrics(&self) -> SessionMetrics {
        let plans = self.plan_cache_stats();
        SessionMetrics {
            plan_cache_hits: plans.hits,
            plan_cache_misses: plans.misses,
            plan_cache_evictions: plans.evictions,
            errors_captured: self.inner.errors.captured(),
            dropped_after_close: self.inner.death_row.dropped_after_close(),
            ..self.inner.metrics.snapshot()
        }
    }
}

/// Ends a statement scope when the body unwinds.
struct StatementGuard<'a> {
    session: &'a Session,
    scope: ScopeId,
    armed: bool,
}

impl StatementGuard<'_> {
    fn finish(mut self) -> Result<(), BridgeError> {
        self.armed = false;
        self.session.end_statement(self.scope)
    }
}

impl Drop for StatementGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.session.end_statement(self.scope) {
            warn!(scope = %self.scope, %err, "statement scope teardown failed while unwinding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn session(host: &Arc<MockHost>) -> Session {
        Session::open(host.clone(), BridgeConfig::default()).expect("session")
    }

    #[test]
    fn statement_scope_nests_under_transaction() {
        let host = Arc::new(MockHost::new().with_series("select n", 3));
        let session = session(&host);
        let txn = session.begin().expect("begin");
        let inner = session
            .with_statement(|s| {
                let stmt = s.current_scope();
                assert_eq!(s.registry().parent(stmt), Some(txn));
                Ok(stmt)
            })
            .expect("statement");
        assert!(!session.registry().is_live(inner));
        assert_eq!(session.current_scope(), txn);
        session.commit().expect("commit");
        assert_eq!(session.current_scope(), session.root_scope());
        assert!(host.violations().is_empty());
    }

    #[test]
    fn statement_scope_ends_when_body_panics() {
        let host = Arc::new(MockHost::new().with_series("select n", 1));
        let session = session(&host);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = session.with_statement(|s| -> Result<(), BridgeError> {
                s.prepare("select n", &[])?;
                panic!("routine failed inside statement {}", s.current_scope());
            });
        }));
        assert!(result.is_err());
        assert_eq!(session.current_scope(), session.root_scope());
        assert_eq!(session.registry().scope_count(), 1);
        assert_eq!(session.plan_cache_stats().len, 0);
        assert!(session.prepare("select n", &[]).expect("prepare").is_valid());
        assert!(host.violations().is_empty(), "{:?}", host.violations());
    }

    #[test]
    fn begin_twice_and_savepoint_outside_transaction_are_rejected() {
        let host = Arc::new(MockHost::new());
        let session = session(&host);
        assert!(matches!(
            session.savepoint("sp"),
            Err(BridgeError::Validation(_))
        ));
        session.begin().expect("begin");
        assert!(matches!(session.begin(), Err(BridgeError::Validation(_))));
        assert!(session.abort().expect("abort").is_some());
        assert!(!session.in_transaction());
    }

    #[test]
    fn released_savepoint_cannot_be_released_again() {
        let host = Arc::new(MockHost::new());
        let session = session(&host);
        session.begin().expect("begin");
        let sp = session.savepoint("a").expect("savepoint");
        assert_eq!(sp.name(), "a");
        session.release_savepoint(&sp).expect("release");
        assert!(matches!(
            session.release_savepoint(&sp),
            Err(BridgeError::ScopeEnded { .. })
        ));
    }

    #[test]
    fn session_scope_cannot_be_ended_directly() {
        let host = Arc::new(MockHost::new());
        let session = session(&host);
        assert!(session.end_scope(session.root_scope()).is_err());
    }

    #[test]
    fn arity_is_checked_before_any_native_call() {
        let host = Arc::new(MockHost::new().with_series("select $1", 1));
        let session = session(&host);
        let plan = session
            .prepare("select $1", &[TypeOid::INT8])
            .expect("prepare");
        let before = host.calls();
        assert!(matches!(
            session.execute(&plan, &[]),
            Err(BridgeError::Validation(_))
        ));
        assert_eq!(host.calls(), before);
        assert_eq!(session.execute(&plan, &[Value::Int(1)]).expect("execute"), 1);
    }

    #[test]
    fn dropping_the_session_frees_everything() {
        let host = Arc::new(MockHost::new().with_series("select n", 2));
        let plan = {
            let session = session(&host);
            session.prepare("select n", &[]).expect("prepare")
        };
        assert!(!plan.is_valid());
        assert_eq!(host.live_allocations(), 0);
        assert!(host.violations().is_empty());
    }
}
