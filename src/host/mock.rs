//! In-memory native host for tests and benches.
//!
//! `MockHost` keeps a ledger of every native allocation and the scope that
//! owns it, and records a violation whenever the bridge breaks a host rule:
//! freeing twice, touching a released structure, allocating in an ended
//! scope, or ending a scope before its children.

use crate::error_bridge::{Severity, SourceLocation};
use crate::handle::registry::{ScopeId, ScopeKind};
use crate::handle::{HandleKind, NativeAddr};
use crate::host::{
    NativeErrorData, NativeFailure, NativeHost, NativePortal, NativeResult, Row, TypeOid, Value,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub prepare: usize,
    pub execute: usize,
    pub cursor_open: usize,
    pub fetch: usize,
    pub release: usize,
    pub end_scope: usize,
    pub copy_error: usize,
}

#[derive(Debug, Clone)]
struct ScriptedError {
    sqlstate: String,
    message: String,
}

#[derive(Debug, Clone, Default)]
struct MockStatement {
    columns: Vec<String>,
    rows: Vec<Row>,
    failure: Option<ScriptedError>,
}

#[derive(Debug)]
struct Allocation {
    scope: ScopeId,
    kind: HandleKind,
}

#[derive(Debug)]
struct MockPortal {
    rows: Vec<Row>,
    pos: usize,
}

#[derive(Debug)]
struct MockScope {
    parent: Option<ScopeId>,
    ended: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_addr: u64,
    allocations: HashMap<NativeAddr, Allocation>,
    plans: HashMap<NativeAddr, String>,
    portals: HashMap<NativeAddr, MockPortal>,
    scopes: HashMap<ScopeId, MockScope>,
    statements: HashMap<String, MockStatement>,
    fail_next: Option<ScriptedError>,
    current_error: Option<ScriptedError>,
    calls: MockCalls,
    violations: Vec<String>,
}

impl MockState {
    fn alloc(&mut self, scope: ScopeId, kind: HandleKind) -> NativeAddr {
        if self.scopes.get(&scope).is_some_and(|s| s.ended) {
            self.violations
                .push(format!("{kind} allocated in ended scope {scope}"));
        }
        self.next_addr += 0x10;
        let addr = NativeAddr::new(0x1000 + self.next_addr);
        self.allocations.insert(addr, Allocation { scope, kind });
        addr
    }

    fn check_live(&mut self, addr: NativeAddr, kind: HandleKind) -> bool {
        if self.allocations.contains_key(&addr) {
            return true;
        }
        self.violations.push(format!("use of released {kind} at {addr}"));
        false
    }

    fn fail(&mut self, sqlstate: &str, message: impl Into<String>) -> NativeFailure {
        self.current_error = Some(ScriptedError {
            sqlstate: sqlstate.into(),
            message: message.into(),
        });
        NativeFailure
    }

    fn scripted_failure(&mut self) -> Option<NativeFailure> {
        let err = self.fail_next.take()?;
        self.current_error = Some(err);
        Some(NativeFailure)
    }

    fn statement_rows(&self, plan: NativeAddr) -> (Vec<String>, Vec<Row>) {
        self.plans
            .get(&plan)
            .and_then(|text| self.statements.get(text))
            .map(|s| (s.columns.clone(), s.rows.clone()))
            .unwrap_or_default()
    }

    fn forget(&mut self, addr: NativeAddr) {
        self.plans.remove(&addr);
        self.portals.remove(&addr);
    }
}

#[derive(Debug)]
pub struct MockHost {
    state: Mutex<MockState>,
    privileged: ThreadId,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// The calling thread becomes the privileged thread.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            privileged: thread::current().id(),
        }
    }

    pub fn with_statement(self, text: &str, columns: &[&str], rows: Vec<Row>) -> Self {
        self.add_statement(text, columns, rows);
        self
    }

    /// A single integer column `n` holding `1..=count`.
    pub fn with_series(self, text: &str, count: i64) -> Self {
        let rows = (1..=count)
            .map(|n| Row::from_values(vec![Value::Int(n)]))
            .collect();
        self.with_statement(text, &["n"], rows)
    }

    pub fn add_statement(&self, text: &str, columns: &[&str], rows: Vec<Row>) {
        self.state.lock().statements.insert(
            text.to_string(),
            MockStatement {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
                failure: None,
            },
        );
    }

    /// Preparing `text` fails with the given report.
    pub fn fail_statement(&self, text: &str, sqlstate: &str, message: &str) {
        let mut state = self.state.lock();
        let statement = state.statements.entry(text.to_string()).or_default();
        statement.failure = Some(ScriptedError {
            sqlstate: sqlstate.into(),
            message: message.into(),
        });
    }

    /// The next prepare, execute, open or fetch fails with the given report.
    pub fn fail_next_call(&self, sqlstate: &str, message: &str) {
        self.state.lock().fail_next = Some(ScriptedError {
            sqlstate: sqlstate.into(),
            message: message.into(),
        });
    }

    pub fn calls(&self) -> MockCalls {
        self.state.lock().calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.calls().fetch
    }

    pub fn prepare_calls(&self) -> usize {
        self.calls().prepare
    }

    pub fn release_calls(&self) -> usize {
        self.calls().release
    }

    pub fn end_scope_calls(&self) -> usize {
        self.calls().end_scope
    }

    pub fn is_allocated(&self, addr: NativeAddr) -> bool {
        self.state.lock().allocations.contains_key(&addr)
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn live_allocations_of(&self, kind: HandleKind) -> usize {
        self.state
            .lock()
            .allocations
            .values()
            .filter(|a| a.kind == kind)
            .count()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }
}

impl NativeHost for MockHost {
    fn is_privileged_thread(&self) -> bool {
        thread::current().id() == self.privileged
    }

    fn begin_scope(&self, scope: ScopeId, parent: Option<ScopeId>, _kind: ScopeKind) {
        self.state.lock().scopes.insert(
            scope,
            MockScope {
                parent,
                ended: false,
            },
        );
    }

    fn end_scope(&self, scope: ScopeId) {
        let mut state = self.state.lock();
        state.calls.end_scope += 1;
        let orphaned: Vec<ScopeId> = state
            .scopes
            .iter()
            .filter(|(_, s)| s.parent == Some(scope) && !s.ended)
            .map(|(id, _)| *id)
            .collect();
        for child in orphaned {
            state
                .violations
                .push(format!("scope {scope} ended before child {child}"));
        }
        let freed: Vec<NativeAddr> = state
            .allocations
            .iter()
            .filter(|(_, a)| a.scope == scope)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in freed {
            state.allocations.remove(&addr);
            state.forget(addr);
        }
        state
            .scopes
            .entry(scope)
            .or_insert(MockScope {
                parent: None,
                ended: false,
            })
            .ended = true;
    }

    fn release(&self, kind: HandleKind, addr: NativeAddr) {
        let mut state = self.state.lock();
        state.calls.release += 1;
        if state.allocations.remove(&addr).is_none() {
            state
                .violations
                .push(format!("double free of {kind} at {addr}"));
        }
        state.forget(addr);
    }

    fn prepare(
        &self,
        scope: ScopeId,
        text: &str,
        _param_types: &[TypeOid],
    ) -> NativeResult<NativeAddr> {
        let mut state = self.state.lock();
        state.calls.prepare += 1;
        if let Some(failure) = state.scripted_failure() {
            return Err(failure);
        }
        if let Some(err) = state.statements.get(text).and_then(|s| s.failure.clone()) {
            return Err(state.fail(&err.sqlstate, err.message));
        }
        let addr = state.alloc(scope, HandleKind::Plan);
        state.plans.insert(addr, text.to_string());
        Ok(addr)
    }

    fn execute(&self, plan: NativeAddr, _params: &[Value], count: u64) -> NativeResult<u64> {
        let mut state = self.state.lock();
        state.calls.execute += 1;
        if let Some(failure) = state.scripted_failure() {
            return Err(failure);
        }
        if !state.check_live(plan, HandleKind::Plan) {
            return Err(state.fail("XX000", "invalid plan"));
        }
        let (_, rows) = state.statement_rows(plan);
        let processed = rows.len() as u64;
        Ok(if count == 0 {
            processed
        } else {
            processed.min(count)
        })
    }

    fn cursor_open(
        &self,
        scope: ScopeId,
        plan: NativeAddr,
        _name: &str,
        _params: &[Value],
    ) -> NativeResult<NativePortal> {
        let mut state = self.state.lock();
        state.calls.cursor_open += 1;
        if let Some(failure) = state.scripted_failure() {
            return Err(failure);
        }
        if !state.check_live(plan, HandleKind::Plan) {
            return Err(state.fail("XX000", "invalid plan"));
        }
        let (columns, rows) = state.statement_rows(plan);
        let addr = state.alloc(scope, HandleKind::Portal);
        state.portals.insert(addr, MockPortal { rows, pos: 0 });
        Ok(NativePortal { addr, columns })
    }

    fn cursor_fetch(&self, portal: NativeAddr, count: usize) -> NativeResult<Vec<Row>> {
        let mut state = self.state.lock();
        state.calls.fetch += 1;
        if let Some(failure) = state.scripted_failure() {
            return Err(failure);
        }
        if !state.check_live(portal, HandleKind::Portal) {
            return Err(state.fail("34000", "portal does not exist"));
        }
        match state.portals.get_mut(&portal) {
            Some(open) => {
                let end = open.rows.len().min(open.pos.saturating_add(count));
                let batch = open.rows[open.pos..end].to_vec();
                open.pos = end;
                Ok(batch)
            }
            None => Err(state.fail("34000", "portal does not exist")),
        }
    }

    fn copy_error(&self, scope: ScopeId) -> Option<NativeErrorData> {
        let mut state = self.state.lock();
        state.calls.copy_error += 1;
        let err = state.current_error.take()?;
        let addr = state.alloc(scope, HandleKind::ErrorData);
        Some(NativeErrorData {
            addr,
            severity: Severity::Error,
            sqlstate: err.sqlstate,
            message: err.message,
            detail: None,
            hint: None,
            context: Some("mock host call".into()),
            location: SourceLocation {
                file: Some("mock.c".into()),
                line: Some(1),
                function: Some("mock_host".into()),
            },
        })
    }
}
