//! The native host interface consumed by the bridge.
//!
//! Implementations wrap the real backend. Every method except
//! [`NativeHost::is_privileged_thread`] must only be called from the
//! privileged thread; the bridge enforces this before each call.

pub mod mock;
pub mod types;

use crate::error_bridge::{Severity, SourceLocation};
use crate::handle::registry::{ScopeId, ScopeKind};
use crate::handle::{HandleKind, NativeAddr};
pub use types::{Row, TypeOid, Value};

/// A native call failed. The details are retrieved with
/// [`NativeHost::copy_error`] before any other native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFailure;

pub type NativeResult<T> = Result<T, NativeFailure>;

/// Result of opening a portal.
#[derive(Debug, Clone, PartialEq)]
pub struct NativePortal {
    pub addr: NativeAddr,
    pub columns: Vec<String>,
}

/// A copy of the host's current error report, allocated in a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeErrorData {
    pub addr: NativeAddr,
    pub severity: Severity,
    pub sqlstate: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub context: Option<String>,
    pub location: SourceLocation,
}

pub trait NativeHost: Send + Sync {
    fn is_privileged_thread(&self) -> bool;

    fn begin_scope(&self, scope: ScopeId, parent: Option<ScopeId>, kind: ScopeKind);

    /// Bulk-frees everything allocated in `scope`.
    fn end_scope(&self, scope: ScopeId);

    /// Frees a single structure ahead of its scope.
    fn release(&self, kind: HandleKind, addr: NativeAddr);

    fn prepare(
        &self,
        scope: ScopeId,
        text: &str,
        param_types: &[TypeOid],
    ) -> NativeResult<NativeAddr>;

    /// Runs a prepared plan, processing at most `count` rows (0 = all).
    fn execute(&self, plan: NativeAddr, params: &[Value], count: u64) -> NativeResult<u64>;

    fn cursor_open(
        &self,
        scope: ScopeId,
        plan: NativeAddr,
        name: &str,
        params: &[Value],
    ) -> NativeResult<NativePortal>;

    /// Fetches at most `count` rows forward from the portal.
    fn cursor_fetch(&self, portal: NativeAddr, count: usize) -> NativeResult<Vec<Row>>;

    /// Copies the current error report into `scope`. `None` when the host
    /// has nothing to report.
    fn copy_error(&self, scope: ScopeId) -> Option<NativeErrorData>;
}
