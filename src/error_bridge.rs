//! Native error reports as managed errors, and the unhandled-error sentinel.
//!
//! A failed native call leaves the current transaction unusable until it is
//! rolled back. The first captured record becomes the sentinel; until
//! [`ErrorBridge::clear`] runs (savepoint rollback or abort), every new
//! native call fails with [`BridgeError::UnhandledError`] around that same
//! record.

use crate::error::BridgeError;
use crate::handle::Handle;
use crate::host::NativeErrorData;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Log,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
    Panic,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Debug => "DEBUG",
            Severity::Log => "LOG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
        };
        f.write_str(label)
    }
}

/// Five-character condition code, kept exactly as the host reported it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SqlState(String);

impl SqlState {
    pub const INTERNAL_ERROR: &'static str = "XX000";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two-character class, e.g. `42` for syntax and access rule errors.
    pub fn class(&self) -> &str {
        self.0.get(..2).unwrap_or(self.0.as_str())
    }

    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 5
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
}

/// Immutable copy of one native error report.
#[derive(Debug, Serialize)]
pub struct ErrorRecord {
    severity: Severity,
    sqlstate: SqlState,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
    context: Option<String>,
    location: SourceLocation,
    #[serde(skip)]
    native: Option<Handle>,
}

impl ErrorRecord {
    pub(crate) fn from_native(data: NativeErrorData, native: Option<Handle>) -> Self {
        Self {
            severity: data.severity,
            sqlstate: SqlState::new(data.sqlstate),
            message: data.message,
            detail: data.detail,
            hint: data.hint,
            context: data.context,
            location: data.location,
            native,
        }
    }

    /// A record not backed by native memory.
    pub fn synthetic(severity: Severity, sqlstate: SqlState, message: impl Into<String>) -> Self {
        Self {
            severity,
            sqlstate,
            message: message.into(),
            detail: None,
            hint: None,
            context: None,
            location: SourceLocation::default(),
            native: None,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn sqlstate(&self) -> &SqlState {
        &self.sqlstate
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    /// Handle to the host's copy of the report, if one was made.
    pub fn native_handle(&self) -> Option<&Handle> {
        self.native.as_ref()
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity, self.message, self.sqlstate
        )
    }
}

#[derive(Debug, Default)]
pub struct ErrorBridge {
    unhandled: Mutex<Option<Arc<ErrorRecord>>>,
    captured: AtomicU64,
}

impl ErrorBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly captured failure. The first unrecovered record
    /// stays the sentinel; later ones are returned but do not replace it.
    pub(crate) fn raise(&self, record: ErrorRecord) -> Arc<ErrorRecord> {
        let record = Arc::new(record);
        self.captured.fetch_add(1, Ordering::Relaxed);
        warn!(
            sqlstate = %record.sqlstate,
            severity = %record.severity,
            message = %record.message,
            "native call failed"
        );
        let mut unhandled = self.unhandled.lock();
        if unhandled.is_none() {
            *unhandled = Some(Arc::clone(&record));
        }
        record
    }

    pub fn unhandled(&self) -> Option<Arc<ErrorRecord>> {
        self.unhandled.lock().clone()
    }

    pub fn is_blocked(&self) -> bool {
        self.unhandled.lock().is_some()
    }

    /// Fails with the sentinel while one is set.
    pub fn check(&self) -> Result<(), BridgeError> {
        match self.unhandled.lock().as_ref() {
            Some(record) => Err(BridgeError::UnhandledError(Arc::clone(record))),
            None => Ok(()),
        }
    }

    /// Recovery after a rollback.
    pub(crate) fn clear(&self) -> Option<Arc<ErrorRecord>> {
        self.unhandled.lock().take()
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }
}
