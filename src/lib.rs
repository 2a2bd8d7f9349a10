pub mod config;
pub mod cursor;
pub mod error;
pub mod error_bridge;
pub mod handle;
pub mod host;
pub mod metrics;
pub mod plan;
pub mod session;

pub use crate::config::{BridgeConfig, PinPolicy};
pub use crate::cursor::{Cursor, CursorOptions, CursorState};
pub use crate::error::{BridgeError, BridgeErrorCode};
pub use crate::error_bridge::{ErrorRecord, Severity, SourceLocation, SqlState};
pub use crate::handle::death_row::{ReclaimOrigin, ReclaimStats};
pub use crate::handle::registry::{
    LeakWarning, ScopeId, ScopeKind, TeardownEvent, TeardownReport,
};
pub use crate::handle::{Handle, HandleId, HandleKind, NativeAddr, PinGuard};
pub use crate::host::mock::MockHost;
pub use crate::host::{NativeHost, Row, TypeOid, Value};
pub use crate::metrics::SessionMetrics;
pub use crate::plan::{Plan, PlanCacheStats, PlanKey};
pub use crate::session::{Savepoint, Session};
