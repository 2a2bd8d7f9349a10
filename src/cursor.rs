//! Forward-only streaming over an open portal.
//!
//! Rows are fetched in batches of at most the configured batch size, capped
//! by what remains of the row limit, and handed out one at a time. Once the
//! end of data has been observed no further fetch is issued.

use crate::error::BridgeError;
use crate::handle::Handle;
use crate::host::{Row, Value};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Opened, nothing fetched yet.
    Open,
    /// At least one full batch fetched; more rows may follow.
    Fetching,
    /// The host has no more rows for this cursor: a short batch came back or
    /// the row limit was reached. Rows already buffered are still handed out.
    Exhausted,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// Portal name; generated when unset.
    pub name: Option<String>,
    /// Total rows the cursor may return. `Some(0)` yields nothing.
    pub row_limit: Option<u64>,
    /// Rows per native fetch; the session default when unset. Zero yields
    /// nothing.
    pub batch_size: Option<usize>,
}

impl CursorOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_row_limit(mut self, limit: u64) -> Self {
        self.row_limit = Some(limit);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

#[derive(Debug)]
pub struct Cursor {
    session: Session,
    name: String,
    handle: Handle,
    columns: Vec<String>,
    batch: Vec<Row>,
    pos: usize,
    current: Option<Row>,
    row_limit: Option<u64>,
    batch_size: usize,
    /// Rows received from the host so far.
    fetched: u64,
    /// Rows handed out by `next`.
    returned: u64,
    end_of_data: bool,
    state: CursorState,
    fetch_calls: u64,
}

impl Cursor {
    pub(crate) fn new(
        session: Session,
        name: String,
        handle: Handle,
        columns: Vec<String>,
        row_limit: Option<u64>,
        batch_size: usize,
    ) -> Self {
        let empty = batch_size == 0 || row_limit == Some(0);
        Self {
            session,
            name,
            handle,
            columns,
            batch: Vec::new(),
            pos: 0,
            current: None,
            row_limit,
            batch_size,
            fetched: 0,
            returned: 0,
            end_of_data: empty,
            state: if empty {
                CursorState::Exhausted
            } else {
                CursorState::Open
            },
            fetch_calls: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// A cursor whose portal handle was invalidated by its scope ending
    /// reports `Closed` whatever state it was in.
    pub fn state(&self) -> CursorState {
        if self.handle.is_valid() {
            self.state
        } else {
            CursorState::Closed
        }
    }

    /// Rows advanced over so far.
    pub fn position(&self) -> u64 {
        self.returned
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls
    }

    fn remaining_allowance(&self) -> usize {
        match self.row_limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(self.fetched);
                usize::try_from(remaining).map_or(self.batch_size, |r| r.min(self.batch_size))
            }
            None => self.batch_size,
        }
    }

    fn exhaust(&mut self) -> bool {
        self.state = CursorState::Exhausted;
        self.end_of_data = true;
        self.current = None;
        self.batch.clear();
        self.pos = 0;
        false
    }

    /// Advances one row. Returns false once no row is available, and keeps
    /// returning false without touching the host.
    pub fn next(&mut self) -> Result<bool, BridgeError> {
        if self.state() == CursorState::Closed {
            self.state = CursorState::Closed;
            self.current = None;
            return Err(self.handle.stale_error());
        }
        if self.pos >= self.batch.len() {
            if self.end_of_data {
                return Ok(self.exhaust());
            }
            let count = self.remaining_allowance();
            if count == 0 {
                return Ok(self.exhaust());
            }
            self.fetch_calls += 1;
            let rows = self.session.fetch(&self.handle, count)?;
            self.fetched += rows.len() as u64;
            if rows.len() < count || self.row_limit.is_some_and(|limit| self.fetched >= limit) {
                self.end_of_data = true;
                self.state = CursorState::Exhausted;
            } else {
                self.state = CursorState::Fetching;
            }
            self.batch = rows;
            self.pos = 0;
            if self.batch.is_empty() {
                return Ok(self.exhaust());
            }
        }
        self.current = Some(std::mem::take(&mut self.batch[self.pos]));
        self.pos += 1;
        self.returned += 1;
        Ok(true)
    }

    pub fn current_row(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    pub fn get(&self, idx: usize) -> Result<&Value, BridgeError> {
        let row = self
            .current
            .as_ref()
            .ok_or_else(|| BridgeError::Validation("cursor is not positioned on a row".into()))?;
        row.get(idx).ok_or_else(|| {
            BridgeError::Validation(format!(
                "column index {idx} out of range for {} columns",
                row.len()
            ))
        })
    }

    pub fn get_by_name(&self, column: &str) -> Result<&Value, BridgeError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| BridgeError::Validation(format!("no column named '{column}'")))?;
        self.get(idx)
    }

    fn backward(&self, what: &str) -> BridgeError {
        BridgeError::Capability(format!(
            "cursor '{}' is forward-only: {what} from row {}",
            self.name, self.returned
        ))
    }

    /// Moves forward to the 1-based row `row`. Rows before the current
    /// position cannot be revisited.
    pub fn absolute(&mut self, row: u64) -> Result<bool, BridgeError> {
        if row < self.returned {
            return Err(self.backward(&format!("absolute({row})")));
        }
        while self.returned < row {
            if !self.next()? {
                return Ok(false);
            }
        }
        Ok(self.current.is_some())
    }

    pub fn relative(&mut self, delta: i64) -> Result<bool, BridgeError> {
        let Ok(steps) = u64::try_from(delta) else {
            return Err(self.backward(&format!("relative({delta})")));
        };
        let target = self.returned.saturating_add(steps);
        self.absolute(target)
    }

    pub fn previous(&mut self) -> Result<bool, BridgeError> {
        Err(self.backward("previous()"))
    }

    /// Allowed only while the cursor has not moved past the first row.
    pub fn first(&mut self) -> Result<bool, BridgeError> {
        if self.returned > 1 {
            return Err(self.backward("first()"));
        }
        self.absolute(1)
    }

    pub fn before_first(&mut self) -> Result<(), BridgeError> {
        if self.returned > 0 {
            return Err(self.backward("before_first()"));
        }
        Ok(())
    }

    /// Invalidates the portal. Idempotent; returns true on the first close.
    pub fn close(&mut self) -> bool {
        if self.state == CursorState::Closed {
            return false;
        }
        self.state = CursorState::Closed;
        self.current = None;
        self.batch.clear();
        self.session.invalidate(&self.handle)
    }
}
