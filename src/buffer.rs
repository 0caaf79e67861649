//! Result buffer and its state machine
//!
//! [`ResultBuffer`] holds the rows delivered by one perform cycle together
//! with the terminal outcome. It has no synchronization of its own: each
//! stream backend owns one and feeds it from its handoff.

use crate::demand::Demand;
use crate::error::{QueryError, QueryResult};
use crate::sentinel::{Metadata, Sentinel, SentinelKind};
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle of a result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultState {
    #[default]
    NotStarted,
    InProgress,
    /// Finished by a `Final` or `Error` sentinel
    Complete,
    /// Cut short by the consumer; partial rows are kept, no error is raised
    Cancelled,
}

impl ResultState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResultState::Complete | ResultState::Cancelled)
    }
}

/// Counters for one buffer, kept across resets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub performs: u64,
    pub rows_delivered: u64,
    pub rows_discarded: u64,
    pub cancellations: u64,
}

impl fmt::Display for BufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResultBuffer(performs={}, delivered={}, discarded={}, cancelled={})",
            self.performs, self.rows_delivered, self.rows_discarded, self.cancellations
        )
    }
}

/// Ordered rows of one perform cycle plus its completion or error state
#[derive(Debug)]
pub struct ResultBuffer<T> {
    rows: VecDeque<T>,
    /// Rows already dropped from the front by a streamed run
    offset: usize,
    state: ResultState,
    demand: Demand,
    streaming: bool,
    metadata: Option<Metadata>,
    error: Option<QueryError>,
    complete_result_set: bool,
    stats: BufferStats,
}

impl<T> Default for ResultBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultBuffer<T> {
    pub fn new() -> Self {
        Self {
            rows: VecDeque::new(),
            offset: 0,
            state: ResultState::NotStarted,
            demand: Demand::Unbounded,
            streaming: false,
            metadata: None,
            error: None,
            complete_result_set: false,
            stats: BufferStats::default(),
        }
    }

    /// Enter `InProgress` for a new perform cycle
    pub fn begin(&mut self, demand: Demand, streaming: bool) -> QueryResult<()> {
        if self.state != ResultState::NotStarted {
            return Err(QueryError::invalid_state(format!(
                "cannot start a perform cycle from {:?}",
                self.state
            )));
        }
        self.state = ResultState::InProgress;
        self.demand = demand;
        self.streaming = streaming;
        self.stats.performs += 1;
        Ok(())
    }

    pub fn append(&mut self, row: T) -> QueryResult<()> {
        if self.state != ResultState::InProgress {
            return Err(QueryError::invalid_state(format!(
                "cannot append a row in state {:?}",
                self.state
            )));
        }
        self.rows.push_back(row);
        self.stats.rows_delivered += 1;
        Ok(())
    }

    pub fn complete(&mut self, metadata: Metadata) -> QueryResult<()> {
        if self.state != ResultState::InProgress {
            return Err(QueryError::invalid_state(format!(
                "cannot complete in state {:?}",
                self.state
            )));
        }
        // Only an unbounded, non-streamed run is known to hold the whole result.
        self.complete_result_set = self.demand == Demand::Unbounded && !self.streaming;
        self.metadata = Some(metadata);
        self.state = ResultState::Complete;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<QueryError>) -> QueryResult<()> {
        if self.state != ResultState::InProgress {
            return Err(QueryError::invalid_state(format!(
                "cannot record an error in state {:?}",
                self.state
            )));
        }
        self.error = Some(error.into());
        self.complete_result_set = false;
        self.state = ResultState::Complete;
        Ok(())
    }

    /// Record a consumer cancellation.
    ///
    /// No-op unless `InProgress`. A cycle that has not delivered anything yet
    /// goes straight back to `NotStarted`; otherwise the partial rows are kept
    /// as `Cancelled` until `reset`.
    pub fn mark_cancelled(&mut self) -> ResultState {
        if self.state == ResultState::InProgress {
            self.stats.cancellations += 1;
            if self.len() == 0 {
                self.clear();
            } else {
                self.complete_result_set = false;
                self.state = ResultState::Cancelled;
            }
        }
        self.state
    }

    /// Undo `begin` when the source refused to perform
    pub(crate) fn rollback(&mut self) {
        if self.state == ResultState::InProgress && self.is_empty() {
            self.stats.performs = self.stats.performs.saturating_sub(1);
            self.clear();
        }
    }

    /// True once `demand` rows are held or the cycle is over
    pub fn is_satisfied(&self, demand: Demand) -> bool {
        self.state.is_terminal() || demand.is_met_by(self.len())
    }

    /// Feed one sentinel from the delivery path.
    ///
    /// Deliveries that land outside `InProgress` (late arrivals after a
    /// cancel, or a second terminal) are counted and dropped. Returns whether
    /// the sentinel was recorded.
    pub fn accept_with<I, F>(&mut self, sentinel: Sentinel<I>, map: F) -> bool
    where
        F: FnOnce(I) -> T,
    {
        if self.state != ResultState::InProgress {
            self.discard(sentinel.kind());
            return false;
        }
        let recorded = match sentinel {
            Sentinel::Row(item) => self.append(map(item)),
            Sentinel::Final(metadata) => self.complete(metadata),
            Sentinel::Error(error) => self.fail(error),
        };
        recorded.is_ok()
    }

    pub(crate) fn discard(&mut self, kind: SentinelKind) {
        if kind == SentinelKind::Row {
            self.stats.rows_discarded += 1;
        }
        log::debug!("discarding late {} delivery in state {:?}", kind, self.state);
    }

    /// Drop everything and return to `NotStarted`
    pub fn reset(&mut self) -> QueryResult<()> {
        if self.state == ResultState::InProgress {
            return Err(QueryError::invalid_state(
                "cannot reset while the query is in progress",
            ));
        }
        self.clear();
        Ok(())
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.offset = 0;
        self.state = ResultState::NotStarted;
        self.demand = Demand::Unbounded;
        self.streaming = false;
        self.metadata = None;
        self.error = None;
        self.complete_result_set = false;
    }

    /// Row at absolute position `index`, if still held
    pub fn get(&self, index: usize) -> Option<&T> {
        index
            .checked_sub(self.offset)
            .and_then(|i| self.rows.get(i))
    }

    /// Remove the oldest held row (streamed runs only keep unvisited rows)
    pub fn pop_front(&mut self) -> Option<T> {
        let row = self.rows.pop_front()?;
        self.offset += 1;
        Some(row)
    }

    /// Number of rows delivered in this cycle, including dropped ones
    pub fn len(&self) -> usize {
        self.offset + self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows currently held
    pub fn rows(&self) -> impl Iterator<Item = &T> {
        self.rows.iter()
    }

    pub fn state(&self) -> ResultState {
        self.state
    }

    pub fn demand(&self) -> Demand {
        self.demand
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether rows were dropped by a streamed run
    pub fn is_drained(&self) -> bool {
        self.offset > 0 || (self.streaming && self.state.is_terminal())
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Failure that ended this cycle, raised once consumption reaches the end of the rows
    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    pub fn complete_result_set(&self) -> bool {
        self.complete_result_set
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}
