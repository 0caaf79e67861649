//! Cross-thread result stream
//!
//! [`ThreadedResultStream`] serves the same primitives as the cooperative
//! stream, but its source delivers from a thread it owns while the consumer
//! blocks. Every perform cycle gets its own unbounded tokio channel; the
//! consumer parks in `blocking_recv`, so these methods must be called from
//! plain threads (or `spawn_blocking`), never from inside an async task.

use crate::buffer::{BufferStats, ResultBuffer, ResultState};
use crate::config::QueryOptions;
use crate::demand::Demand;
use crate::error::{QueryError, QueryResult};
use crate::sentinel::{Metadata, Sentinel};
use crate::source::{Callback, QuerySource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, WeakUnboundedSender};

/// What travels over a cycle's channel
enum Envelope<I> {
    Delivery(Sentinel<I>),
    /// Sent by a canceller so a parked consumer notices the request
    Wake,
}

/// Flags of one perform cycle, shared with the producer and cancel handles
struct CycleShared<I> {
    cancelled: AtomicBool,
    finished: AtomicBool,
    wake: WeakUnboundedSender<Envelope<I>>,
}

struct Cycle<I> {
    receiver: UnboundedReceiver<Envelope<I>>,
    shared: Arc<CycleShared<I>>,
}

type CycleSlot<I> = Arc<Mutex<Option<Arc<CycleShared<I>>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Test-and-set the cycle's cancel flag and forward the request to the
/// source once. Cycles that already delivered their terminal sentinel are
/// left alone.
fn request_cancel<S>(source: &S, cycle: &CycleShared<S::Item>) -> bool
where
    S: QuerySource + ?Sized,
{
    if cycle.finished.load(Ordering::Acquire) {
        return false;
    }
    if cycle.cancelled.swap(true, Ordering::AcqRel) {
        return false;
    }
    log::debug!("cancelling in-flight query");
    source.cancel();
    if let Some(sender) = cycle.wake.upgrade() {
        let _ = sender.send(Envelope::Wake);
    }
    true
}

/// Cancels the running query of a [`ThreadedResultStream`] from any thread
pub struct CancelHandle<S: QuerySource> {
    source: Arc<S>,
    slot: CycleSlot<S::Item>,
}

impl<S: QuerySource> Clone for CancelHandle<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<S: QuerySource> CancelHandle<S> {
    /// Idempotent; a no-op when no query is running
    pub fn cancel(&self) {
        let current = lock(&self.slot).clone();
        if let Some(cycle) = current {
            request_cancel(&*self.source, &cycle);
        }
    }
}

struct CancelGuard<S: QuerySource> {
    source: Arc<S>,
    cycle: Option<Arc<CycleShared<S::Item>>>,
}

impl<S: QuerySource> CancelGuard<S> {
    fn disarm(mut self) {
        self.cycle = None;
    }
}

impl<S: QuerySource> Drop for CancelGuard<S> {
    fn drop(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            request_cancel(&*self.source, &cycle);
        }
    }
}

/// Lazy, memoizing result stream fed from a producer thread
pub struct ThreadedResultStream<S: QuerySource, T> {
    source: Arc<S>,
    options: QueryOptions,
    mapper: Box<dyn Fn(S::Item) -> T + Send>,
    buffer: ResultBuffer<T>,
    cycle: Option<Cycle<S::Item>>,
    slot: CycleSlot<S::Item>,
}

impl<S: QuerySource> ThreadedResultStream<S, S::Item> {
    pub fn new(source: S) -> Self {
        Self::with_options(source, QueryOptions::default())
    }

    pub fn with_options(source: S, options: QueryOptions) -> Self {
        ThreadedResultStream::with_mapper(source, options, |item| item)
    }
}

impl<S: QuerySource, T> ThreadedResultStream<S, T> {
    pub fn with_mapper<F>(source: S, options: QueryOptions, mapper: F) -> Self
    where
        F: Fn(S::Item) -> T + Send + 'static,
    {
        Self {
            source: Arc::new(source),
            options,
            mapper: Box::new(mapper),
            buffer: ResultBuffer::new(),
            cycle: None,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle that can cancel this stream's running query from another thread
    pub fn cancel_handle(&self) -> CancelHandle<S> {
        CancelHandle {
            source: Arc::clone(&self.source),
            slot: Arc::clone(&self.slot),
        }
    }

    pub fn each<F>(&mut self, mut visitor: F) -> QueryResult<&mut Self>
    where
        F: FnMut(&T),
    {
        self.try_each(|row| {
            visitor(row);
            Ok::<(), QueryError>(())
        })
    }

    /// Visit rows until the result ends or the visitor fails. A visitor
    /// error cancels the source and is returned as is.
    pub fn try_each<F, E>(&mut self, mut visitor: F) -> Result<&mut Self, E>
    where
        F: FnMut(&T) -> Result<(), E>,
        E: From<QueryError>,
    {
        self.sync();
        self.ensure_replayable()?;
        if self.buffer.state() == ResultState::NotStarted {
            self.start(Demand::Unbounded, false)?;
        }

        let guard = self.guard();
        let mut index = 0;
        loop {
            if let Some(row) = self.buffer.get(index) {
                if let Err(err) = visitor(row) {
                    guard.disarm();
                    self.cancel();
                    return Err(err);
                }
                index += 1;
            } else if self.buffer.state() == ResultState::InProgress {
                self.wait_for_delivery();
            } else {
                break;
            }
        }
        guard.disarm();

        self.raise_error()?;
        Ok(self)
    }

    pub fn first(&mut self) -> QueryResult<Option<T>>
    where
        T: Clone,
    {
        Ok(self.take(1)?.into_iter().next())
    }

    /// Up to `n` leading rows; the source is cancelled once they are buffered
    /// unless it already finished on its own.
    pub fn take(&mut self, n: usize) -> QueryResult<Vec<T>>
    where
        T: Clone,
    {
        self.sync();
        self.ensure_replayable()?;
        if n == 0 {
            return Ok(Vec::new());
        }

        let demand = Demand::Limit(n);
        if self.buffer.state() == ResultState::NotStarted {
            self.start(demand, false)?;
        }

        let guard = self.guard();
        while !self.buffer.is_satisfied(demand) && self.buffer.state() == ResultState::InProgress
        {
            self.wait_for_delivery();
        }
        // The producer may still be about to send its terminal; cancel only if it keeps going.
        if self.hint_reached(demand) {
            self.wait_for_delivery();
        }
        guard.disarm();
        self.cancel();

        let rows: Vec<T> = (0..n)
            .map_while(|index| self.buffer.get(index).cloned())
            .collect();
        if rows.len() < n {
            self.raise_error()?;
        }
        Ok(rows)
    }

    pub fn count(&mut self) -> QueryResult<u64> {
        self.sync();
        if self.buffer.metadata().is_none() && self.buffer.state() == ResultState::NotStarted {
            self.start(Demand::Limit(1), false)?;
            let guard = self.guard();
            while self.buffer.state() == ResultState::InProgress {
                self.wait_for_delivery();
            }
            guard.disarm();
        }
        self.total_rows()
    }

    /// One-shot iteration handing rows out by value and dropping them as it goes
    pub fn stream<F>(&mut self, mut visitor: F) -> QueryResult<&mut Self>
    where
        F: FnMut(T),
    {
        self.try_stream(|row| {
            visitor(row);
            Ok::<(), QueryError>(())
        })
    }

    pub fn try_stream<F, E>(&mut self, mut visitor: F) -> Result<&mut Self, E>
    where
        F: FnMut(T) -> Result<(), E>,
        E: From<QueryError>,
    {
        self.sync();
        if self.buffer.state() != ResultState::NotStarted {
            return Err(QueryError::invalid_state(
                "stream() needs a fresh result; call reset() first",
            )
            .into());
        }
        self.start(Demand::Unbounded, true)?;

        let guard = self.guard();
        loop {
            if let Some(row) = self.buffer.pop_front() {
                if let Err(err) = visitor(row) {
                    guard.disarm();
                    self.cancel();
                    return Err(err);
                }
            } else if self.buffer.state() == ResultState::InProgress {
                self.wait_for_delivery();
            } else {
                break;
            }
        }
        guard.disarm();

        self.raise_error()?;
        Ok(self)
    }

    /// Request cancellation of the running query. Never fails; no-op unless in progress.
    pub fn cancel(&mut self) {
        self.sync();
        if self.buffer.state() != ResultState::InProgress {
            return;
        }
        if let Some(cycle) = self.cycle.as_ref() {
            request_cancel(&*self.source, &cycle.shared);
        }
        self.sync();
    }

    /// Discard buffered rows, metadata and errors so the next call performs again
    pub fn reset(&mut self) -> QueryResult<()> {
        self.sync();
        self.buffer.reset()?;
        self.end_cycle();
        Ok(())
    }

    /// Current lifecycle state, counting a requested cancel as already applied
    pub fn state(&self) -> ResultState {
        let state = self.buffer.state();
        let cancelled = self
            .cycle
            .as_ref()
            .map_or(false, |cycle| cycle.shared.cancelled.load(Ordering::Acquire));
        match state {
            ResultState::InProgress if cancelled && self.buffer.is_empty() => {
                ResultState::NotStarted
            }
            ResultState::InProgress if cancelled => ResultState::Cancelled,
            other => other,
        }
    }

    /// Whether the buffered rows are the whole result and can be replayed
    pub fn complete_result_set(&self) -> bool {
        self.buffer.complete_result_set()
    }

    pub fn query_in_progress(&self) -> bool {
        self.state() == ResultState::InProgress
    }

    /// True once the run completed, failed or was cancelled
    pub fn query_completed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Metadata of the `Final` sentinel, once received
    pub fn metadata(&self) -> Option<&Metadata> {
        self.buffer.metadata()
    }

    /// Options passed to the source on every perform
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Rows currently held in memory
    pub fn buffered(&self) -> impl Iterator<Item = &T> {
        self.buffer.rows()
    }

    /// Perform, delivery and cancellation counters
    pub fn stats(&self) -> &BufferStats {
        self.buffer.stats()
    }

    fn start(&mut self, demand: Demand, streaming: bool) -> QueryResult<()> {
        self.buffer.begin(demand, streaming)?;
        let hint = demand.reconcile(self.options.limit);

        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(CycleShared {
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            wake: sender.downgrade(),
        });
        let producer = Arc::clone(&shared);
        let callback: Callback<S::Item> = Box::new(move |sentinel: Sentinel<S::Item>| {
            let kind = sentinel.kind();
            if sentinel.is_terminal() {
                producer.finished.store(true, Ordering::Release);
            }
            if sender.send(Envelope::Delivery(sentinel)).is_err() {
                log::debug!("dropping {} delivery; result stream is gone", kind);
            }
        });
        *lock(&self.slot) = Some(Arc::clone(&shared));
        self.cycle = Some(Cycle { receiver, shared });

        log::debug!("performing query ({}, consumer demand {})", hint, demand);
        if let Err(err) = self.source.perform(hint, &self.options, callback) {
            self.end_cycle();
            self.buffer.rollback();
            return Err(err);
        }
        Ok(())
    }

    fn end_cycle(&mut self) {
        self.cycle = None;
        *lock(&self.slot) = None;
    }

    /// Apply one receive result. `None` means every sender is gone.
    fn absorb(&mut self, received: Option<Envelope<S::Item>>) {
        let Some(cycle) = self.cycle.as_ref() else {
            return;
        };
        if cycle.shared.cancelled.load(Ordering::Acquire) {
            self.buffer.mark_cancelled();
        }

        match received {
            Some(Envelope::Delivery(sentinel)) => {
                let mapper = &self.mapper;
                self.buffer.accept_with(sentinel, |item| mapper(item));
            }
            Some(Envelope::Wake) => {}
            None => {
                if self.buffer.state() == ResultState::InProgress {
                    log::warn!("query source dropped its callback without a terminal sentinel");
                    let _ = self.buffer.fail(QueryError::Disconnected);
                }
            }
        }

        if self.buffer.state() != ResultState::InProgress {
            self.end_cycle();
        }
    }

    /// Drain whatever is already queued without blocking
    fn sync(&mut self) {
        while let Some(cycle) = self.cycle.as_mut() {
            match cycle.receiver.try_recv() {
                Ok(envelope) => self.absorb(Some(envelope)),
                Err(TryRecvError::Empty) => {
                    if cycle.shared.cancelled.load(Ordering::Acquire) {
                        self.absorb(Some(Envelope::Wake));
                    }
                    break;
                }
                Err(TryRecvError::Disconnected) => self.absorb(None),
            }
        }
    }

    /// Block until the producer sends something, then absorb it
    fn wait_for_delivery(&mut self) {
        let received = match self.cycle.as_mut() {
            Some(cycle) => cycle.receiver.blocking_recv(),
            None => return,
        };
        self.absorb(received);
        self.sync();
    }

    fn hint_reached(&self, demand: Demand) -> bool {
        self.buffer.state() == ResultState::InProgress
            && demand
                .reconcile(self.options.limit)
                .is_met_by(self.buffer.len())
    }

    fn guard(&self) -> CancelGuard<S> {
        CancelGuard {
            source: Arc::clone(&self.source),
            cycle: self.cycle.as_ref().map(|cycle| Arc::clone(&cycle.shared)),
        }
    }

    fn ensure_replayable(&self) -> QueryResult<()> {
        if self.buffer.is_drained() {
            return Err(QueryError::NotRestartable);
        }
        Ok(())
    }

    fn raise_error(&self) -> QueryResult<()> {
        match self.buffer.error() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn total_rows(&self) -> QueryResult<u64> {
        if let Some(total) = self.buffer.metadata().and_then(|meta| meta.total_rows) {
            return Ok(total);
        }
        self.raise_error()?;
        if self.buffer.complete_result_set() {
            return Ok(self.buffer.len() as u64);
        }
        Err(QueryError::CountUnavailable)
    }
}

impl<S: QuerySource, T> Drop for ThreadedResultStream<S, T> {
    fn drop(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            if self.buffer.state() == ResultState::InProgress {
                request_cancel(&*self.source, &cycle.shared);
            }
        }
        *lock(&self.slot) = None;
    }
}

/// Blocking iterator over the rows of a [`ThreadedResultStream`].
///
/// Rows are handed out by value as a streamed run; dropping the iterator
/// early cancels the source.
pub struct RowIter<S: QuerySource, T> {
    results: ThreadedResultStream<S, T>,
    started: bool,
    done: bool,
}

impl<S: QuerySource, T> Iterator for RowIter<S, T> {
    type Item = QueryResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let results = &mut self.results;
        if !self.started {
            self.started = true;
            results.sync();
            let started = if results.buffer.is_drained() {
                Err(QueryError::NotRestartable)
            } else if results.buffer.state() == ResultState::NotStarted {
                results.start(Demand::Unbounded, true)
            } else {
                Ok(())
            };
            if let Err(err) = started {
                self.done = true;
                return Some(Err(err));
            }
        }

        loop {
            if let Some(row) = results.buffer.pop_front() {
                return Some(Ok(row));
            }
            if results.buffer.state() == ResultState::InProgress {
                results.wait_for_delivery();
                continue;
            }
            self.done = true;
            return results.raise_error().err().map(Err);
        }
    }
}

impl<S: QuerySource, T> IntoIterator for ThreadedResultStream<S, T> {
    type Item = QueryResult<T>;
    type IntoIter = RowIter<S, T>;

    fn into_iter(self) -> Self::IntoIter {
        RowIter {
            results: self,
            started: false,
            done: false,
        }
    }
}
