//! Single-threaded result stream
//!
//! [`CooperativeResultStream`] turns a push-based [`LocalQuerySource`] into
//! pull-style `each` / `first` / `take` / `count` / `stream` calls on a
//! cooperative executor (a tokio `LocalSet` or current-thread runtime).
//!
//! Every perform cycle gets its own unbounded `futures` channel. The
//! source's callback only sends into it, and the consumer picks deliveries
//! up when the executor polls it again, so a synchronous burst of any length
//! grows the channel rather than the call stack.

use crate::buffer::{BufferStats, ResultBuffer, ResultState};
use crate::config::QueryOptions;
use crate::demand::Demand;
use crate::error::{QueryError, QueryResult};
use crate::sentinel::{Metadata, Sentinel};
use crate::source::{LocalCallback, LocalQuerySource};
use async_stream::stream;
use futures::channel::mpsc::{self, TryRecvError, UnboundedReceiver};
use futures_util::stream::{LocalBoxStream, StreamExt};
use std::cell::Cell;
use std::rc::Rc;

/// Flags of one perform cycle, shared with the source's callback
#[derive(Default)]
struct CycleFlags {
    cancelled: Cell<bool>,
    /// Set once the terminal sentinel has been sent
    finished: Cell<bool>,
}

struct Cycle<I> {
    receiver: UnboundedReceiver<Sentinel<I>>,
    flags: Rc<CycleFlags>,
}

/// Flag the cycle as cancelled and tell the source, at most once per cycle.
/// A cycle whose terminal sentinel already went out is left alone.
fn cancel_cycle<S>(source: &S, flags: &CycleFlags) -> bool
where
    S: LocalQuerySource + ?Sized,
{
    if flags.finished.get() || flags.cancelled.replace(true) {
        return false;
    }
    log::debug!("cancelling in-flight query");
    source.cancel();
    true
}

/// Cancels the cycle if an iteration unwinds or its future is dropped
struct CancelGuard<S: LocalQuerySource> {
    source: Rc<S>,
    flags: Option<Rc<CycleFlags>>,
}

impl<S: LocalQuerySource> CancelGuard<S> {
    fn disarm(mut self) {
        self.flags = None;
    }
}

impl<S: LocalQuerySource> Drop for CancelGuard<S> {
    fn drop(&mut self) {
        if let Some(flags) = self.flags.take() {
            cancel_cycle(&*self.source, &flags);
        }
    }
}

/// Lazy, memoizing result stream for a single-threaded scheduler.
///
/// Nothing is performed until the first consuming call. A run that reached
/// the source's natural end under unbounded demand is replayed from memory
/// by later calls; anything else needs [`reset`](Self::reset) to run again.
pub struct CooperativeResultStream<S: LocalQuerySource, T> {
    source: Rc<S>,
    options: QueryOptions,
    mapper: Box<dyn Fn(S::Item) -> T>,
    buffer: ResultBuffer<T>,
    cycle: Option<Cycle<S::Item>>,
}

impl<S: LocalQuerySource, T> std::fmt::Debug for CooperativeResultStream<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeResultStream")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S> CooperativeResultStream<S, S::Item>
where
    S: LocalQuerySource,
    S::Item: 'static,
{
    pub fn new(source: S) -> Self {
        Self::with_options(source, QueryOptions::default())
    }

    pub fn with_options(source: S, options: QueryOptions) -> Self {
        CooperativeResultStream::with_mapper(source, options, |item| item)
    }
}

impl<S, T> CooperativeResultStream<S, T>
where
    S: LocalQuerySource,
    S::Item: 'static,
{
    /// Create a stream that passes every raw row through `mapper` before buffering it
    pub fn with_mapper<F>(source: S, options: QueryOptions, mapper: F) -> Self
    where
        F: Fn(S::Item) -> T + 'static,
    {
        Self {
            source: Rc::new(source),
            options,
            mapper: Box::new(mapper),
            buffer: ResultBuffer::new(),
            cycle: None,
        }
    }

    /// Visit every row in order, performing the query first if needed
    pub async fn each<F>(&mut self, mut visitor: F) -> QueryResult<&mut Self>
    where
        F: FnMut(&T),
    {
        self.try_each(|row| {
            visitor(row);
            Ok::<(), QueryError>(())
        })
        .await
    }

    /// Like [`each`](Self::each), but a visitor error stops the iteration,
    /// cancels the source and is returned unchanged.
    pub async fn try_each<F, E>(&mut self, mut visitor: F) -> Result<&mut Self, E>
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
                self.wait_for_delivery().await;
            } else {
                break;
            }
        }
        guard.disarm();

        self.raise_error()?;
        Ok(self)
    }

    /// First row, or `None` for an empty result. Cancels the source once a row is in hand.
    pub async fn first(&mut self) -> QueryResult<Option<T>>
    where
        T: Clone,
    {
        Ok(self.take(1).await?.into_iter().next())
    }

    /// Up to `n` leading rows.
    ///
    /// Performs with a demand of `n` and cancels the source as soon as `n`
    /// rows are buffered, unless the source has already ended on its own.
    pub async fn take(&mut self, n: usize) -> QueryResult<Vec<T>>
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
            self.wait_for_delivery().await;
        }
        // A source holding to the hint sends its terminal next; only one that keeps going is cancelled.
        if self.hint_reached(demand) {
            self.wait_for_delivery().await;
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

    /// Authoritative row count from the completion metadata.
    ///
    /// Runs a limit-1 perform to completion when nothing has been performed yet.
    pub async fn count(&mut self) -> QueryResult<u64> {
        self.sync();
        if self.buffer.metadata().is_none() && self.buffer.state() == ResultState::NotStarted {
            self.start(Demand::Limit(1), false)?;
            let guard = self.guard();
            while self.buffer.state() == ResultState::InProgress {
                self.wait_for_delivery().await;
            }
            guard.disarm();
        }
        self.total_rows()
    }

    /// One-shot iteration that drops each row after visiting it.
    ///
    /// Needs a fresh (`NotStarted`) stream; afterwards only `reset` makes
    /// the results consumable again.
    pub async fn stream<F>(&mut self, mut visitor: F) -> QueryResult<&mut Self>
    where
        F: FnMut(T),
    {
        self.try_stream(|row| {
            visitor(row);
            Ok::<(), QueryError>(())
        })
        .await
    }

    pub async fn try_stream<F, E>(&mut self, mut visitor: F) -> Result<&mut Self, E>
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
                self.wait_for_delivery().await;
            } else {
                break;
            }
        }
        guard.disarm();

        self.raise_error()?;
        Ok(self)
    }

    /// Consume the stream as a `futures::Stream` of rows.
    ///
    /// Rows are handed out by value and not memoized. Dropping the returned
    /// stream early cancels the source.
    pub fn into_stream(self) -> LocalBoxStream<'static, QueryResult<T>>
    where
        S: 'static,
        T: 'static,
    {
        let mut results = self;
        stream! {
            results.sync();
            let started = if results.buffer.is_drained() {
                Err(QueryError::NotRestartable)
            } else if results.buffer.state() == ResultState::NotStarted {
                results.start(Demand::Unbounded, true)
            } else {
                Ok(())
            };

            match started {
                Err(err) => {
                    yield Err(err);
                }
                Ok(()) => {
                    let guard = results.guard();
                    loop {
                        if let Some(row) = results.buffer.pop_front() {
                            yield Ok(row);
                        } else if results.buffer.state() == ResultState::InProgress {
                            results.wait_for_delivery().await;
                        } else {
                            break;
                        }
                    }
                    guard.disarm();
                    if let Err(err) = results.raise_error() {
                        yield Err(err);
                    }
                }
            }
        }
        .boxed_local()
    }

    /// Request cancellation of the running query. Never fails; no-op unless in progress.
    pub fn cancel(&mut self) {
        self.sync();
        if self.buffer.state() != ResultState::InProgress {
            return;
        }
        if let Some(cycle) = self.cycle.as_ref() {
            cancel_cycle(&*self.source, &cycle.flags);
        }
        self.sync();
    }

    /// Discard buffered rows, metadata and errors so the next call performs again
    pub fn reset(&mut self) -> QueryResult<()> {
        self.sync();
        self.buffer.reset()?;
        self.cycle = None;
        Ok(())
    }

    /// Current lifecycle state, counting a requested cancel as already applied
    pub fn state(&self) -> ResultState {
        let state = self.buffer.state();
        let cancelled = self
            .cycle
            .as_ref()
            .map_or(false, |cycle| cycle.flags.cancelled.get());
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

        let (sender, receiver) = mpsc::unbounded();
        let flags = Rc::new(CycleFlags::default());
        let producer = Rc::clone(&flags);
        let callback: LocalCallback<S::Item> = Box::new(move |sentinel: Sentinel<S::Item>| {
            if producer.cancelled.get() {
                log::debug!("dropping {} delivery after cancellation", sentinel.kind());
                return;
            }
            let kind = sentinel.kind();
            if sentinel.is_terminal() {
                producer.finished.set(true);
            }
            if sender.unbounded_send(sentinel).is_err() {
                log::debug!("dropping {} delivery for a finished cycle", kind);
            }
        });
        self.cycle = Some(Cycle { receiver, flags });

        log::debug!("performing query ({}, consumer demand {})", hint, demand);
        if let Err(err) = self.source.perform(hint, &self.options, callback) {
            self.cycle = None;
            self.buffer.rollback();
            return Err(err);
        }
        Ok(())
    }

    /// Apply one receive result. `None` means the source dropped its callback.
    fn absorb(&mut self, received: Option<Sentinel<S::Item>>) {
        let Some(cycle) = self.cycle.as_ref() else {
            return;
        };
        if cycle.flags.cancelled.get() {
            self.buffer.mark_cancelled();
        }

        match received {
            Some(sentinel) => {
                let mapper = &self.mapper;
                self.buffer.accept_with(sentinel, |item| mapper(item));
            }
            None => {
                if self.buffer.state() == ResultState::InProgress {
                    log::warn!("query source dropped its callback without a terminal sentinel");
                    let _ = self.buffer.fail(QueryError::Disconnected);
                }
            }
        }

        if self.buffer.state() != ResultState::InProgress {
            self.cycle = None;
        }
    }

    /// Move queued deliveries into the buffer and apply a pending cancellation
    fn sync(&mut self) {
        while let Some(cycle) = self.cycle.as_mut() {
            match cycle.receiver.try_recv() {
                Ok(sentinel) => self.absorb(Some(sentinel)),
                Err(TryRecvError::Closed) => self.absorb(None),
                Err(TryRecvError::Empty) => {
                    if cycle.flags.cancelled.get() {
                        self.buffer.mark_cancelled();
                        self.cycle = None;
                    }
                    break;
                }
            }
        }
    }

    /// Suspend until the source delivers something, then absorb it
    async fn wait_for_delivery(&mut self) {
        let received = match self.cycle.as_mut() {
            Some(cycle) => cycle.receiver.next().await,
            None => return,
        };
        self.absorb(received);
        self.sync();
    }

    /// Whether a bounded run has delivered as many rows as the source was asked for
    fn hint_reached(&self, demand: Demand) -> bool {
        self.buffer.state() == ResultState::InProgress
            && demand
                .reconcile(self.options.limit)
                .is_met_by(self.buffer.len())
    }

    fn guard(&self) -> CancelGuard<S> {
        CancelGuard {
            source: Rc::clone(&self.source),
            flags: self.cycle.as_ref().map(|cycle| Rc::clone(&cycle.flags)),
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

impl<S: LocalQuerySource, T> Drop for CooperativeResultStream<S, T> {
    fn drop(&mut self) {
        if let Some(cycle) = self.cycle.take() {
            if self.buffer.state() == ResultState::InProgress {
                cancel_cycle(&*self.source, &cycle.flags);
            }
        }
    }
}
