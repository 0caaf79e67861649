//! In-memory query sources
//!
//! [`LocalIterSource`] and [`IterSource`] replay a fixed list of rows
//! through the source contracts. They honour the demand hint, `skip`, and
//! cancellation, report the list length as `total_rows`, and can be told to
//! fail after a given number of rows.

use crate::config::QueryOptions;
use crate::demand::Demand;
use crate::error::{QueryError, QueryResult, SourceError};
use crate::sentinel::{Metadata, Sentinel};
use crate::source::{Callback, LocalCallback, LocalQuerySource, QuerySource};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Deliveries of one perform: the selected rows, then exactly one terminal
fn script<I: Clone>(
    items: &[I],
    demand: Demand,
    options: &QueryOptions,
    failure: Option<&(usize, SourceError)>,
) -> Vec<Sentinel<I>> {
    let start = options.skip.unwrap_or(0).min(items.len());
    let rows = &items[start..];
    let rows = match demand.as_limit() {
        Some(limit) => &rows[..limit.min(rows.len())],
        None => rows,
    };

    let mut script = Vec::with_capacity(rows.len() + 1);
    for (delivered, row) in rows.iter().enumerate() {
        if let Some((after, error)) = failure {
            if *after == delivered {
                script.push(Sentinel::Error(error.clone()));
                return script;
            }
        }
        script.push(Sentinel::Row(row.clone()));
    }
    match failure {
        Some((after, error)) if *after <= rows.len() => script.push(Sentinel::Error(error.clone())),
        _ => script.push(Sentinel::Final(Metadata::with_total(items.len() as u64))),
    }
    script
}

fn outstanding() -> QueryError {
    QueryError::invalid_state("perform called while a previous query is still outstanding")
}

#[derive(Default)]
struct LocalSourceState {
    generation: Cell<u64>,
    running: Cell<bool>,
    performs: Cell<usize>,
    cancels: Cell<usize>,
    last_demand: Cell<Option<Demand>>,
}

/// Source for the cooperative backend.
///
/// Without a delay every delivery happens synchronously inside `perform`.
/// With a delay the rows are delivered from a `spawn_local` task, so the
/// stream must be driven inside a tokio `LocalSet`.
pub struct LocalIterSource<I> {
    items: Rc<Vec<I>>,
    delay: Option<Duration>,
    failure: Option<(usize, SourceError)>,
    state: Rc<LocalSourceState>,
}

impl<I> Clone for LocalIterSource<I> {
    fn clone(&self) -> Self {
        Self {
            items: Rc::clone(&self.items),
            delay: self.delay,
            failure: self.failure.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<I: Clone + 'static> LocalIterSource<I> {
    pub fn new(items: Vec<I>) -> Self {
        Self {
            items: Rc::new(items),
            delay: None,
            failure: None,
            state: Rc::new(LocalSourceState::default()),
        }
    }

    /// Wait this long before each row
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// End with `error` once `rows` rows have been delivered
    pub fn fail_after(mut self, rows: usize, error: SourceError) -> Self {
        self.failure = Some((rows, error));
        self
    }

    pub fn performs(&self) -> usize {
        self.state.performs.get()
    }

    pub fn cancels(&self) -> usize {
        self.state.cancels.get()
    }

    pub fn last_demand(&self) -> Option<Demand> {
        self.state.last_demand.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.get()
    }
}

impl<I: Clone + 'static> LocalQuerySource for LocalIterSource<I> {
    type Item = I;

    fn perform(
        &self,
        demand: Demand,
        options: &QueryOptions,
        mut callback: LocalCallback<I>,
    ) -> QueryResult<()> {
        let state = &self.state;
        if state.running.get() {
            return Err(outstanding());
        }
        state.performs.set(state.performs.get() + 1);
        state.last_demand.set(Some(demand));
        let deliveries = script(&self.items, demand, options, self.failure.as_ref());

        let Some(delay) = self.delay else {
            for sentinel in deliveries {
                callback(sentinel);
            }
            return Ok(());
        };

        state.running.set(true);
        let generation = state.generation.get();
        let state = Rc::clone(state);
        tokio::task::spawn_local(async move {
            for sentinel in deliveries {
                if !sentinel.is_terminal() {
                    sleep(delay).await;
                }
                if state.generation.get() != generation {
                    return;
                }
                if sentinel.is_terminal() {
                    state.running.set(false);
                }
                callback(sentinel);
            }
        });
        Ok(())
    }

    fn cancel(&self) {
        let state = &self.state;
        state.cancels.set(state.cancels.get() + 1);
        if state.running.replace(false) {
            state.generation.set(state.generation.get() + 1);
        }
    }
}

#[derive(Default)]
struct SourceState {
    generation: AtomicU64,
    running: AtomicBool,
    performs: AtomicUsize,
    cancels: AtomicUsize,
    last_demand: Mutex<Option<Demand>>,
}

/// Source for the threaded backend; every perform spawns a producer thread
pub struct IterSource<I> {
    items: Arc<Vec<I>>,
    delay: Option<Duration>,
    failure: Option<(usize, SourceError)>,
    state: Arc<SourceState>,
}

impl<I> Clone for IterSource<I> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            delay: self.delay,
            failure: self.failure.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<I> IterSource<I>
where
    I: Clone + Send + Sync + 'static,
{
    pub fn new(items: Vec<I>) -> Self {
        Self {
            items: Arc::new(items),
            delay: None,
            failure: None,
            state: Arc::new(SourceState::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_after(mut self, rows: usize, error: SourceError) -> Self {
        self.failure = Some((rows, error));
        self
    }

    pub fn performs(&self) -> usize {
        self.state.performs.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.state.cancels.load(Ordering::SeqCst)
    }

    pub fn last_demand(&self) -> Option<Demand> {
        *self
            .state
            .last_demand
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }
}

impl<I> QuerySource for IterSource<I>
where
    I: Clone + Send + Sync + 'static,
{
    type Item = I;

    fn perform(
        &self,
        demand: Demand,
        options: &QueryOptions,
        mut callback: Callback<I>,
    ) -> QueryResult<()> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Err(outstanding());
        }
        self.state.performs.fetch_add(1, Ordering::SeqCst);
        *self
            .state
            .last_demand
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(demand);

        let deliveries = script(&self.items, demand, options, self.failure.as_ref());
        let generation = self.state.generation.load(Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let delay = self.delay;
        std::thread::spawn(move || {
            for sentinel in deliveries {
                if let (Some(delay), false) = (delay, sentinel.is_terminal()) {
                    std::thread::sleep(delay);
                }
                if state.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if sentinel.is_terminal() {
                    state.running.store(false, Ordering::SeqCst);
                }
                callback(sentinel);
            }
        });
        Ok(())
    }

    fn cancel(&self) {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        if self.state.running.swap(false, Ordering::SeqCst) {
            self.state.generation.fetch_add(1, Ordering::SeqCst);
        }
    }
}
