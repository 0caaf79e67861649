//! Query source contracts
//!
//! A source executes one query per `perform` and pushes its results into a
//! callback: zero or more rows, then exactly one terminal sentinel. Building
//! the query and talking to the server are the source's business; streams
//! only see this boundary.

use crate::config::QueryOptions;
use crate::demand::Demand;
use crate::error::QueryResult;
use crate::sentinel::Sentinel;
use std::rc::Rc;
use std::sync::Arc;

/// Delivery callback for sources driven on the consumer's own thread
pub type LocalCallback<I> = Box<dyn FnMut(Sentinel<I>)>;

/// Delivery callback for sources that deliver from a thread they own
pub type Callback<I> = Box<dyn FnMut(Sentinel<I>) + Send>;

/// Source driven by a single-threaded cooperative scheduler.
///
/// The callback may be invoked synchronously from inside `perform` (a burst
/// of ready rows) or later from another task on the same thread.
pub trait LocalQuerySource {
    type Item;

    /// Start one execution. Calling this while a previous execution is still
    /// outstanding must fail with `QueryError::InvalidState`.
    fn perform(
        &self,
        demand: Demand,
        options: &QueryOptions,
        callback: LocalCallback<Self::Item>,
    ) -> QueryResult<()>;

    /// Best-effort request to stop delivering. A delivery already in flight
    /// may still reach the callback.
    fn cancel(&self);
}

/// Source whose callback runs on a producer thread.
pub trait QuerySource: Send + Sync {
    type Item: Send + 'static;

    fn perform(
        &self,
        demand: Demand,
        options: &QueryOptions,
        callback: Callback<Self::Item>,
    ) -> QueryResult<()>;

    /// Best-effort, callable from any thread.
    fn cancel(&self);
}

impl<S: LocalQuerySource + ?Sized> LocalQuerySource for Rc<S> {
    type Item = S::Item;

    fn perform(
        &self,
        demand: Demand,
        options: &QueryOptions,
        callback: LocalCallback<Self::Item>,
    ) -> QueryResult<()> {
        (**self).perform(demand, options, callback)
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}

impl<S: QuerySource + ?Sized> QuerySource for Arc<S> {
    type Item = S::Item;

    fn perform(
        &self,
        demand: Demand,
        options: &QueryOptions,
        callback: Callback<Self::Item>,
    ) -> QueryResult<()> {
        (**self).perform(demand, options, callback)
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}
