//! Query result streams
//!
//! Adapts push-based, callback-driven, cancellable query sources into lazy,
//! pull-based result streams with `each` / `first` / `take` / `count` /
//! `stream` semantics. Two backends are provided:
//!
//! * [`CooperativeResultStream`] for a single-threaded cooperative scheduler
//!   (async methods, explicit suspension points);
//! * [`ThreadedResultStream`] for sources that deliver from their own thread
//!   while the consumer blocks.
//!
//! ```
//! use query_stream::{CooperativeResultStream, LocalIterSource};
//!
//! # futures::executor::block_on(async {
//! let mut results = CooperativeResultStream::new(LocalIterSource::new(vec![1, 2, 3]));
//! assert_eq!(results.take(2).await.unwrap(), vec![1, 2]);
//! assert_eq!(results.count().await.unwrap(), 3);
//! # });
//! ```

pub mod buffer;
pub mod config;
pub mod cooperative;
pub mod demand;
pub mod dispatch;
pub mod error;
pub mod sentinel;
pub mod source;
pub mod sources;
pub mod threaded;

pub use buffer::{BufferStats, ResultBuffer, ResultState};
pub use config::QueryOptions;
pub use cooperative::CooperativeResultStream;
pub use demand::Demand;
pub use dispatch::{RequestId, RequestMap};
pub use error::{QueryError, QueryResult, SourceError};
pub use sentinel::{Metadata, Sentinel, SentinelKind};
pub use source::{Callback, LocalCallback, LocalQuerySource, QuerySource};
pub use sources::{IterSource, LocalIterSource};
pub use threaded::{CancelHandle, RowIter, ThreadedResultStream};
