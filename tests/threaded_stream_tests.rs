use query_stream::{
    Callback, Demand, IterSource, Metadata, QueryError, QueryOptions, QueryResult, QuerySource,
    ResultState, Sentinel, SourceError, ThreadedResultStream,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Test source that ignores the demand hint and delivers a fixed script
/// from its own thread, one sentinel per `delay`.
#[derive(Clone)]
struct ScriptedSource {
    script: Arc<Vec<Sentinel<i32>>>,
    delay: Duration,
    overrun: bool,
    performs: Arc<AtomicUsize>,
    cancels: Arc<AtomicUsize>,
    demands: Arc<Mutex<Vec<Demand>>>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedSource {
    fn new(script: Vec<Sentinel<i32>>, delay: Duration) -> Self {
        Self {
            script: Arc::new(script),
            delay,
            overrun: false,
            performs: Arc::new(AtomicUsize::new(0)),
            cancels: Arc::new(AtomicUsize::new(0)),
            demands: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn rows(rows: &[i32], delay: Duration) -> Self {
        let mut script: Vec<_> = rows.iter().copied().map(Sentinel::Row).collect();
        script.push(Sentinel::Final(Metadata::with_total(rows.len() as u64)));
        Self::new(script, delay)
    }

    fn overrun(mut self) -> Self {
        self.overrun = true;
        self
    }

    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn performs(&self) -> usize {
        self.performs.load(Ordering::SeqCst)
    }
}

impl QuerySource for ScriptedSource {
    type Item = i32;

    fn perform(
        &self,
        demand: Demand,
        _options: &QueryOptions,
        mut callback: Callback<i32>,
    ) -> QueryResult<()> {
        self.performs.fetch_add(1, Ordering::SeqCst);
        self.demands.lock().unwrap().push(demand);
        self.cancelled.store(false, Ordering::SeqCst);

        let script = Arc::clone(&self.script);
        let cancelled = Arc::clone(&self.cancelled);
        let (delay, overrun) = (self.delay, self.overrun);
        thread::spawn(move || {
            for sentinel in script.iter().cloned() {
                thread::sleep(delay);
                if cancelled.load(Ordering::SeqCst) {
                    if overrun {
                        callback(sentinel);
                    }
                    break;
                }
                callback(sentinel);
            }
        });
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Delivers everything on the caller's thread before `perform` returns
struct InlineSource {
    rows: Vec<i32>,
    cancels: AtomicUsize,
}

impl InlineSource {
    fn new(rows: Vec<i32>) -> Self {
        Self {
            rows,
            cancels: AtomicUsize::new(0),
        }
    }
}

impl QuerySource for InlineSource {
    type Item = i32;

    fn perform(
        &self,
        _demand: Demand,
        _options: &QueryOptions,
        mut callback: Callback<i32>,
    ) -> QueryResult<()> {
        for row in &self.rows {
            callback(Sentinel::Row(*row));
        }
        callback(Sentinel::Final(Metadata::with_total(self.rows.len() as u64)));
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sends one row, then holds its callback until cancelled and a while after
#[derive(Clone, Default)]
struct StallingSource {
    cancelled: Arc<AtomicBool>,
    cancels: Arc<AtomicUsize>,
}

const STALL_AFTER_CANCEL: Duration = Duration::from_millis(500);

impl QuerySource for StallingSource {
    type Item = i32;

    fn perform(
        &self,
        _demand: Demand,
        _options: &QueryOptions,
        mut callback: Callback<i32>,
    ) -> QueryResult<()> {
        let cancelled = Arc::clone(&self.cancelled);
        thread::spawn(move || {
            callback(Sentinel::Row(1));
            while !cancelled.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            thread::sleep(STALL_AFTER_CANCEL);
            drop(callback);
        });
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Delivers one row and then drops its callback without finishing
struct VanishingSource;

impl QuerySource for VanishingSource {
    type Item = i32;

    fn perform(
        &self,
        _demand: Demand,
        _options: &QueryOptions,
        mut callback: Callback<i32>,
    ) -> QueryResult<()> {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            callback(Sentinel::Row(1));
        });
        Ok(())
    }

    fn cancel(&self) {}
}

const TICK: Duration = Duration::from_millis(5);

#[test]
fn test_each_visits_all_rows_in_order() {
    let source = IterSource::new(vec![1, 2, 3, 4]).with_delay(Duration::from_millis(1));
    let mut results = ThreadedResultStream::new(source.clone());

    let mut seen = Vec::new();
    results.each(|row| seen.push(*row)).unwrap();

    assert_eq!(seen, vec![1, 2, 3, 4]);
    assert_eq!(results.state(), ResultState::Complete);
    assert!(results.complete_result_set());
    assert_eq!(results.metadata(), Some(&Metadata::with_total(4)));
    assert_eq!(source.cancels(), 0);
    assert_eq!(source.last_demand(), Some(Demand::Unbounded));
}

#[test]
fn test_take_stops_early_and_cancels_once() {
    let source = ScriptedSource::rows(&[10, 20, 30, 40], TICK);
    let mut results = ThreadedResultStream::new(source.clone());

    assert_eq!(results.take(2).unwrap(), vec![10, 20]);
    assert_eq!(source.cancels(), 1);
    assert_eq!(*source.demands.lock().unwrap(), vec![Demand::Limit(2)]);
    assert_eq!(results.state(), ResultState::Cancelled);
    assert!(!results.complete_result_set());

    let fresh = ScriptedSource::rows(&[10, 20, 30, 40], TICK);
    let mut all = ThreadedResultStream::new(fresh.clone());
    let mut seen = Vec::new();
    all.each(|row| seen.push(*row)).unwrap();
    assert_eq!(seen, vec![10, 20, 30, 40]);
    assert_eq!(fresh.cancels(), 0);
}

#[test]
fn test_take_without_cancel_when_source_ends_at_demand() {
    let source = Arc::new(InlineSource::new(vec![1, 2]));
    let mut results = ThreadedResultStream::new(Arc::clone(&source));

    assert_eq!(results.take(2).unwrap(), vec![1, 2]);
    assert_eq!(source.cancels.load(Ordering::SeqCst), 0);
    assert_eq!(results.state(), ResultState::Complete);
}

#[test]
fn test_take_never_cancels_a_source_ending_at_demand() {
    for _ in 0..500 {
        let source = IterSource::new(vec![1, 2, 3]);
        let mut results = ThreadedResultStream::new(source.clone());

        assert_eq!(results.take(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(source.cancels(), 0);
        assert_eq!(results.state(), ResultState::Complete);
        assert!(!results.complete_result_set());
    }
}

#[test]
fn test_take_cancels_a_source_ignoring_the_hint() {
    let source = ScriptedSource::rows(&[1, 2, 3, 4], TICK);
    let mut results = ThreadedResultStream::new(source.clone());

    assert_eq!(results.take(2).unwrap(), vec![1, 2]);
    assert_eq!(source.cancels(), 1);
    assert_eq!(results.buffered().count(), 3);
}

#[test]
fn test_complete_result_is_replayed_without_performing() {
    let source = IterSource::new(vec![1, 2, 3]);
    let mut results = ThreadedResultStream::new(source.clone());

    let mut first_pass = Vec::new();
    results.each(|row| first_pass.push(*row)).unwrap();
    let mut second_pass = Vec::new();
    results.each(|row| second_pass.push(*row)).unwrap();

    assert_eq!(first_pass, second_pass);
    assert_eq!(results.first().unwrap(), Some(1));
    assert_eq!(results.take(5).unwrap(), vec![1, 2, 3]);
    assert_eq!(source.performs(), 1);
}

#[test]
fn test_error_is_raised_after_preceding_rows() {
    let error = SourceError::with_code(5, "timeout");
    let source = IterSource::new(vec![1, 2, 3, 4]).fail_after(2, error.clone());
    let mut results = ThreadedResultStream::new(source);

    let mut log = Vec::new();
    let outcome = results.each(|row| log.push(*row));

    assert!(matches!(outcome, Err(QueryError::Producer(ref e)) if *e == error));
    assert_eq!(log, vec![1, 2]);
    assert!(results.query_completed());
    assert!(!results.complete_result_set());
}

#[test]
fn test_cancel_handle_unblocks_parked_consumer() {
    let source = StallingSource::default();
    let mut results = ThreadedResultStream::new(source.clone());
    let handle = results.cancel_handle();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.cancel();
        handle.cancel();
    });

    let started = Instant::now();
    let mut seen = Vec::new();
    results.each(|row| seen.push(*row)).unwrap();
    canceller.join().unwrap();

    assert!(started.elapsed() < STALL_AFTER_CANCEL);
    assert_eq!(seen, vec![1]);
    assert_eq!(results.state(), ResultState::Cancelled);
    assert_eq!(source.cancels.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_handle_is_a_no_op_when_idle() {
    let source = IterSource::new(vec![1, 2]);
    let mut results = ThreadedResultStream::new(source.clone());
    let handle = results.cancel_handle();

    handle.cancel();
    results.each(|_| {}).unwrap();
    handle.clone().cancel();

    assert_eq!(source.cancels(), 0);
    assert!(results.complete_result_set());
}

#[test]
fn test_late_delivery_after_cancel_is_discarded() {
    let source = ScriptedSource::rows(&[1, 2, 3], TICK).overrun();
    let mut results = ThreadedResultStream::new(source.clone());

    assert_eq!(results.take(1).unwrap(), vec![1]);
    thread::sleep(TICK * 4);

    assert_eq!(results.state(), ResultState::Cancelled);
    assert_eq!(results.buffered().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(results.take(3).unwrap(), vec![1, 2]);
    assert_eq!(source.cancels(), 1);
}

#[test]
fn test_consumer_abort_propagates_and_cancels() {
    let source = ScriptedSource::rows(&[10, 20, 30, 40], TICK);
    let mut results = ThreadedResultStream::new(source.clone());

    let outcome: Result<_, QueryError> = results
        .try_each(|row| {
            if *row == 20 {
                Err(QueryError::invalid_state("visitor gave up"))
            } else {
                Ok(())
            }
        })
        .map(|_| ());

    assert!(matches!(outcome, Err(QueryError::InvalidState(_))));
    assert_eq!(source.cancels(), 1);
    assert_eq!(results.state(), ResultState::Cancelled);
}

#[test]
fn test_count() {
    let source = ScriptedSource::rows(&[1, 2, 3, 4, 5], Duration::from_millis(1));
    let mut results = ThreadedResultStream::new(source.clone());
    assert_eq!(results.count().unwrap(), 5);
    assert_eq!(*source.demands.lock().unwrap(), vec![Demand::Limit(1)]);

    let mut cut = ThreadedResultStream::new(ScriptedSource::rows(&[1, 2, 3], TICK));
    cut.first().unwrap();
    assert_eq!(cut.count(), Err(QueryError::CountUnavailable));
}

#[test]
fn test_count_falls_back_to_complete_result_length() {
    let source = ScriptedSource::new(
        vec![Sentinel::Row(1), Sentinel::Row(2), Sentinel::Final(Metadata::default())],
        Duration::from_millis(1),
    );
    let mut results = ThreadedResultStream::new(source);

    results.each(|_| {}).unwrap();
    assert_eq!(results.count().unwrap(), 2);
}

#[test]
fn test_stream_drops_rows_and_is_not_restartable() {
    let source = IterSource::new(vec![1, 2, 3]).with_delay(Duration::from_millis(1));
    let mut results = ThreadedResultStream::new(source.clone());

    let mut seen = Vec::new();
    results.stream(|row| seen.push(row)).unwrap();
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(results.buffered().count(), 0);
    assert!(!results.complete_result_set());

    assert!(matches!(results.each(|_| {}), Err(QueryError::NotRestartable)));
    assert!(matches!(results.stream(|_| {}), Err(QueryError::InvalidState(_))));

    results.reset().unwrap();
    assert_eq!(results.take(2).unwrap(), vec![1, 2]);
    assert_eq!(source.performs(), 2);
}

#[test]
fn test_limit_option_caps_demand() {
    let source = IterSource::new((1..=10).collect::<Vec<i32>>());
    let mut results = ThreadedResultStream::with_options(source.clone(), QueryOptions::new().limit(4));

    let mut seen = Vec::new();
    results.each(|row| seen.push(*row)).unwrap();
    assert_eq!(seen, vec![1, 2, 3, 4]);
    assert_eq!(source.last_demand(), Some(Demand::Limit(4)));
    assert_eq!(results.count().unwrap(), 10);
}

#[test]
fn test_rows_iterator() {
    let results = ThreadedResultStream::new(IterSource::new(vec![3, 1, 2]));
    let rows = results.into_iter().collect::<QueryResult<Vec<_>>>().unwrap();
    assert_eq!(rows, vec![3, 1, 2]);

    let failing = IterSource::new(vec![1, 2]).fail_after(1, SourceError::new("boom"));
    let rows: Vec<_> = ThreadedResultStream::new(failing).into_iter().collect();
    assert_eq!(
        rows,
        vec![Ok(1), Err(QueryError::Producer(SourceError::new("boom")))]
    );
}

#[test]
fn test_dropping_iterator_early_cancels_source() {
    let source = ScriptedSource::rows(&[1, 2, 3, 4], TICK);
    let results = ThreadedResultStream::new(source.clone());

    let rows: Vec<_> = results.into_iter().take(2).collect();
    assert_eq!(rows, vec![Ok(1), Ok(2)]);
    assert_eq!(source.cancels(), 1);
}

#[test]
fn test_source_without_terminal_is_reported() {
    let mut results = ThreadedResultStream::new(VanishingSource);

    let mut seen = Vec::new();
    let outcome = results.each(|row| seen.push(*row));
    assert!(matches!(outcome, Err(QueryError::Disconnected)));
    assert_eq!(seen, vec![1]);
}

#[test]
fn test_stream_can_move_to_another_thread() {
    let mut results = ThreadedResultStream::with_mapper(
        IterSource::new(vec![1, 2, 3]).with_delay(Duration::from_millis(1)),
        QueryOptions::new(),
        |raw: i32| raw * 10,
    );

    let worker = thread::spawn(move || {
        let rows = results.take(2).unwrap();
        (rows, results)
    });
    let (rows, mut results) = worker.join().unwrap();

    assert_eq!(rows, vec![10, 20]);
    results.reset().unwrap();
    assert_eq!(results.first().unwrap(), Some(10));
}
