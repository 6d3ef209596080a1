//! Resumable batch runner shared by every job.
//!
//! One batch is: load the checkpoint, read the next `batch_size` records from the source,
//! prepare each of them outside of any transaction (transformation, HTTP calls), then open one
//! transaction, write every prepared record inside its own savepoint, save the advanced
//! checkpoint and commit. The cursor moves by the number of records consumed, so invalid,
//! duplicate and failed records are never revisited. If begin, the checkpoint save or the
//! commit fails, the whole batch is gone and the checkpoint stays where it was.
//!
//! A transient failure while preparing (quota, timeout, lost connection) ends the batch at that
//! record instead: what was prepared before it is committed and the cursor points at it, so the
//! next run picks it up again.

use crate::{
    error::Result,
    signals::Signal,
    store::Store,
};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A page of records and the position to continue from
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub records: Vec<T>,
    /// Position after each record, same length as `records`
    pub positions: Vec<i64>,
    pub next_position: i64,
    pub exhausted: bool,
}

#[allow(async_fn_in_trait)]
pub trait Source {
    type Record;

    /// Up to `limit` records starting after `position`
    async fn next_batch(&mut self, position: i64, limit: usize) -> Result<Batch<Self::Record>>;
}

/// In-memory records addressed by offset, used for files read up front
#[derive(Debug, Clone, Default)]
pub struct OffsetSource<T> {
    records: Vec<T>,
}

impl<T> OffsetSource<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self { records }
    }
}

impl<T: Clone> Source for OffsetSource<T> {
    type Record = T;

    async fn next_batch(&mut self, position: i64, limit: usize) -> Result<Batch<T>> {
        let len = self.records.len();
        let start = (position.max(0) as usize).min(len);
        let end = start.saturating_add(limit).min(len);
        Ok(Batch {
            records: self.records[start..end].to_vec(),
            positions: (start + 1..=end).map(|p| p as i64).collect(),
            next_position: end as i64,
            exhausted: end >= len,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prepared<T> {
    Ready(T),
    /// Record can never be written, with the reason
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    Duplicate,
    /// Nothing worth writing, but the record was handled
    Skipped,
}

#[allow(async_fn_in_trait)]
pub trait Job<S: Store> {
    type Record;
    type Ready;

    /// Checkpoint key
    fn name(&self) -> &str;

    /// Runs before the transaction is opened, so it may be slow
    async fn prepare(&self, record: Self::Record) -> Result<Prepared<Self::Ready>>;

    async fn write(&self, store: &S, tx: &mut S::Tx, ready: &Self::Ready) -> Result<Outcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub job: String,
    pub run_id: Uuid,
    pub position_before: i64,
    pub position_after: i64,
    pub processed: usize,
    pub written: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub errors: usize,
    /// Records left for the next run after a transient failure
    pub deferred: usize,
    pub exhausted: bool,
}

/// Run exactly one batch
pub async fn run_batch<S, Src, J>(
    store: &S,
    source: &mut Src,
    job: &J,
    batch_size: usize,
) -> Result<BatchReport>
where
    S: Store,
    Src: Source<Record = J::Record>,
    J: Job<S>,
{
    let mut cp = store.load_checkpoint(job.name()).await?;
    let mut report = BatchReport {
        job: job.name().to_string(),
        run_id: Uuid::new_v4(),
        position_before: cp.position,
        position_after: cp.position,
        ..Default::default()
    };
    debug!(job = job.name(), position = cp.position, batch_size, "Reading batch...");

    let batch = source.next_batch(cp.position, batch_size.max(1)).await?;
    let total = batch.records.len();
    report.processed = total;
    report.exhausted = batch.exhausted;
    if batch.records.is_empty() {
        info!(job = job.name(), position = cp.position, "Nothing left to process");
        return Ok(report);
    }

    let mut next_position = batch.next_position;
    let mut ready = Vec::with_capacity(total);
    for (i, rec) in batch.records.into_iter().enumerate() {
        match job.prepare(rec).await {
            Ok(Prepared::Ready(r)) => ready.push((i, r)),
            Ok(Prepared::Invalid(reason)) => {
                debug!(job = job.name(), index = i, %reason, "Skipping invalid record");
                report.invalid += 1;
            }
            Err(err) if err.is_transient() => {
                warn!(job = job.name(), index = i, %err, "Transient failure, ending batch here");
                next_position = i
                    .checked_sub(1)
                    .and_then(|prev| batch.positions.get(prev).copied())
                    .unwrap_or(cp.position);
                report.processed = i;
                report.deferred = total - i;
                report.exhausted = false;
                break;
            }
            Err(err) => {
                warn!(job = job.name(), index = i, %err, "Failed to prepare record");
                report.errors += 1;
            }
        }
    }

    let mut tx = store.begin().await?;
    for (i, r) in &ready {
        store.begin_record(&mut tx).await?;
        match job.write(store, &mut tx, r).await {
            Ok(outcome) => {
                store.release_record(&mut tx).await?;
                match outcome {
                    Outcome::Written => report.written += 1,
                    Outcome::Duplicate => report.duplicates += 1,
                    Outcome::Skipped => report.skipped += 1,
                }
            }
            Err(err) => {
                warn!(job = job.name(), index = i, %err, "Failed to write record");
                store.rollback_record(&mut tx).await?;
                report.errors += 1;
            }
        }
    }

    cp.position = next_position;
    cp.total_processed += report.processed as i64;
    cp.total_written += report.written as i64;
    cp.last_run_id = Some(report.run_id);
    cp.updated_at = Some(Utc::now());
    store.save_checkpoint(&mut tx, &cp).await?;
    store.commit(tx).await?;
    report.position_after = cp.position;

    info!(
        job = %report.job,
        run_id = %report.run_id,
        position = report.position_after,
        processed = report.processed,
        written = report.written,
        duplicates = report.duplicates,
        skipped = report.skipped,
        invalid = report.invalid,
        errors = report.errors,
        deferred = report.deferred,
        exhausted = report.exhausted,
        "Batch committed"
    );
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct RunOpts {
    pub batch_size: usize,
    /// Keep going until the source is exhausted instead of stopping after one batch
    pub until_done: bool,
    pub pause: Duration,
    pub max_batches: Option<usize>,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            batch_size: 50,
            until_done: false,
            pause: Duration::from_secs(1),
            max_batches: None,
        }
    }
}

/// Totals over all batches of one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub job: String,
    pub batches: usize,
    pub position: i64,
    pub processed: usize,
    pub written: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub invalid: usize,
    pub errors: usize,
    pub deferred: usize,
    pub exhausted: bool,
    pub interrupted: bool,
}

impl RunSummary {
    fn add(&mut self, r: &BatchReport) {
        self.job.clone_from(&r.job);
        self.batches += 1;
        self.position = r.position_after;
        self.processed += r.processed;
        self.written += r.written;
        self.duplicates += r.duplicates;
        self.skipped += r.skipped;
        self.invalid += r.invalid;
        self.errors += r.errors;
        self.deferred = r.deferred;
        self.exhausted = r.exhausted;
    }
}

fn shutdown_requested(rx: &mut broadcast::Receiver<Signal>) -> bool {
    loop {
        match rx.try_recv() {
            Ok(Signal::Shutdown) => return true,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return false,
        }
    }
}

/// Sleep for `pause`, returning early with true if shutdown is requested meanwhile
async fn pause_or_shutdown(pause: Duration, rx: &mut broadcast::Receiver<Signal>) -> bool {
    let sleep = tokio::time::sleep(pause);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            s = rx.recv() => match s {
                Ok(Signal::Shutdown) => return true,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    (&mut sleep).await;
                    return false;
                }
            }
        }
    }
}

/// One batch, or with `until_done` batches until the source is exhausted, `max_batches` is hit,
/// a batch ends early on a transient failure or shutdown is requested. Shutdown is only
/// honoured between batches.
pub async fn run<S, Src, J>(
    store: &S,
    source: &mut Src,
    job: &J,
    opts: &RunOpts,
    shutdown: &mut broadcast::Receiver<Signal>,
) -> Result<RunSummary>
where
    S: Store,
    Src: Source<Record = J::Record>,
    J: Job<S>,
{
    let mut summary = RunSummary {
        job: job.name().to_string(),
        ..Default::default()
    };
    loop {
        if shutdown_requested(shutdown) {
            summary.interrupted = true;
            break;
        }
        let report = run_batch(store, source, job, opts.batch_size).await?;
        summary.add(&report);

        if !opts.until_done || report.exhausted {
            break;
        }
        if report.deferred > 0 {
            warn!(job = job.name(), position = report.position_after, "Stopping, retry later");
            break;
        }
        if opts.max_batches.is_some_and(|m| summary.batches >= m) {
            debug!(job = job.name(), batches = summary.batches, "Batch limit reached");
            break;
        }
        if pause_or_shutdown(opts.pause, shutdown).await {
            summary.interrupted = true;
            break;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemTx, MemoryStore};
    use std::sync::{Arc, Mutex, atomic::Ordering};

    /// Records every value it is asked to write, fails on negatives, calls zero invalid.
    /// Values in `flaky` fail to prepare with a quota error once.
    #[derive(Default)]
    struct Collect {
        seen: Arc<Mutex<Vec<i32>>>,
        flaky: Mutex<Vec<i32>>,
    }

    impl Job<MemoryStore> for Collect {
        type Record = i32;
        type Ready = i32;

        fn name(&self) -> &str {
            "collect"
        }

        async fn prepare(&self, record: i32) -> Result<Prepared<i32>> {
            if record == 0 {
                return Ok(Prepared::Invalid("zero".into()));
            }
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(i) = flaky.iter().position(|v| *v == record) {
                flaky.remove(i);
                return Err(crate::error::Error::Api {
                    status: "OVER_QUERY_LIMIT".into(),
                    message: String::new(),
                });
            }
            Ok(Prepared::Ready(record))
        }

        async fn write(&self, _: &MemoryStore, _: &mut MemTx, ready: &i32) -> Result<Outcome> {
            if *ready < 0 {
                return Err(crate::error::Error::InvalidSource("negative".into()));
            }
            self.seen.lock().unwrap().push(*ready);
            Ok(Outcome::Written)
        }
    }

    fn no_signals() -> (broadcast::Sender<Signal>, broadcast::Receiver<Signal>) {
        broadcast::channel(1)
    }

    #[tokio::test]
    async fn offset_source_pages() {
        let mut src = OffsetSource::new(vec![1, 2, 3, 4, 5]);
        let b = src.next_batch(0, 2).await.unwrap();
        assert_eq!(vec![1, 2], b.positions);
        assert_eq!((vec![1, 2], 2, false), (b.records, b.next_position, b.exhausted));
        let b = src.next_batch(4, 2).await.unwrap();
        assert_eq!((vec![5], 5, true), (b.records, b.next_position, b.exhausted));
        let b = src.next_batch(9, 2).await.unwrap();
        assert!(b.records.is_empty() && b.exhausted);
        assert_eq!(5, b.next_position);
    }

    #[tokio::test]
    async fn visits_every_record_once_in_order() {
        let store = MemoryStore::default();
        let job = Collect::default();
        let mut src = OffsetSource::new((1..=23).collect::<Vec<_>>());
        let (_tx, mut rx) = no_signals();
        let opts = RunOpts {
            batch_size: 5,
            until_done: true,
            pause: Duration::ZERO,
            max_batches: None,
        };

        let summary = run(&store, &mut src, &job, &opts, &mut rx).await.unwrap();
        assert_eq!((1..=23).collect::<Vec<_>>(), *job.seen.lock().unwrap());
        assert_eq!(5, summary.batches);
        assert_eq!(23, summary.written);
        assert!(summary.exhausted);

        let cp = store.load_checkpoint("collect").await.unwrap();
        assert_eq!(23, cp.position);
        assert_eq!(23, cp.total_processed);
        assert_eq!(23, cp.total_written);

        // a later run has nothing to do
        let summary = run(&store, &mut src, &job, &opts, &mut rx).await.unwrap();
        assert_eq!(0, summary.processed);
        assert_eq!(23, job.seen.lock().unwrap().len());
    }

    #[tokio::test]
    async fn failed_commit_keeps_checkpoint() {
        let store = MemoryStore::default();
        let job = Collect::default();
        let mut src = OffsetSource::new(vec![1, 2, 3, 4]);

        run_batch(&store, &mut src, &job, 2).await.unwrap();
        assert_eq!(2, store.load_checkpoint("collect").await.unwrap().position);

        store.fail_commit.store(true, Ordering::SeqCst);
        assert!(run_batch(&store, &mut src, &job, 2).await.is_err());
        assert_eq!(2, store.load_checkpoint("collect").await.unwrap().position);

        // the same records come back once the store recovers
        store.fail_commit.store(false, Ordering::SeqCst);
        let r = run_batch(&store, &mut src, &job, 2).await.unwrap();
        assert_eq!((2, 4), (r.position_before, r.position_after));
    }

    #[tokio::test]
    async fn bad_records_advance_the_cursor() {
        let store = MemoryStore::default();
        let job = Collect::default();
        let mut src = OffsetSource::new(vec![1, 0, -1, 2]);

        let r = run_batch(&store, &mut src, &job, 10).await.unwrap();
        assert_eq!(4, r.processed);
        assert_eq!(2, r.written);
        assert_eq!(1, r.invalid);
        assert_eq!(1, r.errors);
        assert_eq!(4, r.position_after);
        assert!(r.exhausted);
        assert_eq!(vec![1, 2], *job.seen.lock().unwrap());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_next_run() {
        let store = MemoryStore::default();
        let job = Collect {
            flaky: Mutex::new(vec![7]),
            ..Default::default()
        };
        let mut src = OffsetSource::new(vec![1, 2, 7, 3]);
        let (_tx, mut rx) = no_signals();
        let opts = RunOpts {
            batch_size: 10,
            until_done: true,
            pause: Duration::ZERO,
            max_batches: None,
        };

        let s = run(&store, &mut src, &job, &opts, &mut rx).await.unwrap();
        assert_eq!((1, 2, 2, 0), (s.batches, s.processed, s.deferred, s.errors));
        assert_eq!(2, s.position);
        assert!(!s.exhausted);
        assert_eq!(2, store.load_checkpoint("collect").await.unwrap().position);

        let s = run(&store, &mut src, &job, &opts, &mut rx).await.unwrap();
        assert_eq!((2, 0, 4), (s.processed, s.deferred, s.position));
        assert!(s.exhausted);
        assert_eq!(vec![1, 2, 7, 3], *job.seen.lock().unwrap());
    }

    #[tokio::test]
    async fn transient_failure_on_first_record_keeps_position() {
        let store = MemoryStore::default();
        let job = Collect {
            flaky: Mutex::new(vec![5]),
            ..Default::default()
        };
        let mut src = OffsetSource::new(vec![5, 6]);

        let r = run_batch(&store, &mut src, &job, 10).await.unwrap();
        assert_eq!((0, 2, 0), (r.processed, r.deferred, r.position_after));
        assert!(job.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_batch_by_default() {
        let store = MemoryStore::default();
        let job = Collect::default();
        let mut src = OffsetSource::new((1..=10).collect::<Vec<_>>());
        let (_tx, mut rx) = no_signals();
        let opts = RunOpts {
            batch_size: 3,
            ..Default::default()
        };
        let s = run(&store, &mut src, &job, &opts, &mut rx).await.unwrap();
        assert_eq!((1, 3, false), (s.batches, s.position, s.exhausted));

        let opts = RunOpts {
            batch_size: 3,
            until_done: true,
            pause: Duration::ZERO,
            max_batches: Some(2),
        };
        let s = run(&store, &mut src, &job, &opts, &mut rx).await.unwrap();
        assert_eq!((2, 9), (s.batches, s.position));
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let store = MemoryStore::default();
        let job = Collect::default();
        let mut src = OffsetSource::new((1..=10).collect::<Vec<_>>());
        let (tx, mut rx) = no_signals();
        tx.send(Signal::Shutdown).unwrap();
        let opts = RunOpts {
            batch_size: 3,
            until_done: true,
            pause: Duration::ZERO,
            max_batches: None,
        };
        let s = run(&store, &mut src, &job, &opts, &mut rx).await.unwrap();
        assert!(s.interrupted);
        assert_eq!(0, s.batches);
        assert_eq!(0, store.load_checkpoint("collect").await.unwrap().position);
    }
}
