//! Generic stage worker loop
//!
//! Every stage process runs the same loop: claim one item, process it,
//! then either keep polling (short sleep after a hit, long sleep after a
//! miss) or stop, depending on the run options. The loop races processing
//! against a cancellation token so Ctrl-C rolls the in-flight item back
//! instead of leaving it stuck in its in-progress state.
//!
//! Targeted runs (`--id`) bypass the claim path entirely: each named item
//! is fetched directly and processed once, claimed or not. That path is
//! only safe when a single operator invokes it.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use aircheck_common::Result;

/// What processing one item did to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Item reached a success state (`Processed` or `Ready for review`).
    Processed,
    /// Item was marked `Error`; the failure is recorded on the row.
    Errored,
}

/// One pipeline stage, pluggable into [`run_worker`].
///
/// `process` must leave the item in a terminal state and return the
/// outcome; it returns `Err` only when the store itself fails, which
/// stops the loop. `recover` is the abnormal-termination hook: it rolls
/// the item back to its pre-claim state, but only if the row still shows
/// the in-progress state this worker put it in, so a result written by
/// someone else is never clobbered.
#[async_trait]
pub trait StageWorker: Send + Sync {
    type Item: Send + Sync;

    fn name(&self) -> &'static str;

    fn item_id(&self, item: &Self::Item) -> Uuid;

    async fn claim_next(&self) -> Result<Option<Self::Item>>;

    async fn fetch_targeted(&self, id: Uuid) -> Result<Option<Self::Item>>;

    async fn process(&self, item: &Self::Item) -> Result<ItemOutcome>;

    async fn recover(&self, item: &Self::Item) -> Result<()>;
}

/// How a worker invocation was asked to run.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Targeted mode: process exactly these items, skipping the claim.
    pub ids: Vec<Uuid>,
    /// Stop after this many processed-or-errored items.
    pub limit: Option<u64>,
    /// Poll until cancelled instead of stopping at the first empty claim.
    pub repeat: bool,
}

/// Poll sleeps between claim attempts.
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    /// After a successful claim; more work is probably queued.
    pub busy: Duration,
    /// After an empty claim.
    pub idle: Duration,
}

/// Counters reported when a worker run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    pub errored: u64,
    pub missing: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Processed => self.processed += 1,
            ItemOutcome::Errored => self.errored += 1,
        }
    }

    fn total(&self) -> u64 {
        self.processed + self.errored
    }
}

/// Drive one stage worker according to `options` until it runs out of
/// work, hits its limit, or is cancelled.
pub async fn run_worker<W: StageWorker>(
    worker: &W,
    options: &WorkerOptions,
    intervals: PollIntervals,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    if !options.ids.is_empty() {
        return run_targeted(worker, &options.ids, cancel).await;
    }

    let mut summary = RunSummary::default();
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let claimed = worker.claim_next().await?;
        let sleep_for = match claimed {
            Some(item) => {
                match process_one(worker, &item, cancel).await? {
                    Some(outcome) => summary.record(outcome),
                    None => break, // cancelled mid-item, already recovered
                }
                if options.limit.is_some_and(|limit| summary.total() >= limit) {
                    break;
                }
                intervals.busy
            }
            None => {
                if !options.repeat {
                    break;
                }
                info!(worker = worker.name(), "No claimable work, sleeping");
                intervals.idle
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    info!(
        worker = worker.name(),
        processed = summary.processed,
        errored = summary.errored,
        "Worker run finished"
    );
    Ok(summary)
}

async fn run_targeted<W: StageWorker>(
    worker: &W,
    ids: &[Uuid],
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    for &id in ids {
        if cancel.is_cancelled() {
            break;
        }
        match worker.fetch_targeted(id).await? {
            Some(item) => match process_one(worker, &item, cancel).await? {
                Some(outcome) => summary.record(outcome),
                None => break,
            },
            None => {
                warn!(worker = worker.name(), item = %id, "Requested item not found");
                summary.missing += 1;
            }
        }
    }

    info!(
        worker = worker.name(),
        processed = summary.processed,
        errored = summary.errored,
        missing = summary.missing,
        "Targeted run finished"
    );
    Ok(summary)
}

/// Process one item, racing against cancellation. Returns `None` when the
/// run was cancelled; the item has been handed to `recover` in that case.
async fn process_one<W: StageWorker>(
    worker: &W,
    item: &W::Item,
    cancel: &CancellationToken,
) -> Result<Option<ItemOutcome>> {
    let id = worker.item_id(item);
    tokio::select! {
        _ = cancel.cancelled() => {
            warn!(worker = worker.name(), item = %id, "Cancelled mid-item, rolling back claim");
            worker.recover(item).await?;
            Ok(None)
        }
        result = worker.process(item) => match result {
            Ok(outcome) => {
                info!(worker = worker.name(), item = %id, outcome = ?outcome, "Item finished");
                Ok(Some(outcome))
            }
            Err(err) => {
                // Store failure: roll back if possible, then stop the loop.
                error!(worker = worker.name(), item = %id, error = %err, "Store failure while processing");
                if let Err(recover_err) = worker.recover(item).await {
                    error!(
                        worker = worker.name(),
                        item = %id,
                        error = %recover_err,
                        "Rollback after store failure also failed"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircheck_common::Error;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeWorker {
        queue: Mutex<Vec<Uuid>>,
        fail_ids: Vec<Uuid>,
        recovered: AtomicU64,
        store_broken: bool,
    }

    impl FakeWorker {
        fn with_items(count: usize) -> Self {
            Self {
                queue: Mutex::new((0..count).map(|_| Uuid::new_v4()).collect()),
                fail_ids: Vec::new(),
                recovered: AtomicU64::new(0),
                store_broken: false,
            }
        }
    }

    #[async_trait]
    impl StageWorker for FakeWorker {
        type Item = Uuid;

        fn name(&self) -> &'static str {
            "fake"
        }

        fn item_id(&self, item: &Uuid) -> Uuid {
            *item
        }

        async fn claim_next(&self) -> Result<Option<Uuid>> {
            Ok(self.queue.lock().unwrap().pop())
        }

        async fn fetch_targeted(&self, id: Uuid) -> Result<Option<Uuid>> {
            let queue = self.queue.lock().unwrap();
            Ok(queue.contains(&id).then_some(id))
        }

        async fn process(&self, item: &Uuid) -> Result<ItemOutcome> {
            if self.store_broken {
                return Err(Error::Internal("store gone".into()));
            }
            if self.fail_ids.contains(item) {
                Ok(ItemOutcome::Errored)
            } else {
                Ok(ItemOutcome::Processed)
            }
        }

        async fn recover(&self, _item: &Uuid) -> Result<()> {
            self.recovered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_intervals() -> PollIntervals {
        PollIntervals {
            busy: Duration::from_millis(1),
            idle: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn drains_queue_then_stops_without_repeat() {
        let worker = FakeWorker::with_items(3);
        let summary = run_worker(
            &worker,
            &WorkerOptions::default(),
            fast_intervals(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.errored, 0);
    }

    #[tokio::test]
    async fn limit_stops_early() {
        let worker = FakeWorker::with_items(5);
        let options = WorkerOptions {
            limit: Some(2),
            ..Default::default()
        };
        let summary = run_worker(&worker, &options, fast_intervals(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(worker.queue.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn errored_items_are_counted_not_fatal() {
        let mut worker = FakeWorker::with_items(3);
        worker.fail_ids = worker.queue.lock().unwrap().clone();
        let summary = run_worker(
            &worker,
            &WorkerOptions::default(),
            fast_intervals(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.errored, 3);
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn store_failure_recovers_and_propagates() {
        let mut worker = FakeWorker::with_items(2);
        worker.store_broken = true;
        let result = run_worker(
            &worker,
            &WorkerOptions::default(),
            fast_intervals(),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(worker.recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn targeted_mode_reports_missing_items() {
        let worker = FakeWorker::with_items(1);
        let known = worker.queue.lock().unwrap()[0];
        let options = WorkerOptions {
            ids: vec![known, Uuid::new_v4()],
            ..Default::default()
        };
        let summary = run_worker(&worker, &options, fast_intervals(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.missing, 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_claiming() {
        let worker = FakeWorker::with_items(3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = WorkerOptions {
            repeat: true,
            ..Default::default()
        };
        let summary = run_worker(&worker, &options, fast_intervals(), &cancel)
            .await
            .unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(worker.queue.lock().unwrap().len(), 3);
    }
}
