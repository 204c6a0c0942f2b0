//! Batch dispatch control loop
//!
//! The only unbounded loop in the system. Each iteration polls discovery,
//! submits any new work in batch-size chunks, sweeps completed submissions
//! out of the outstanding set, and decides termination: the idle timer has
//! expired AND nothing is outstanding. New work always resets the timer
//! before the termination check, so a final wave of files arriving on the
//! expiry boundary is never lost.
//!
//! The loop runs single-threaded and owns the timer, the discovery state,
//! and the outstanding set outright; completions arrive only through each
//! submission's thread-safe handle.

use crate::backend::PendingSubmission;
use crate::discovery::FileSource;
use crate::timer::IdleTimer;
use std::path::PathBuf;
use std::time::Duration;
use styleflow_common::{Result, StyleFlowError, METRICS};
use tracing::{debug, info, warn};

/// Knobs for one dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum files per submitted batch.
    pub batch_size: usize,

    /// Idle duration without new files before termination is allowed.
    pub patience: Duration,

    /// Sleep between loop iterations.
    pub sleep_period: Duration,
}

/// What a finished dispatch run submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches_submitted: usize,
    pub files_submitted: usize,
}

/// Split one discovery round into ordered batches of at most `size` files.
///
/// The last batch may be smaller; concatenating the result reproduces the
/// input order exactly.
pub fn chunk(items: Vec<PathBuf>, size: usize) -> Vec<Vec<PathBuf>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size.max(1)));
    let mut rest = items;
    while rest.len() > size {
        let tail = rest.split_off(size);
        batches.push(rest);
        rest = tail;
    }
    if !rest.is_empty() {
        batches.push(rest);
    }
    batches
}

/// Drive discovery, submission, and completion sweeping to termination.
///
/// `process` turns one batch into a [`PendingSubmission`]; it is bound to
/// the execution backend and the broadcast model by the caller. Discovery
/// and submission errors propagate out; per-batch processing failures do
/// not — they surface only through the submission's failed state and are
/// logged and counted here.
pub async fn dispatch_batches<F>(
    source: &mut FileSource,
    mut process: F,
    options: &DispatchOptions,
) -> Result<DispatchSummary>
where
    F: FnMut(Vec<PathBuf>) -> Result<PendingSubmission>,
{
    if options.batch_size == 0 {
        return Err(StyleFlowError::config("batch_size must be at least 1"));
    }

    let mut timer = IdleTimer::new(options.patience);
    let mut outstanding: Vec<PendingSubmission> = Vec::new();
    let mut summary = DispatchSummary {
        batches_submitted: 0,
        files_submitted: 0,
    };

    loop {
        let new_files = source.new_files()?;
        if !new_files.is_empty() {
            // New work always wins over an expired timer.
            timer.reset();
            summary.files_submitted += new_files.len();

            for batch in chunk(new_files, options.batch_size) {
                debug!("Submitting batch of {} files", batch.len());
                let submission = process(batch)?;
                outstanding.push(submission);
                summary.batches_submitted += 1;
                METRICS.pipeline.batches_submitted_total.inc();
            }
        }

        outstanding.retain(|submission| {
            if !submission.is_done() {
                return true;
            }
            if submission.is_failed() {
                warn!("Batch {} completed with an error", submission.id());
                METRICS.pipeline.batches_failed_total.inc();
            } else {
                METRICS.pipeline.batches_completed_total.inc();
            }
            false
        });
        METRICS
            .pipeline
            .outstanding_batches
            .set(outstanding.len() as i64);
        debug!("Batches remaining {}", outstanding.len());

        if timer.is_expired() && outstanding.is_empty() {
            info!("Finished processing images");
            break;
        }

        tokio::time::sleep(options.sleep_period).await;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SubmissionState;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn options(patience_ms: u64) -> DispatchOptions {
        DispatchOptions {
            batch_size: 4,
            patience: Duration::from_millis(patience_ms),
            sleep_period: Duration::from_millis(100),
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    /// Process function that records batches and completes each submission
    /// after a fixed virtual delay.
    fn delayed_process(
        delay: Duration,
        batches: Arc<Mutex<Vec<Vec<PathBuf>>>>,
    ) -> impl FnMut(Vec<PathBuf>) -> Result<PendingSubmission> {
        let mut counter = 0usize;
        move |batch: Vec<PathBuf>| {
            batches.lock().unwrap().push(batch);
            counter += 1;
            let (submission, state) =
                PendingSubmission::test_handle(&format!("sub-{}", counter));
            tokio::spawn(complete_after(state, delay, false));
            Ok(submission)
        }
    }

    async fn complete_after(state: Arc<SubmissionState>, delay: Duration, failed: bool) {
        tokio::time::sleep(delay).await;
        state.complete(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_files_terminates_after_patience() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileSource::new(dir.path(), "*.jpg").unwrap();

        let start = Instant::now();
        let summary = dispatch_batches(
            &mut source,
            |_| panic!("nothing should be submitted"),
            &DispatchOptions {
                batch_size: 4,
                patience: Duration::from_secs(1),
                sleep_period: Duration::from_millis(100),
            },
        )
        .await
        .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(summary.batches_submitted, 0);
        assert_eq!(summary.files_submitted, 0);
        assert!(elapsed >= Duration::from_secs(1), "ended early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1300), "ended late: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_files_make_three_ordered_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut expected: Vec<PathBuf> = (0..10)
            .map(|i| touch(dir.path(), &format!("img_{:02}.jpg", i)))
            .collect();
        expected.sort();

        let mut source = FileSource::new(dir.path(), "*.jpg").unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));

        let summary = dispatch_batches(
            &mut source,
            delayed_process(Duration::from_millis(500), batches.clone()),
            &options(1000),
        )
        .await
        .unwrap();

        assert_eq!(summary.batches_submitted, 3);
        assert_eq!(summary.files_submitted, 10);

        let batches = batches.lock().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let concatenated: Vec<PathBuf> = batches.iter().flatten().cloned().collect();
        assert_eq!(concatenated, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_terminates_with_outstanding_work() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "slow.jpg");
        let mut source = FileSource::new(dir.path(), "*.jpg").unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));

        // Patience far shorter than the batch's completion time: the loop
        // must keep running until the submission reports done.
        let start = Instant::now();
        let summary = dispatch_batches(
            &mut source,
            delayed_process(Duration::from_secs(3), batches.clone()),
            &options(50),
        )
        .await
        .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(summary.batches_submitted, 1);
        assert!(elapsed >= Duration::from_secs(3), "terminated with work outstanding");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_files_reset_the_idle_timer() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "early.jpg");
        let late_dir = dir.path().to_path_buf();

        // A second wave lands at t=600ms, inside the 1s patience window.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            touch(&late_dir, "late.jpg");
        });

        let mut source = FileSource::new(dir.path(), "*.jpg").unwrap();
        let batches = Arc::new(Mutex::new(Vec::new()));

        let start = Instant::now();
        let summary = dispatch_batches(
            &mut source,
            delayed_process(Duration::from_millis(100), batches.clone()),
            &options(1000),
        )
        .await
        .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(summary.files_submitted, 2);
        assert_eq!(summary.batches_submitted, 2);
        // Termination only after the second wave's own patience window.
        assert!(elapsed >= Duration::from_millis(1600), "timer was not reset: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submission_is_swept_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "bad.jpg");
        let mut source = FileSource::new(dir.path(), "*.jpg").unwrap();

        let summary = dispatch_batches(
            &mut source,
            |_| {
                let (submission, state) = PendingSubmission::test_handle("doomed");
                tokio::spawn(complete_after(state, Duration::from_millis(200), true));
                Ok(submission)
            },
            &options(500),
        )
        .await
        .unwrap();

        assert_eq!(summary.batches_submitted, 1);
    }

    #[tokio::test]
    async fn test_zero_batch_size_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileSource::new(dir.path(), "*.jpg").unwrap();

        let result = dispatch_batches(
            &mut source,
            |_| panic!("must not submit"),
            &DispatchOptions {
                batch_size: 0,
                patience: Duration::ZERO,
                sleep_period: Duration::from_millis(10),
            },
        )
        .await;

        assert!(matches!(result, Err(StyleFlowError::Config(_))));
    }

    #[test]
    fn test_chunk_sizes_and_order() {
        let items: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("f{}", i))).collect();

        let batches = chunk(items.clone(), 4);
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(|b| b.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        let concatenated: Vec<PathBuf> = batches.into_iter().flatten().collect();
        assert_eq!(concatenated, items);

        assert_eq!(chunk(Vec::new(), 4).len(), 0);
        assert_eq!(chunk(items.clone(), 100).len(), 1);
        assert_eq!(chunk(items, 1).len(), 10);
    }
}
