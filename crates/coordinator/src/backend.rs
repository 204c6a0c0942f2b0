//! Execution backend
//!
//! The scheduler service workers register with, and the client operations
//! the pipeline drives it through: broadcast a model to every worker,
//! submit batches with least-loaded placement, poll submission completion,
//! retire the fleet, shut the service down.
//!
//! Handles returned from here are shared between the dispatch loop and the
//! background network tasks, so all shared state lives behind an `Arc` with
//! a short-held lock or an atomic. The dispatch loop itself never blocks on
//! the network: `submit_batch` only enqueues, `is_done` reads an atomic.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use styleflow_common::{Result, StyleFlowError, METRICS};
use styleflow_proto::{read_frame, write_frame, ModelArtifact, SchedulerMessage, WorkerMessage};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded wait for the background accept task during shutdown.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded wait for retirement acknowledgments.
const RETIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval for acknowledgment waits (broadcast, retire, fleet).
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(20);

const STATE_PENDING: u8 = 0;
const STATE_DONE: u8 = 1;
const STATE_FAILED: u8 = 2;

/// Completion cell for one submitted batch.
///
/// Written once by the scheduler's network task, read by the dispatch loop.
pub(crate) struct SubmissionState {
    status: AtomicU8,
}

impl SubmissionState {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(STATE_PENDING),
        }
    }

    /// Transition out of pending. First writer wins, so a late disconnect
    /// cannot overwrite a completion that already arrived.
    pub(crate) fn complete(&self, failed: bool) {
        let next = if failed { STATE_FAILED } else { STATE_DONE };
        let _ = self.status.compare_exchange(
            STATE_PENDING,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Handle to one in-flight batch submission.
pub struct PendingSubmission {
    id: String,
    state: Arc<SubmissionState>,
}

impl PendingSubmission {
    /// Submission id, unique per pipeline run.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking completion check; true for both success and failure.
    pub fn is_done(&self) -> bool {
        self.state.status.load(Ordering::Acquire) != STATE_PENDING
    }

    /// True iff the batch completed with an error.
    pub fn is_failed(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == STATE_FAILED
    }

    #[cfg(test)]
    pub(crate) fn test_handle(id: &str) -> (Self, Arc<SubmissionState>) {
        let state = Arc::new(SubmissionState::new());
        (
            Self {
                id: id.to_string(),
                state: state.clone(),
            },
            state,
        )
    }
}

/// Handle to a model replicated across the fleet by [`ExecutionBackend::broadcast`].
#[derive(Debug, Clone)]
pub struct ModelHandle {
    model_id: String,
}

impl ModelHandle {
    /// The broadcast's model id.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Scheduler-side record of one registered worker connection.
struct WorkerEntry {
    worker_id: String,
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    cores: usize,
    in_flight: usize,
    /// Model id this worker acknowledged, if any.
    model_ready: Option<String>,
    retired: bool,
    /// Pending submissions placed on this worker, failed wholesale if the
    /// connection drops.
    assigned: HashMap<String, Arc<SubmissionState>>,
}

struct Shared {
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

/// The cluster scheduling service and its client operations.
pub struct ExecutionBackend {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    stop: Arc<Notify>,
}

impl ExecutionBackend {
    /// Bind the scheduler and start accepting worker connections on a
    /// background task.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            StyleFlowError::connection(format!("Failed to bind scheduler on {}: {}", addr, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StyleFlowError::connection(format!("Failed to read bound address: {}", e)))?;

        let shared = Arc::new(Shared {
            workers: Mutex::new(HashMap::new()),
        });
        let stop = Arc::new(Notify::new());
        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), stop.clone()));

        info!("Scheduler listening on {}", local_addr);
        Ok(Self {
            shared,
            local_addr,
            accept_task,
            stop,
        })
    }

    /// The address the scheduler actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered, unretired workers.
    pub fn worker_count(&self) -> usize {
        self.shared
            .workers
            .lock()
            .values()
            .filter(|w| !w.retired)
            .count()
    }

    /// Wait until `count` workers have registered.
    ///
    /// Returns false if the wait times out; the caller decides whether a
    /// partial fleet is acceptable.
    pub async fn wait_for_workers(&self, count: usize, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.worker_count() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(ACK_POLL_INTERVAL).await;
        }
    }

    /// Replicate the model artifact to every registered worker.
    ///
    /// Blocks until each of them acknowledges the model as loaded, so
    /// replication is complete, not merely started, before any batch can be
    /// submitted against the returned handle. A worker that disconnects
    /// mid-broadcast fails the broadcast.
    pub async fn broadcast(&self, artifact: &ModelArtifact) -> Result<ModelHandle> {
        let model_id = format!("{}-{}", artifact.style, Uuid::new_v4());
        let msg = SchedulerMessage::LoadModel {
            model_id: model_id.clone(),
            artifact: artifact.clone(),
        };

        let targets: Vec<String> = {
            let workers = self.shared.workers.lock();
            let targets: Vec<String> = workers
                .values()
                .filter(|w| !w.retired)
                .map(|w| w.worker_id.clone())
                .collect();
            for id in &targets {
                workers[id].tx.send(msg.clone()).map_err(|_| {
                    StyleFlowError::connection(format!("worker {} went away during broadcast", id))
                })?;
            }
            targets
        };

        if targets.is_empty() {
            return Err(StyleFlowError::worker_unavailable(
                "no workers registered for model broadcast",
            ));
        }

        METRICS.scheduler.broadcasts_total.inc();
        info!("Broadcasting model {} to {} workers", model_id, targets.len());

        loop {
            let mut acked = 0;
            {
                let workers = self.shared.workers.lock();
                for id in &targets {
                    match workers.get(id) {
                        Some(entry) if entry.model_ready.as_deref() == Some(&model_id) => {
                            acked += 1;
                        }
                        Some(_) => {}
                        None => {
                            return Err(StyleFlowError::connection(format!(
                                "worker {} disconnected during model broadcast",
                                id
                            )));
                        }
                    }
                }
            }
            if acked == targets.len() {
                break;
            }
            tokio::time::sleep(ACK_POLL_INTERVAL).await;
        }

        debug!("Model {} replicated on all {} workers", model_id, targets.len());
        Ok(ModelHandle { model_id })
    }

    /// Submit one batch against a broadcast model.
    ///
    /// Places the batch on the least-loaded worker holding the model and
    /// returns immediately with a completion handle. Outputs are written by
    /// the worker under `output_dir`, one file per input.
    pub fn submit_batch(
        &self,
        model: &ModelHandle,
        files: Vec<PathBuf>,
        output_dir: &Path,
    ) -> Result<PendingSubmission> {
        let submission_id = Uuid::new_v4().to_string();
        let state = Arc::new(SubmissionState::new());

        let mut workers = self.shared.workers.lock();
        let entry = select_worker(&mut workers, model.model_id()).ok_or_else(|| {
            StyleFlowError::worker_unavailable("no live worker holds the broadcast model")
        })?;

        entry
            .tx
            .send(SchedulerMessage::SubmitBatch {
                submission_id: submission_id.clone(),
                files,
                output_dir: output_dir.to_path_buf(),
            })
            .map_err(|_| {
                StyleFlowError::connection(format!("worker {} went away", entry.worker_id))
            })?;

        entry.in_flight += 1;
        entry
            .assigned
            .insert(submission_id.clone(), state.clone());
        debug!(
            "Placed batch {} on worker {} ({} in flight, {} cores)",
            submission_id, entry.worker_id, entry.in_flight, entry.cores
        );

        Ok(PendingSubmission {
            id: submission_id,
            state,
        })
    }

    /// Tell every worker to finish in-flight work and (optionally) close.
    ///
    /// Blocks until all acknowledge, bounded by a timeout that is logged
    /// and treated as non-fatal.
    pub async fn retire_workers(&self, close: bool) -> Result<()> {
        let targets: Vec<String> = {
            let workers = self.shared.workers.lock();
            let targets: Vec<String> = workers
                .values()
                .filter(|w| !w.retired)
                .map(|w| w.worker_id.clone())
                .collect();
            for id in &targets {
                // A worker that is already gone needs no retirement.
                let _ = workers[id].tx.send(SchedulerMessage::Retire { close });
            }
            targets
        };

        if targets.is_empty() {
            return Ok(());
        }
        info!("Retiring {} workers (close={})", targets.len(), close);

        let deadline = Instant::now() + RETIRE_TIMEOUT;
        loop {
            let pending = {
                let workers = self.shared.workers.lock();
                targets
                    .iter()
                    .filter(|id| workers.get(*id).map(|e| !e.retired).unwrap_or(false))
                    .count()
            };
            if pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} workers did not acknowledge retirement within {:?}; proceeding",
                    pending, RETIRE_TIMEOUT
                );
                break;
            }
            tokio::time::sleep(ACK_POLL_INTERVAL).await;
        }

        Ok(())
    }

    /// Stop accepting connections and join the background task, bounded.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.notify_one();

        let mut task = self.accept_task;
        match timeout(SHUTDOWN_JOIN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => info!("Scheduler stopped"),
            Ok(Err(e)) => error!("Scheduler task failed: {}", e),
            Err(_) => {
                warn!(
                    "Scheduler did not stop within {:?}; proceeding",
                    SHUTDOWN_JOIN_TIMEOUT
                );
                task.abort();
            }
        }
        Ok(())
    }
}

/// Least-loaded placement among live workers holding the model.
fn select_worker<'a>(
    workers: &'a mut HashMap<String, WorkerEntry>,
    model_id: &str,
) -> Option<&'a mut WorkerEntry> {
    workers
        .values_mut()
        .filter(|w| !w.retired && w.model_ready.as_deref() == Some(model_id))
        .min_by_key(|w| w.in_flight)
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    tokio::spawn(serve_worker(stream, shared.clone()));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("Scheduler accept loop stopped");
}

async fn serve_worker(stream: TcpStream, shared: Arc<Shared>) {
    if let Err(e) = handle_worker(stream, shared).await {
        warn!("Worker connection ended with error: {}", e);
    }
}

async fn handle_worker(stream: TcpStream, shared: Arc<Shared>) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| StyleFlowError::connection(format!("Failed to configure socket: {}", e)))?;
    let (mut reader, mut writer) = stream.into_split();

    // Registration is the first frame on the wire.
    let (worker_id, cores) = match read_frame::<_, WorkerMessage>(&mut reader).await? {
        Some(WorkerMessage::Register {
            worker_id,
            cores,
            memory_limit,
        }) => {
            debug!(
                "Worker {} registering with {} cores, memory limit {:?}",
                worker_id, cores, memory_limit
            );
            (worker_id, cores)
        }
        Some(other) => {
            return Err(StyleFlowError::protocol(format!(
                "expected registration, got {:?}",
                other
            )))
        }
        // Probe connections (health checks, port scans) just go away.
        None => return Ok(()),
    };

    write_frame(
        &mut writer,
        &SchedulerMessage::Registered {
            worker_id: worker_id.clone(),
        },
    )
    .await?;

    let (tx, rx) = mpsc::unbounded_channel();
    {
        let mut workers = shared.workers.lock();
        workers.insert(
            worker_id.clone(),
            WorkerEntry {
                worker_id: worker_id.clone(),
                tx,
                cores,
                in_flight: 0,
                model_ready: None,
                retired: false,
                assigned: HashMap::new(),
            },
        );
        METRICS.scheduler.workers_connected.set(workers.len() as i64);
    }
    info!("Registered worker {} ({} cores)", worker_id, cores);

    let writer_task = tokio::spawn(forward_outbound(writer, rx));

    let result = read_worker_messages(&mut reader, &shared, &worker_id).await;

    // Cleanup: drop the entry and fail whatever was still assigned here.
    let entry = {
        let mut workers = shared.workers.lock();
        let entry = workers.remove(&worker_id);
        METRICS.scheduler.workers_connected.set(workers.len() as i64);
        entry
    };
    if let Some(entry) = entry {
        for (submission_id, state) in entry.assigned {
            warn!(
                "Worker {} disconnected; failing batch {}",
                worker_id, submission_id
            );
            METRICS.scheduler.worker_lost_batches_total.inc();
            state.complete(true);
        }
        // Dropping the entry closed the outbound channel; let the writer
        // finish flushing.
        if let Err(e) = writer_task.await {
            error!("Writer task for worker {} failed: {}", worker_id, e);
        }
    }
    debug!("Worker {} connection closed", worker_id);

    result
}

async fn read_worker_messages(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    shared: &Arc<Shared>,
    worker_id: &str,
) -> Result<()> {
    loop {
        let msg = match read_frame::<_, WorkerMessage>(reader).await? {
            Some(msg) => msg,
            None => return Ok(()),
        };

        match msg {
            WorkerMessage::Register { .. } => {
                return Err(StyleFlowError::protocol("duplicate registration"));
            }

            WorkerMessage::ModelReady { model_id, .. } => {
                debug!("Worker {} acknowledged model {}", worker_id, model_id);
                let mut workers = shared.workers.lock();
                if let Some(entry) = workers.get_mut(worker_id) {
                    entry.model_ready = Some(model_id);
                }
            }

            WorkerMessage::BatchDone {
                submission_id,
                processed,
                error,
            } => {
                let state = {
                    let mut workers = shared.workers.lock();
                    workers.get_mut(worker_id).and_then(|entry| {
                        entry.in_flight = entry.in_flight.saturating_sub(1);
                        entry.assigned.remove(&submission_id)
                    })
                };

                match state {
                    Some(state) => match error {
                        None => {
                            debug!(
                                "Batch {} done on worker {} ({} images)",
                                submission_id, worker_id, processed
                            );
                            state.complete(false);
                        }
                        Some(err) => {
                            warn!(
                                "Batch {} failed on worker {}: {}",
                                submission_id, worker_id, err
                            );
                            state.complete(true);
                        }
                    },
                    None => warn!(
                        "Completion for unknown submission {} from worker {}",
                        submission_id, worker_id
                    ),
                }
            }

            WorkerMessage::Retiring { .. } => {
                info!("Worker {} retired", worker_id);
                let mut workers = shared.workers.lock();
                if let Some(entry) = workers.get_mut(worker_id) {
                    entry.retired = true;
                }
                METRICS.scheduler.workers_retired_total.inc();
            }
        }
    }
}

async fn forward_outbound(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<SchedulerMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            warn!("Failed to send to worker: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use styleflow_common::MemoryLimit;
    use styleflow_worker::WorkerService;

    async fn wait_done(submission: &PendingSubmission, wait: Duration) {
        let deadline = Instant::now() + wait;
        while !submission.is_done() {
            assert!(Instant::now() < deadline, "submission did not complete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn write_test_images(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("img_{:02}.png", i));
                RgbImage::from_pixel(8, 8, Rgb([i as u8 * 10, 50, 90]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broadcast_submit_retire_round_trip() {
        let backend = ExecutionBackend::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().to_string();

        let worker_a = WorkerService::connect(&addr, 1, MemoryLimit::Auto).await.unwrap();
        let worker_b = WorkerService::connect(&addr, 1, MemoryLimit::Auto).await.unwrap();
        assert!(backend.wait_for_workers(2, Duration::from_secs(5)).await);

        let model = backend
            .broadcast(&ModelArtifact::identity("plain", 3))
            .await
            .unwrap();

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let files = write_test_images(input.path(), 4);

        let submission = backend
            .submit_batch(&model, files.clone(), output.path())
            .unwrap();

        wait_done(&submission, Duration::from_secs(10)).await;
        assert!(!submission.is_failed());
        for file in &files {
            assert!(output.path().join(file.file_name().unwrap()).exists());
        }

        backend.retire_workers(true).await.unwrap();
        assert_eq!(backend.worker_count(), 0);

        worker_a.close(Duration::from_secs(2)).await.unwrap();
        worker_b.close(Duration::from_secs(2)).await.unwrap();
        backend.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_batch_does_not_poison_the_backend() {
        let backend = ExecutionBackend::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().to_string();

        let worker = WorkerService::connect(&addr, 1, MemoryLimit::Auto).await.unwrap();
        assert!(backend.wait_for_workers(1, Duration::from_secs(5)).await);

        let model = backend
            .broadcast(&ModelArtifact::identity("plain", 3))
            .await
            .unwrap();

        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();

        // One submission with an unreadable input fails alone.
        let bad = backend
            .submit_batch(
                &model,
                vec![input.path().join("missing.png")],
                output.path(),
            )
            .unwrap();
        let good_files = write_test_images(input.path(), 2);
        let good = backend
            .submit_batch(&model, good_files, output.path())
            .unwrap();

        wait_done(&bad, Duration::from_secs(10)).await;
        wait_done(&good, Duration::from_secs(10)).await;

        assert!(bad.is_failed());
        assert!(!good.is_failed());

        backend.retire_workers(true).await.unwrap();
        worker.close(Duration::from_secs(2)).await.unwrap();
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_requires_workers() {
        let backend = ExecutionBackend::bind("127.0.0.1:0").await.unwrap();

        let result = backend.broadcast(&ModelArtifact::identity("plain", 3)).await;
        assert!(matches!(result, Err(StyleFlowError::WorkerUnavailable(_))));

        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_disconnect_fails_assigned_submissions() {
        let backend = ExecutionBackend::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr();

        // A bare connection that registers and then dies without ever
        // reporting its batch.
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut conn_reader, mut conn_writer) = stream.into_split();
        write_frame(
            &mut conn_writer,
            &WorkerMessage::Register {
                worker_id: "w-flaky".to_string(),
                cores: 1,
                memory_limit: None,
            },
        )
        .await
        .unwrap();
        let ack: Option<SchedulerMessage> = read_frame(&mut conn_reader).await.unwrap();
        assert!(matches!(ack, Some(SchedulerMessage::Registered { .. })));
        assert!(backend.wait_for_workers(1, Duration::from_secs(5)).await);

        // Rig a submission onto the flaky worker's books.
        let (submission, state) = PendingSubmission::test_handle("orphan");
        {
            let mut workers = backend.shared.workers.lock();
            let entry = workers.get_mut("w-flaky").unwrap();
            entry.assigned.insert("orphan".to_string(), state);
        }
        assert!(!submission.is_done());

        drop(conn_reader);
        drop(conn_writer);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !submission.is_done() {
            assert!(Instant::now() < deadline, "orphan submission never failed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(submission.is_failed());
        assert_eq!(backend.worker_count(), 0);

        backend.shutdown().await.unwrap();
    }

    #[test]
    fn test_least_loaded_placement() {
        let mut workers = HashMap::new();
        for (id, in_flight, ready) in [("a", 3, true), ("b", 1, true), ("c", 0, false)] {
            let (tx, _rx) = mpsc::unbounded_channel();
            workers.insert(
                id.to_string(),
                WorkerEntry {
                    worker_id: id.to_string(),
                    tx,
                    cores: 1,
                    in_flight,
                    model_ready: ready.then(|| "m-1".to_string()),
                    retired: false,
                    assigned: HashMap::new(),
                },
            );
        }

        // "c" has the least load but no model; "b" wins.
        let picked = select_worker(&mut workers, "m-1").unwrap();
        assert_eq!(picked.worker_id, "b");

        // A retired worker is never picked.
        workers.get_mut("b").unwrap().retired = true;
        let picked = select_worker(&mut workers, "m-1").unwrap();
        assert_eq!(picked.worker_id, "a");

        workers.get_mut("a").unwrap().retired = true;
        assert!(select_worker(&mut workers, "m-1").is_none());
    }
}
