//! Worker service
//!
//! Connects to the cluster scheduler, registers, and serves scheduler
//! messages until retired: model broadcasts are acknowledged once the model
//! is runnable, and each submitted batch runs as its own task through an
//! explicit stage chain (decode, stack, stylize, write). One batch is the
//! failure-isolation boundary: a bad file fails its own batch's submission
//! and nothing else.

use image::RgbImage;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use styleflow_common::{MemoryLimit, Result, StyleFlowError, METRICS};
use styleflow_proto::{read_frame, write_frame, SchedulerMessage, WorkerMessage};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::image_io;
use crate::model::StyleModel;
use crate::tensor::TensorBatch;

/// Worker lifecycle status, observable by the bootstrap's poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Registered and accepting work.
    Running,

    /// Retire received; draining in-flight batches.
    Retiring,

    /// Connection finished; the service will not take more work.
    Closed,
}

/// A worker connected to the scheduler.
///
/// The connection is served by a background task; this handle only exposes
/// status observation and the bounded close handshake.
pub struct WorkerService {
    worker_id: String,
    status_rx: watch::Receiver<WorkerStatus>,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl WorkerService {
    /// Connect to the scheduler at `addr` and register.
    ///
    /// `cores` and `memory_limit` are advisory sizing forwarded to the
    /// scheduler; they do not constrain local execution.
    pub async fn connect(addr: &str, cores: usize, memory_limit: MemoryLimit) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            StyleFlowError::connection(format!("Failed to connect to scheduler at {}: {}", addr, e))
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| StyleFlowError::connection(format!("Failed to configure socket: {}", e)))?;

        let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &WorkerMessage::Register {
                worker_id: worker_id.clone(),
                cores,
                memory_limit: memory_limit.as_bytes(),
            },
        )
        .await?;

        match read_frame::<_, SchedulerMessage>(&mut reader).await? {
            Some(SchedulerMessage::Registered { .. }) => {}
            Some(other) => {
                return Err(StyleFlowError::protocol(format!(
                    "expected registration ack, got {:?}",
                    other
                )))
            }
            None => {
                return Err(StyleFlowError::connection(
                    "scheduler closed the connection during registration",
                ))
            }
        }

        info!("Worker {} registered with scheduler at {}", worker_id, addr);

        let (status_tx, status_rx) = watch::channel(WorkerStatus::Running);
        let task = tokio::spawn(run_connection(reader, writer, worker_id.clone(), status_tx));

        Ok(Self {
            worker_id,
            status_rx,
            task,
        })
    }

    /// This worker's cluster-unique id.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> WorkerStatus {
        *self.status_rx.borrow()
    }

    /// Close handshake with a bounded wait.
    ///
    /// Waits up to `wait` for the connection task to finish; on timeout the
    /// task is aborted and the worker exits anyway (best-effort shutdown).
    pub async fn close(self, wait: Duration) -> Result<()> {
        let mut task = self.task;
        match timeout(wait, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StyleFlowError::internal(format!(
                "worker {} connection task failed: {}",
                self.worker_id, join_err
            ))),
            Err(_) => {
                warn!(
                    "Worker {} did not close within {:?}; proceeding",
                    self.worker_id, wait
                );
                task.abort();
                Ok(())
            }
        }
    }
}

/// Serve the registered connection until the scheduler retires it or goes
/// away. Always flips the status to `Closed` on the way out.
async fn run_connection(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    worker_id: String,
    status_tx: watch::Sender<WorkerStatus>,
) -> Result<()> {
    let result = serve(reader, writer, &worker_id, &status_tx).await;

    status_tx.send_replace(WorkerStatus::Closed);
    match &result {
        Ok(()) => info!("Worker {} closed", worker_id),
        Err(e) => error!("Worker {} connection failed: {}", worker_id, e),
    }
    result
}

async fn serve(
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    worker_id: &str,
    status_tx: &watch::Sender<WorkerStatus>,
) -> Result<()> {
    let model: Arc<RwLock<Option<Arc<StyleModel>>>> = Arc::new(RwLock::new(None));

    // All outbound frames funnel through one writer task so batch tasks can
    // report completion without contending for the socket.
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer_task = tokio::spawn(write_outbound(writer, out_rx));

    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        let frame = match read_frame::<_, SchedulerMessage>(&mut reader).await? {
            Some(frame) => frame,
            None => {
                debug!("Scheduler closed the connection");
                break;
            }
        };

        match frame {
            SchedulerMessage::Registered { .. } => {}

            SchedulerMessage::LoadModel { model_id, artifact } => {
                // A model that cannot load means this worker can never
                // serve a batch; dropping the connection tells the
                // scheduler immediately.
                let loaded = StyleModel::from_artifact(&artifact)?;
                info!(
                    "Worker {} loaded model {} (style {})",
                    worker_id,
                    model_id,
                    loaded.style()
                );
                *model.write() = Some(Arc::new(loaded));

                out_tx
                    .send(WorkerMessage::ModelReady {
                        worker_id: worker_id.to_string(),
                        model_id,
                    })
                    .map_err(|_| StyleFlowError::connection("writer task stopped"))?;
            }

            SchedulerMessage::SubmitBatch {
                submission_id,
                files,
                output_dir,
            } => {
                let model_ref = model.read().clone();
                let out = out_tx.clone();

                in_flight.spawn(async move {
                    let started = Instant::now();
                    let result = match model_ref {
                        Some(m) => process_batch(m, &files, &output_dir).await,
                        None => Err(StyleFlowError::model(
                            "batch submitted before model broadcast",
                        )),
                    };
                    METRICS
                        .worker
                        .batch_duration
                        .observe(started.elapsed().as_secs_f64());

                    let msg = match result {
                        Ok(processed) => {
                            METRICS.worker.images_processed_total.inc_by(processed as u64);
                            debug!("Batch {} processed {} images", submission_id, processed);
                            WorkerMessage::BatchDone {
                                submission_id,
                                processed,
                                error: None,
                            }
                        }
                        Err(e) => {
                            warn!("Batch {} failed: {}", submission_id, e);
                            WorkerMessage::BatchDone {
                                submission_id,
                                processed: 0,
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    let _ = out.send(msg);
                });
            }

            SchedulerMessage::Retire { close } => {
                info!("Worker {} retiring (close={})", worker_id, close);
                status_tx.send_replace(WorkerStatus::Retiring);

                // Drain in-flight batches; their BatchDone frames are
                // queued before the tasks complete, so the retire ack
                // below is ordered after every completion on the wire.
                while let Some(joined) = in_flight.join_next().await {
                    if let Err(e) = joined {
                        error!("Batch task failed: {}", e);
                    }
                }

                out_tx
                    .send(WorkerMessage::Retiring {
                        worker_id: worker_id.to_string(),
                    })
                    .map_err(|_| StyleFlowError::connection("writer task stopped"))?;

                if close {
                    break;
                }
                status_tx.send_replace(WorkerStatus::Running);
            }
        }
    }

    // Let the writer flush queued frames, then hang up.
    drop(out_tx);
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Batch task failed: {}", e);
        }
    }
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Worker {} writer stopped with error: {}", worker_id, e),
        Err(e) => error!("Worker {} writer task failed: {}", worker_id, e),
    }

    Ok(())
}

async fn write_outbound(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<WorkerMessage>,
) -> Result<()> {
    while let Some(msg) = out_rx.recv().await {
        write_frame(&mut writer, &msg).await?;
    }
    use tokio::io::AsyncWriteExt;
    writer.shutdown().await?;
    Ok(())
}

/// Process one batch as a chain of asynchronous stages.
///
/// Each stage runs off the connection's I/O loop; the heavy work happens on
/// the blocking pool with rayon parallelism inside the stylize stage.
async fn process_batch(
    model: Arc<StyleModel>,
    files: &[PathBuf],
    output_dir: &Path,
) -> Result<usize> {
    // Stage 1: read and decode every input.
    let stage_files = files.to_vec();
    let images = tokio::task::spawn_blocking(move || decode_files(&stage_files))
        .await
        .map_err(|e| StyleFlowError::internal(format!("decode stage failed: {}", e)))??;

    // Stage 2 + 3: stack into one tensor and run inference over it.
    let styled = tokio::task::spawn_blocking(move || -> Result<TensorBatch> {
        let batch = TensorBatch::from_images(images)?;
        model.stylize_batch(&batch)
    })
    .await
    .map_err(|e| StyleFlowError::internal(format!("inference stage failed: {}", e)))??;

    // Stage 4: write one output per input under its original filename.
    let stage_files = files.to_vec();
    let stage_output = output_dir.to_path_buf();
    tokio::task::spawn_blocking(move || write_outputs(&stage_files, &styled, &stage_output))
        .await
        .map_err(|e| StyleFlowError::internal(format!("write stage failed: {}", e)))?
}

fn decode_files(files: &[PathBuf]) -> Result<Vec<RgbImage>> {
    files
        .iter()
        .map(|file| {
            image_io::load_image(file).map_err(|e| {
                METRICS.worker.decode_failures_total.inc();
                e
            })
        })
        .collect()
}

fn write_outputs(files: &[PathBuf], batch: &TensorBatch, output_dir: &Path) -> Result<usize> {
    let images = batch.to_images()?;
    for (file, img) in files.iter().zip(&images) {
        image_io::save_image(&image_io::output_path(file, output_dir)?, img)?;
    }
    Ok(images.len())
}
