//! Cluster bootstrap
//!
//! Each process derives its role once from the launch environment's rank
//! and never re-evaluates it: rank 0 hosts the scheduler plus a co-located
//! worker and drives the dispatch loop; every other rank runs a worker and
//! blocks until the scheduler closes it out.

use crate::backend::ExecutionBackend;
use crate::discovery::FileSource;
use crate::dispatcher::{dispatch_batches, DispatchOptions};
use std::time::Duration;
use styleflow_common::{Result, StyleFlowError, StyleFlowConfig};
use styleflow_worker::{load_artifact, WorkerService, WorkerStatus};
use tokio::time::Instant;
use tracing::{info, warn};

/// Poll interval for a worker-only rank watching its liveness status.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded wait for the worker close handshake.
pub const WORKER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for the rest of the fleet to register before the model
/// broadcast. A partial fleet is a warning, not an error.
const FLEET_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Role of one cluster process, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    /// Hosts the scheduler and the dispatch loop; also runs a worker.
    Coordinator,

    /// Runs a worker and nothing else.
    WorkerOnly,
}

impl ClusterRole {
    /// Rank 0 coordinates; everyone else only works.
    pub fn from_rank(rank: usize) -> Self {
        if rank == 0 {
            ClusterRole::Coordinator
        } else {
            ClusterRole::WorkerOnly
        }
    }
}

/// Run this process in the role its rank assigns.
pub async fn start(config: &StyleFlowConfig) -> Result<()> {
    let role = ClusterRole::from_rank(config.cluster.rank);
    info!(
        "Rank {} of {} running as {:?}",
        config.cluster.rank, config.cluster.world_size, role
    );
    info!(
        "Detected {} nodes with {} cpus per node",
        config.cluster.node_count, config.cluster.cpus_per_node
    );

    match role {
        ClusterRole::Coordinator => run_coordinator(config).await,
        ClusterRole::WorkerOnly => run_worker_only(config).await,
    }
}

/// Coordinator lifecycle: scheduler up, fleet assembled, model broadcast,
/// dispatch to completion, fleet retired, scheduler down.
async fn run_coordinator(config: &StyleFlowConfig) -> Result<()> {
    let backend = ExecutionBackend::bind(&config.cluster.scheduler_bind_addr()?).await?;

    let cores = config.cluster.effective_cores_per_worker();
    info!("Setting {} cores per worker", cores);

    // The coordinator's own worker connects over loopback.
    let local_addr = format!("127.0.0.1:{}", backend.local_addr().port());
    let local_worker =
        WorkerService::connect(&local_addr, cores, config.cluster.memory_limit).await?;

    if !backend
        .wait_for_workers(config.cluster.world_size, FLEET_WAIT_TIMEOUT)
        .await
    {
        warn!(
            "Only {} of {} workers registered after {:?}; continuing with a partial fleet",
            backend.worker_count(),
            config.cluster.world_size,
            FLEET_WAIT_TIMEOUT
        );
    }

    let artifact = load_artifact(&config.pipeline.model_path)?;
    info!("Running style transfer with {}", artifact.style);

    let replication_start = Instant::now();
    let model = backend.broadcast(&artifact).await?;
    info!(
        "Model replicated on workers | took {:.2} seconds",
        replication_start.elapsed().as_secs_f64()
    );

    std::fs::create_dir_all(&config.pipeline.output_dir)?;
    info!(
        "Reading files matching {} from {}",
        config.pipeline.pattern,
        config.pipeline.input_dir.display()
    );
    info!("Writing files to {}", config.pipeline.output_dir.display());

    let mut source = FileSource::new(&config.pipeline.input_dir, &config.pipeline.pattern)?;
    let options = DispatchOptions {
        batch_size: config.pipeline.batch_size,
        patience: config.pipeline.patience(),
        sleep_period: config.pipeline.sleep_period(),
    };

    let output_dir = config.pipeline.output_dir.clone();
    let processing_start = Instant::now();
    let summary = dispatch_batches(
        &mut source,
        |batch| backend.submit_batch(&model, batch, &output_dir),
        &options,
    )
    .await?;
    info!(
        "Finished processing {} files in {} batches in {:.2} seconds",
        summary.files_submitted,
        summary.batches_submitted,
        processing_start.elapsed().as_secs_f64()
    );

    backend.retire_workers(true).await?;
    local_worker.close(WORKER_CLOSE_TIMEOUT).await?;
    backend.shutdown().await?;

    info!("Exiting coordinator");
    Ok(())
}

/// Worker-only lifecycle: connect, watch liveness until closed, close out.
async fn run_worker_only(config: &StyleFlowConfig) -> Result<()> {
    let addr = &config.cluster.master_addr;
    if addr.is_empty() {
        // Without the coordinator's location this rank can only hang.
        return Err(StyleFlowError::config(
            "master address not set: worker cannot locate the coordinator",
        ));
    }

    let worker = WorkerService::connect(
        addr,
        config.cluster.effective_cores_per_worker(),
        config.cluster.memory_limit,
    )
    .await?;

    while worker.status() != WorkerStatus::Closed {
        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
    }

    info!("Closing worker");
    worker.close(WORKER_CLOSE_TIMEOUT).await?;
    info!("Exiting worker");
    Ok(())
}
