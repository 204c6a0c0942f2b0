//! StyleFlow wire protocol
//!
//! Message types exchanged between the cluster scheduler and its workers,
//! serialized as JSON and sent as length-prefixed frames over TCP. Every
//! connection carries exactly one worker: the worker opens with `Register`,
//! the scheduler answers `Registered`, and from then on both sides exchange
//! frames full-duplex until the retire handshake closes the connection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame, including the serialized model artifact.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// The broadcastable style model artifact.
///
/// This is the read-only state replicated to every worker before any batch
/// is submitted: a 3x3 filter bank plus a per-channel bias, blended with the
/// input by `strength`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Style name, used for logging and as part of the model id.
    pub style: String,

    /// Number of image channels the filter bank operates on.
    pub channels: usize,

    /// 3x3 convolution weights, laid out `[out_channel][in_channel][ky][kx]`.
    pub kernel: Vec<f32>,

    /// Per-output-channel bias.
    pub bias: Vec<f32>,

    /// Blend factor between the filtered image and the input, in `[0, 1]`.
    pub strength: f32,
}

impl ModelArtifact {
    /// Expected kernel length for a given channel count.
    pub fn kernel_len(channels: usize) -> usize {
        channels * channels * 9
    }

    /// An artifact whose filter output equals its input.
    pub fn identity(style: impl Into<String>, channels: usize) -> Self {
        let mut kernel = vec![0.0f32; Self::kernel_len(channels)];
        for ch in 0..channels {
            // Center tap of the [ch][ch] 3x3 filter.
            kernel[ch * channels * 9 + ch * 9 + 4] = 1.0;
        }

        Self {
            style: style.into(),
            channels,
            kernel,
            bias: vec![0.0; channels],
            strength: 1.0,
        }
    }
}

/// Messages sent from a worker to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First frame on a fresh connection. `cores` and `memory_limit` are
    /// advisory sizing, not a scheduling guarantee.
    Register {
        worker_id: String,
        cores: usize,
        memory_limit: Option<u64>,
    },

    /// The broadcast model has been loaded and is ready for inference.
    ModelReady {
        worker_id: String,
        model_id: String,
    },

    /// A submitted batch has finished. `error` distinguishes a failed batch
    /// from a successful one; either way the submission is complete.
    BatchDone {
        submission_id: String,
        processed: usize,
        error: Option<String>,
    },

    /// Acknowledges a retire request; in-flight batches have drained.
    Retiring { worker_id: String },
}

/// Messages sent from the scheduler to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerMessage {
    /// Registration accepted; the worker may now receive work.
    Registered { worker_id: String },

    /// Replicate the model artifact. The worker must answer `ModelReady`
    /// once inference can run against it.
    LoadModel {
        model_id: String,
        artifact: ModelArtifact,
    },

    /// Process one batch of input files, writing one output per input under
    /// `output_dir` with the original base filename.
    SubmitBatch {
        submission_id: String,
        files: Vec<PathBuf>,
        output_dir: PathBuf,
    },

    /// Finish in-flight batches, acknowledge with `Retiring`, and if
    /// `close` is set, shut the connection down afterwards.
    Retire { close: bool },
}

/// Write one message as a `u32` big-endian length prefix plus JSON body.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds maximum", body.len()),
        ));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Read one length-prefixed message.
///
/// Returns `Ok(None)` on a clean end of stream (the peer closed between
/// frames); an EOF in the middle of a frame is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds maximum", len),
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let msg = serde_json::from_slice(&body)?;
    Ok(Some(msg))
}
