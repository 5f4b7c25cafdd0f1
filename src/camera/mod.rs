//! Camera capture backends.
//!
//! Exactly one capture resource exists per process. A [`FrameSource`] pulls
//! JPEG-encoded frames from that resource one at a time; the serving layer
//! fans frames out to HTTP clients, so a backend never has more than one
//! reader no matter how many viewers are connected.

mod frame_splitter;
mod still_command;
mod video_pipe;

pub use frame_splitter::JpegFrameSplitter;
pub use still_command::{RetryPolicy, StillCommandSource};
pub use video_pipe::{CameraShutdown, VideoPipeSource};

use bytes::Bytes;
use thiserror::Error;

/// Error type for capture operations.
#[derive(Error, Debug)]
pub enum CameraError {
    /// No usable capture executable on this system.
    #[error("capture command not found: {0}")]
    CommandNotFound(String),

    /// The long-lived capture process terminated.
    #[error("capture process ended: {0}")]
    ProcessEnded(String),

    /// A one-shot capture kept failing after bounded retries.
    #[error("capture failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// I/O failure on the capture pipe.
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for capture operations.
pub type CameraResult<T> = Result<T, CameraError>;

/// Configuration shared by all capture backends.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frame rate in frames per second (continuous capture only)
    pub framerate: u32,
    /// Override for the capture executable name
    pub command: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 30,
            command: None,
        }
    }
}

/// Blocking source of JPEG-encoded frames.
///
/// Implementations own the underlying capture resource. `next_frame` blocks
/// the calling thread until a frame is available, so the capture loop runs on
/// a dedicated OS thread rather than a tokio worker.
pub trait FrameSource: Send {
    /// Block until the next JPEG-encoded frame is available.
    fn next_frame(&mut self) -> CameraResult<Bytes>;

    /// Name of the capture backend, for logs and the status page.
    fn name(&self) -> &str;

    /// Whether production may pause while no client is watching.
    ///
    /// A one-shot backend spawns a process per frame, so capturing with zero
    /// viewers is pure waste. A pipe backend must keep draining its pipe
    /// regardless, or the capture process blocks on a full pipe buffer.
    fn idle_when_unwatched(&self) -> bool {
        false
    }
}
