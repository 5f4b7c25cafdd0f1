//! One-shot still capture via `libcamera-still`.
//!
//! A fresh capture process runs for every frame and writes one JPEG to its
//! stdout. This serializes camera access per frame and is far slower than
//! the pipe backend, but needs nothing long-lived. Failed captures retry
//! with exponential backoff up to a bounded attempt count; once the budget
//! is spent the source reports a terminal error instead of spinning.

use std::process::Command;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use super::{CameraError, CameraResult, CaptureConfig, FrameSource};

const STILL_COMMAND: &str = "libcamera-still";

/// Bounded retry schedule for failed captures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Frame source that invokes a still-capture command per frame.
pub struct StillCommandSource {
    command: String,
    config: CaptureConfig,
    retry: RetryPolicy,
}

impl StillCommandSource {
    pub fn new(config: &CaptureConfig) -> Self {
        Self::with_retry(config, RetryPolicy::default())
    }

    pub fn with_retry(config: &CaptureConfig, retry: RetryPolicy) -> Self {
        let command = config
            .command
            .clone()
            .unwrap_or_else(|| STILL_COMMAND.to_string());
        Self {
            command,
            config: config.clone(),
            retry,
        }
    }
}

impl FrameSource for StillCommandSource {
    fn next_frame(&mut self) -> CameraResult<Bytes> {
        let mut backoff = self.retry.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            let result = Command::new(&self.command)
                .args(["-o", "-", "-t", "1", "-n"])
                .args(["--width", &self.config.width.to_string()])
                .args(["--height", &self.config.height.to_string()])
                .output();

            match result {
                Ok(output) if output.status.success() => {
                    if output.stdout.is_empty() {
                        last_error = format!("{} produced no image data", self.command);
                    } else {
                        return Ok(Bytes::from(output.stdout));
                    }
                }
                Ok(output) => {
                    last_error = format!("{} exited with {}", self.command, output.status);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CameraError::CommandNotFound(self.command.clone()));
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(
                "capture attempt {attempt}/{} failed: {last_error}",
                self.retry.max_attempts
            );
            if attempt < self.retry.max_attempts {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(self.retry.max_backoff);
            }
        }

        Err(CameraError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }

    fn name(&self) -> &str {
        &self.command
    }

    fn idle_when_unwatched(&self) -> bool {
        true
    }
}
