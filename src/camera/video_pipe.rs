//! Continuous capture from a long-lived `rpicam-vid` pipe.
//!
//! One capture process is spawned at server startup and produces an MJPEG
//! byte stream on its stdout. The capture loop is the pipe's only reader;
//! frames are recovered with [`JpegFrameSplitter`] and fanned out by the
//! serving layer. Older Raspberry Pi OS images ship the same tool as
//! `libcamera-vid`, so that name is tried once as a fallback.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{CameraError, CameraResult, CaptureConfig, FrameSource, JpegFrameSplitter};

/// Capture commands tried in order at startup.
const PIPE_COMMANDS: &[&str] = &["rpicam-vid", "libcamera-vid"];

/// How long to wait after spawn before checking the process is still alive.
/// A missing or busy camera makes the process exit almost immediately
/// rather than fail at spawn, and that must surface as a startup error.
const STARTUP_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK_BYTES: usize = 4096;
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Frame source backed by one long-lived capture process.
pub struct VideoPipeSource {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    splitter: JpegFrameSplitter,
    chunk: Vec<u8>,
    name: String,
}

/// Handle for releasing the capture process independently of the reader.
///
/// The capture thread spends its life blocked in a pipe read, so shutdown
/// cannot go through the [`VideoPipeSource`] itself. Killing the child from
/// this handle makes the blocked read return EOF, which ends the capture
/// loop and drops the source.
#[derive(Clone)]
pub struct CameraShutdown {
    child: Arc<Mutex<Child>>,
}

impl CameraShutdown {
    /// Terminate the capture process and reap it.
    pub fn release(&self) {
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => debug!("capture process already exited: {status}"),
            _ => {
                if let Err(e) = child.kill() {
                    warn!("failed to kill capture process: {e}");
                }
                let _ = child.wait();
                info!("capture process stopped");
            }
        }
    }
}

impl VideoPipeSource {
    /// Spawn the capture process and return the source plus its shutdown
    /// handle.
    ///
    /// With no command override, `rpicam-vid` is tried first and
    /// `libcamera-vid` once as a fallback. If neither can be started the
    /// server must not come up, so the error is returned rather than
    /// deferred to the first frame read.
    pub fn spawn(config: &CaptureConfig) -> CameraResult<(Self, CameraShutdown)> {
        let candidates: Vec<String> = match &config.command {
            Some(cmd) => vec![cmd.clone()],
            None => PIPE_COMMANDS.iter().map(|s| s.to_string()).collect(),
        };

        for (i, cmd) in candidates.iter().enumerate() {
            match Self::spawn_command(cmd, config) {
                Ok(pair) => {
                    if i > 0 {
                        info!("{} not found, using {}", candidates[0], cmd);
                    }
                    return Ok(pair);
                }
                Err(CameraError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("capture command not found: {cmd}");
                }
                Err(e) => return Err(e),
            }
        }

        Err(CameraError::CommandNotFound(candidates.join(", ")))
    }

    fn spawn_command(cmd: &str, config: &CaptureConfig) -> CameraResult<(Self, CameraShutdown)> {
        let mut child = Command::new(cmd)
            .args(["-t", "0", "--codec", "mjpeg", "-o", "-", "--nopreview"])
            .args(["--width", &config.width.to_string()])
            .args(["--height", &config.height.to_string()])
            .args(["--framerate", &config.framerate.to_string()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        std::thread::sleep(STARTUP_GRACE);
        if let Some(status) = child.try_wait()? {
            return Err(CameraError::ProcessEnded(format!(
                "{cmd} exited during startup: {status}"
            )));
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CameraError::ProcessEnded(format!("{cmd} has no stdout pipe")))?;

        info!(
            "capture process started: {cmd} {}x{} @ {} fps",
            config.width, config.height, config.framerate
        );

        let child = Arc::new(Mutex::new(child));
        let shutdown = CameraShutdown {
            child: child.clone(),
        };

        Ok((
            Self {
                child,
                stdout,
                splitter: JpegFrameSplitter::new(MAX_FRAME_BYTES),
                chunk: vec![0; READ_CHUNK_BYTES],
                name: cmd.to_string(),
            },
            shutdown,
        ))
    }

    fn exit_detail(&self) -> String {
        let status = self
            .child
            .lock()
            .ok()
            .and_then(|mut child| child.try_wait().ok().flatten());
        match status {
            Some(status) => status.to_string(),
            None => "pipe closed".to_string(),
        }
    }
}

impl FrameSource for VideoPipeSource {
    fn next_frame(&mut self) -> CameraResult<Bytes> {
        loop {
            if let Some(frame) = self.splitter.next_frame() {
                return Ok(frame);
            }
            let n = self.stdout.read(&mut self.chunk)?;
            if n == 0 {
                return Err(CameraError::ProcessEnded(self.exit_detail()));
            }
            self.splitter.push(&self.chunk[..n]);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for VideoPipeSource {
    fn drop(&mut self) {
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        if matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
