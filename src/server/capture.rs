//! Frame production loop and server bootstrap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{error, info};

use super::{create_router, AppState, FrameStats, ServerArgs};
use crate::camera::{CameraError, CameraShutdown, CaptureConfig, FrameSource};
use crate::device_state::DeviceStateBroadcaster;
use crate::mjpeg::{MjpegBroadcaster, MjpegFrame};

/// Poll interval while an idle-capable source waits for its first viewer.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Pull frames from the capture source and publish each one to the MJPEG
/// broadcaster.
///
/// Every `next_frame` call blocks on an external process, so this runs on a
/// dedicated OS thread. The source is the only reader of the capture
/// resource; fan-out to clients happens entirely through the broadcaster.
///
/// Returns when the source reports end-of-stream or a terminal error. The
/// broadcaster is closed on the way out so every client response ends too.
pub fn capture_loop_blocking<S: FrameSource>(state: Arc<AppState>, mut source: S) {
    let mut frame_number: u64 = 0;

    loop {
        if source.idle_when_unwatched() && state.mjpeg.subscriber_count() == 0 {
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        match source.next_frame() {
            Ok(jpeg_data) => {
                frame_number += 1;
                {
                    let mut stats = state.stats.blocking_lock();
                    let now = Instant::now();
                    let elapsed = now.duration_since(stats.last_frame_time).as_secs_f32();
                    if elapsed > 0.0 {
                        stats.fps_samples.push(1.0 / elapsed);
                    }
                    stats.total_frames += 1;
                    stats.last_frame_time = now;
                    stats.last_frame_bytes = jpeg_data.len();
                }
                state.mjpeg.publish(MjpegFrame {
                    jpeg_data,
                    frame_number,
                });
            }
            Err(CameraError::ProcessEnded(detail)) => {
                info!("capture stream ended: {detail}");
                break;
            }
            Err(e) => {
                error!("capture failed: {e}");
                break;
            }
        }
    }

    state.mjpeg.close();
}

/// Run the camera server until SIGINT or SIGTERM.
///
/// Builds the shared state, starts the capture thread, and serves HTTP.
/// On shutdown the MJPEG broadcaster is closed and the camera handle (if
/// any) is released, which also unblocks the capture thread's pipe read.
pub async fn run_server<S: FrameSource + 'static>(
    source: S,
    config: &CaptureConfig,
    args: ServerArgs,
    camera: Option<CameraShutdown>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        mjpeg: Arc::new(MjpegBroadcaster::new(4)),
        device: DeviceStateBroadcaster::new(16),
        stats: Mutex::new(FrameStats::default()),
        camera_name: source.name().to_string(),
        frame_size: (config.width, config.height),
    });

    info!("starting capture loop ({})", state.camera_name);
    let capture_state = state.clone();
    std::thread::spawn(move || capture_loop_blocking(capture_state, source));

    let app = create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.bind_address, args.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {e}"))?;

    info!("Starting server on http://{addr}");
    info!("Video stream: http://{addr}/video");
    info!("Device state: http://{addr}/state");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {e}"))?;

    info!("shutting down");
    state.mjpeg.close();
    if let Some(camera) = camera {
        camera.release();
    }

    Ok(())
}

/// Resolve on SIGINT or SIGTERM so `axum::serve` can drain connections and
/// the camera release path runs on both signals.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
