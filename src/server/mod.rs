//! HTTP serving layer: routes, shared state, and the web UI page.

mod capture;
pub use capture::{capture_loop_blocking, run_server};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Request, State,
    },
    middleware::{self, Next},
    response::{Html, Response},
    routing::get,
    Json, Router,
};
use clap::Args;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::device_state::{DeviceState, DeviceStateBroadcaster, DeviceStateUpdate};
use crate::mjpeg::MjpegBroadcaster;

/// Command-line arguments shared by server binaries.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// TCP port for the HTTP server.
    #[arg(value_name = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// IP address to bind. Use 0.0.0.0 to listen on all interfaces.
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    pub bind_address: String,
}

/// Shared state between the capture loop and HTTP handlers.
pub struct AppState {
    /// Fan-out of captured frames to `/video` clients
    pub mjpeg: Arc<MjpegBroadcaster>,
    /// Device control state + push channel
    pub device: DeviceStateBroadcaster,
    pub stats: Mutex<FrameStats>,
    pub camera_name: String,
    pub frame_size: (u32, u32),
}

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn average(&self) -> f32 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f32>() / self.samples.len() as f32
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
pub struct FrameStats {
    pub total_frames: u64,
    pub fps_samples: SlidingWindow,
    pub last_frame_time: Instant,
    pub last_frame_bytes: usize,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            total_frames: 0,
            fps_samples: SlidingWindow::new(10),
            last_frame_time: Instant::now(),
            last_frame_bytes: 0,
        }
    }
}

const INDEX_HTML: &str = include_str!("../../templates/index.html");

async fn index_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let html = INDEX_HTML
        .replace("{camera}", &state.camera_name)
        .replace("{width}", &state.frame_size.0.to_string())
        .replace("{height}", &state.frame_size.1.to_string());
    Html(html)
}

/// The live video feed: an indefinite multipart sequence, one part per
/// captured frame, open until the client disconnects or capture ends.
async fn video_endpoint(State(state): State<Arc<AppState>>) -> Response {
    state.mjpeg.subscribe().into_response()
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    camera: String,
    total_frames: u64,
    avg_fps: f32,
    last_frame_bytes: usize,
    stream_clients: usize,
    state_clients: usize,
}

async fn stats_endpoint(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.stats.lock().await;
    Json(StatsResponse {
        camera: state.camera_name.clone(),
        total_frames: stats.total_frames,
        avg_fps: stats.fps_samples.average(),
        last_frame_bytes: stats.last_frame_bytes,
        stream_clients: state.mjpeg.subscriber_count(),
        state_clients: state.device.client_count(),
    })
}

async fn get_state_endpoint(State(state): State<Arc<AppState>>) -> Json<DeviceState> {
    Json(state.device.snapshot())
}

/// External control path: the device daemon merges a partial mapping here
/// and every push-channel client receives the full result.
async fn update_state_endpoint(
    State(state): State<Arc<AppState>>,
    Json(update): Json<DeviceStateUpdate>,
) -> Json<DeviceState> {
    debug!("device state update via HTTP: {update:?}");
    Json(state.device.apply(&update))
}

async fn ws_state_endpoint(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| ws_state_handler(socket, state))
}

/// Bidirectional push channel for device state.
///
/// Sends the full mapping immediately on connect, then after every mutation.
/// Incoming text messages are partial updates; they merge into the shared
/// state, which re-broadcasts to all clients including this one.
async fn ws_state_handler(ws: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = ws.split();
    let mut rx = state.device.subscribe();

    // Snapshot first so the client renders without waiting for a change.
    if let Ok(json) = serde_json::to_string(&state.device.snapshot()) {
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(full) => {
                        if let Ok(json) = serde_json::to_string(&full) {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Intermediate states are disposable; the next recv
                        // returns the latest mapping anyway.
                        debug!("state client lagged, skipped {n} updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<DeviceStateUpdate>(&text) {
                            Ok(update) => {
                                state.device.apply(&update);
                            }
                            Err(e) => debug!("invalid state update: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("state WebSocket closed");
}

async fn logging_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    tracing::info!(
        "{} {} from {} - {:.1}ms",
        method,
        uri.path(),
        addr.ip(),
        elapsed.as_secs_f64() * 1000.0
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/video", get(video_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/state", get(get_state_endpoint).post(update_state_endpoint))
        .route("/ws/state", get(ws_state_endpoint))
        .with_state(state)
        .layer(middleware::from_fn(logging_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_window_average() {
        let mut window = SlidingWindow::new(3);
        assert!(window.is_empty());
        assert_eq!(window.average(), 0.0);

        window.push(10.0);
        window.push(20.0);
        assert_eq!(window.average(), 15.0);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_sliding_window_evicts_oldest() {
        let mut window = SlidingWindow::new(2);
        window.push(1.0);
        window.push(2.0);
        window.push(3.0);
        assert_eq!(window.len(), 2);
        assert_eq!(window.average(), 2.5);
    }

    #[test]
    fn test_index_page_template_has_placeholders() {
        assert!(INDEX_HTML.contains("{camera}"));
        assert!(INDEX_HTML.contains("/video"));
        assert!(INDEX_HTML.contains("/ws/state"));
    }
}
