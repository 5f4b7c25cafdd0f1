use clap::{Parser, ValueEnum};
use picam_server::camera::{CaptureConfig, StillCommandSource, VideoPipeSource};
use picam_server::server::{run_server, ServerArgs};
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureMode {
    /// Long-lived rpicam-vid process producing an MJPEG pipe
    Pipe,
    /// One libcamera-still invocation per frame
    Still,
}

#[derive(Parser, Debug)]
#[command(
    name = "picam_serve",
    about = "MJPEG web streaming server for a Raspberry Pi camera",
    long_about = "Serves a live camera feed at /video as multipart/x-mixed-replace \
        and a control page at /. Device state is pushed to clients over the \
        /ws/state WebSocket channel."
)]
struct Args {
    #[command(flatten)]
    server: ServerArgs,

    /// Capture strategy.
    #[arg(long, value_enum, default_value_t = CaptureMode::Pipe)]
    capture: CaptureMode,

    /// Frame width in pixels.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Capture frame rate (pipe mode only).
    #[arg(long, default_value_t = 30)]
    framerate: u32,

    /// Override the capture executable name.
    #[arg(long)]
    camera_cmd: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = CaptureConfig {
        width: args.width,
        height: args.height,
        framerate: args.framerate,
        command: args.camera_cmd.clone(),
    };

    match args.capture {
        CaptureMode::Pipe => {
            let (source, camera) = VideoPipeSource::spawn(&config)
                .map_err(|e| anyhow::anyhow!("Failed to start camera: {e}"))?;
            run_server(source, &config, args.server, Some(camera)).await
        }
        CaptureMode::Still => {
            let source = StillCommandSource::new(&config);
            run_server(source, &config, args.server, None).await
        }
    }
}
