//! camshare demo: stream video for a few seconds, then grab one still

use std::path::PathBuf;
use std::time::{Duration, Instant};

use camshare::{Config, CoordinatorFactory};
use color_eyre::Result;
use tracing::{info, warn};

const STREAM_FOR: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camshare=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camshare launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    let still_format = config.still.format;

    let factory = CoordinatorFactory::new(config);
    let camera = factory.get_or_start()?;
    camera.ready().await?;

    tokio::select! {
        result = run(&camera, still_format) => result?,
        _ = tokio::signal::ctrl_c() => warn!("Interrupted"),
    }

    camera.shutdown();
    camera.wait_stopped().await;
    info!("camshare shutting down: {:?}", camera.stats());
    Ok(())
}

async fn run(camera: &camshare::CaptureCoordinator, format: camshare::ImageFormat) -> Result<()> {
    let mut reader = camera.video_reader();
    let started = Instant::now();
    while started.elapsed() < STREAM_FOR {
        let frame = reader.next_versioned().await?;
        info!(
            "Video frame v{}: {} bytes",
            frame.version,
            frame.frame.len()
        );
    }

    let still = camera.get_image_frame().await?;
    let path = PathBuf::from(format!("still.{}", format.extension()));
    tokio::task::spawn_blocking({
        let path = path.clone();
        move || std::fs::write(path, &still.data)
    })
    .await??;
    info!("Still written to {}", path.display());
    Ok(())
}
