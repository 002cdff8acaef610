use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use facecap_core::SessionStatus;
use facecap_hw::{preview_image, Camera, CaptureDevice, PassthroughEncoder, V4lDevice};
use facecap_session::{Config, HttpRegistrationClient, SessionController, SessionView};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facecap", about = "Guided face registration capture")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/facecap/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DeviceArgs {
    /// V4L2 device path
    #[arg(short, long)]
    device: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a guided capture and register it for a subject
    Register {
        /// Identifier the video is registered against
        subject: String,
        #[command(flatten)]
        device: DeviceArgs,
        /// Registration server base URL
        #[arg(long)]
        server: Option<String>,
        /// Milliseconds between guidance steps
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Overall upload timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Wait for Enter before recording
        #[arg(long)]
        manual: bool,
        /// Print the server's JSON reply
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Devices,
    /// Save one mirrored preview frame
    Preview {
        #[command(flatten)]
        device: DeviceArgs,
        /// Output image (format from extension)
        #[arg(short, long)]
        output: PathBuf,
        /// Frames to discard while exposure settles
        #[arg(long, default_value_t = 4)]
        skip: usize,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(cli));
    // stdin reads park a blocking thread that never returns on its own.
    runtime.shutdown_timeout(Duration::from_millis(200));
    result
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy().into_owned();
            Config::load_with(|key| match key {
                "FACECAP_CONFIG" => Some(path.clone()),
                _ => std::env::var(key).ok(),
            })?
        }
        None => Config::load()?,
    };

    match cli.command {
        Commands::Register {
            subject,
            device,
            server,
            interval_ms,
            timeout_secs,
            manual,
            json,
        } => {
            if let Some(device) = device.device {
                config.camera_device = device;
            }
            if let Some(server) = server {
                config.server_url = server;
            }
            if let Some(ms) = interval_ms {
                config.step_interval_ms = ms;
            }
            if timeout_secs.is_some() {
                config.upload_timeout_secs = timeout_secs;
            }
            if manual {
                config.auto_start = false;
            }
            register(&config, subject, json).await
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}\t{} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Preview {
            device,
            output,
            skip,
        } => {
            if let Some(device) = device.device {
                config.camera_device = device;
            }
            preview(&config, &output, skip).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn register(config: &Config, subject: String, json: bool) -> Result<ExitCode> {
    let client = HttpRegistrationClient::new(
        config.server_url.clone(),
        config.register_path.clone(),
        config.upload_timeout(),
    )
    .context("failed to build HTTP client")?;
    let device = V4lDevice::new(config.camera_device.clone(), config.format_request());
    let options = config.session_options();
    let steps = options.sequence.len();

    let mut controller = SessionController::new(
        subject,
        options,
        Box::new(device),
        Arc::new(PassthroughEncoder),
        Arc::new(client),
    );
    tracing::info!(session = %controller.session().id, device = %config.camera_device, "starting capture");

    let printer = tokio::spawn(render(controller.subscribe(), config.auto_start, steps));
    let token = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let result = controller.run_with_trigger(wait_for_enter()).await;
    drop(controller);
    let _ = printer.await;

    match result {
        Ok(reply) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&reply.body)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::debug!(error = %e, "capture session failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn wait_for_enter() {
    let mut line = String::new();
    if let Err(e) = BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
        tracing::warn!(error = %e, "failed to read stdin; starting anyway");
    }
}

/// Print status changes and guidance instructions until the session is gone.
async fn render(mut view: watch::Receiver<SessionView>, auto_start: bool, steps: usize) {
    let mut last_status = SessionStatus::Idle;
    let mut last_step = None;

    while view.changed().await.is_ok() {
        let current = view.borrow_and_update().clone();

        if current.status != last_status {
            match current.status {
                SessionStatus::CameraReady if !auto_start => {
                    println!("Camera ready. Press Enter to start recording.")
                }
                SessionStatus::CameraReady => println!("Camera ready."),
                SessionStatus::Recording => println!("Recording. Follow the instructions."),
                SessionStatus::Uploading => println!("Uploading video..."),
                SessionStatus::Done => {
                    println!("Registered: {}", current.message.as_deref().unwrap_or("ok"))
                }
                SessionStatus::Error => eprintln!(
                    "{}",
                    current.message.as_deref().unwrap_or("Capture failed")
                ),
                SessionStatus::Idle => {}
            }
            last_status = current.status;
        }

        if current.step_index != last_step {
            if let (Some(index), Some(step)) = (current.step_index, &current.step) {
                println!("  [{}/{}] {}", index + 1, steps, step.instruction);
            }
            last_step = current.step_index;
        }
    }
}

async fn preview(config: &Config, output: &Path, skip: usize) -> Result<()> {
    let mut device = V4lDevice::new(config.camera_device.clone(), config.format_request());
    let stream = device.acquire().await?;
    let mut frames = stream.subscribe();

    let first = tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = 0;
        loop {
            match frames.recv().await {
                Ok(frame) if seen >= skip => return Ok(frame),
                Ok(_) => seen += 1,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(anyhow!("camera stream ended")),
            }
        }
    })
    .await;
    device.release();

    let frame = first.context("timed out waiting for a camera frame")??;
    let image: image::RgbImage = preview_image(&frame)?;
    image
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Saved {}x{} preview to {}",
        image.width(),
        image.height(),
        output.display()
    );
    Ok(())
}
