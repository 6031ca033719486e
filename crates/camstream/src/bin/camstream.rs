//! camstream command line
//!
//! # Usage
//!
//! ```bash
//! # Grab one JPEG
//! camstream --camera SERIAL --location LOC --token "$TOKEN" \
//!   snapshot --width 640 --height 360 --out snap.jpg
//!
//! # Stream SRTP to a controller until Ctrl+C
//! camstream --camera SERIAL --location LOC --provider kvs \
//!   stream --target 192.168.1.20 --video-port 5000 \
//!   --srtp "$(head -c 30 /dev/urandom | base64)"
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use camstream::session::{SRTP_KEY_LEN, SRTP_SALT_LEN};
use camstream::{
    CameraDescriptor, EngineConfig, MediaEndpoint, PrepareRequest, StaticToken, StreamRequest,
    StreamingEngine, VideoRequest,
};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Camera streaming session engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration (TOML)
    #[arg(long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Platform API base URL (overrides the config file)
    #[arg(long, env = "CAMSTREAM_API_BASE")]
    api_base: Option<String>,

    /// Bearer token for the platform API
    #[arg(long, env = "CAMSTREAM_TOKEN", hide_env_values = true)]
    token: String,

    /// Camera serial
    #[arg(long)]
    camera: String,

    /// Location identifier
    #[arg(long)]
    location: String,

    /// Provider reported by the platform: kvs, livekit, anything else is direct
    #[arg(long, default_value = "kvs")]
    provider: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture one JPEG
    Snapshot {
        #[arg(long, default_value_t = 640)]
        width: u32,

        #[arg(long, default_value_t = 360)]
        height: u32,

        #[arg(long, default_value = "snapshot.jpg")]
        out: PathBuf,
    },

    /// Prepare and start one SRTP session, run until Ctrl+C
    Stream {
        /// Controller address receiving SRTP
        #[arg(long)]
        target: IpAddr,

        #[arg(long, default_value_t = 5000)]
        video_port: u16,

        /// Base64 of the 16-byte SRTP key followed by the 14-byte salt
        #[arg(long)]
        srtp: String,

        #[arg(long, default_value_t = 1280)]
        width: u32,

        #[arg(long, default_value_t = 720)]
        height: u32,

        #[arg(long, default_value_t = 30)]
        fps: u32,

        /// Maximum video bitrate in kbps
        #[arg(long, default_value_t = 1000)]
        bitrate: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("\nCtrl+C received, stopping...");
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("camstream-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(api_base) = &args.api_base {
        config.api_base_url = api_base.clone();
    }

    info!(
        version = camstream::VERSION,
        camera = %args.camera,
        provider = %args.provider,
        "camstream starting"
    );

    let camera = CameraDescriptor::new(&args.camera, &args.location, &args.provider);
    let engine = StreamingEngine::new(camera, config, Arc::new(StaticToken::new(&args.token)))?;

    match args.command {
        Command::Snapshot { width, height, out } => {
            let image = engine.snapshot(width, height).await;
            tokio::fs::write(&out, &image).await?;
            info!("Wrote {} bytes to {}", image.len(), out.display());
        }
        Command::Stream {
            target,
            video_port,
            srtp,
            width,
            height,
            fps,
            bitrate,
        } => {
            let (srtp_key, srtp_salt) = parse_srtp(&srtp)?;
            let session_id = uuid::Uuid::new_v4().to_string();

            let prepared = engine
                .prepare(
                    &session_id,
                    PrepareRequest {
                        target_address: target,
                        video: MediaEndpoint {
                            port: video_port,
                            srtp_key,
                            srtp_salt,
                        },
                        audio: None,
                    },
                )
                .await?;
            info!(
                "Session {} prepared: {} -> {}:{} ssrc {}",
                session_id, prepared.address, target, prepared.video.port, prepared.video.ssrc
            );

            let request = StreamRequest {
                video: VideoRequest {
                    width,
                    height,
                    fps,
                    max_bitrate_kbps: bitrate,
                    ..Default::default()
                },
                audio: None,
            };

            // Ctrl+C during start cancels it; start then settles as stopped
            let stopper = {
                let engine = engine.clone();
                let flag = Arc::clone(&shutdown_flag);
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    wait_for_shutdown(&flag).await;
                    engine.stop(&session_id).await;
                })
            };

            match engine.start(&session_id, request).await {
                Ok(()) => {}
                Err(camstream::Error::SessionStopped(_)) if shutdown_flag.load(Ordering::SeqCst) => {
                    let _ = stopper.await;
                    return Ok(());
                }
                Err(e) => {
                    stopper.abort();
                    return Err(e.into());
                }
            }
            info!("Streaming; press Ctrl+C to stop");

            while engine.session(&session_id).is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }

            if shutdown_flag.load(Ordering::SeqCst) {
                let _ = stopper.await;
            } else {
                warn!("Session {} ended on its own", session_id);
                stopper.abort();
            }
            info!("Stopped");
        }
    }

    Ok(())
}

async fn wait_for_shutdown(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn parse_srtp(value: &str) -> Result<(Vec<u8>, Vec<u8>), String> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| format!("--srtp is not base64: {}", e))?;
    if bytes.len() != SRTP_KEY_LEN + SRTP_SALT_LEN {
        return Err(format!(
            "--srtp must decode to {} bytes (key + salt), got {}",
            SRTP_KEY_LEN + SRTP_SALT_LEN,
            bytes.len()
        ));
    }
    let (key, salt) = bytes.split_at(SRTP_KEY_LEN);
    Ok((key.to_vec(), salt.to_vec()))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
