//! Prism Probe — exercises the transport against a live render server.
//!
//! `stream` sizes a camera, streams a render loop and writes the first
//! frames to disk. `call` runs one command over HTTP or WebSocket and
//! prints its result as JSON.

mod frames;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};

use prism_core::{Command, CommandError, State, Value};
use prism_transport::{
    ClientConfig, CommandQueue, HttpConnector, TransportError, Viewer, ViewerConfig, WsConnector,
};

#[derive(Debug, Parser)]
#[command(name = "prism-probe", about = "Probe a Prism render server")]
struct Cli {
    /// JSON client config; PRISM_BASE_URL / PRISM_WS_URL override its URLs
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Stream a render loop and save frames
    Stream {
        #[arg(long)]
        render_loop: String,
        #[arg(long, default_value = "default_camera")]
        camera: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Frames to receive before stopping
        #[arg(long, default_value_t = 10)]
        frames: u64,
        #[arg(long, default_value = "frames")]
        out: PathBuf,
    },
    /// Run one command and print the result
    Call {
        name: String,
        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        /// Send over the streaming connection instead of HTTP
        #[arg(long)]
        ws: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ClientConfig, TransportError> {
    let config = match path {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    Ok(config.with_env())
}

fn parse_command(name: &str, params: &str) -> Result<Command, TransportError> {
    let json: serde_json::Value = serde_json::from_str(params)?;
    match Value::from(json) {
        Value::Map(params) => Ok(Command::with_params(name, params)),
        other => Err(CommandError::encode(format!("params must be an object, got {}", other.kind())).into()),
    }
}

async fn stream(
    config: &ClientConfig,
    viewer_config: ViewerConfig,
    width: u32,
    height: u32,
    frames: u64,
    out: PathBuf,
) -> Result<(), TransportError> {
    std::fs::create_dir_all(&out)?;
    let connector = WsConnector::connect(config).await?;
    let viewer = Viewer::new(connector.clone(), viewer_config);
    let mut arrivals = viewer.arrivals();

    viewer.start(Arc::new(frames::FrameWriter::new(out.clone())), width, height).await?;
    info!("streaming {frames} frames into {}", out.display());

    let last = arrivals
        .wait_for(|arrival| arrival.count >= frames)
        .await
        .map_err(|_| TransportError::ConnectionClosed)?
        .clone();
    info!("last frame {} statistics: {:?}", last.image_id, last.statistics);

    viewer.stop().await?;
    connector.close().await;
    Ok(())
}

async fn call(config: &ClientConfig, command: Command, ws: bool) -> Result<(), TransportError> {
    let session = State::session().into_ref();
    let queue = if ws {
        CommandQueue::spawn(WsConnector::connect(config).await?, session)
    } else {
        CommandQueue::spawn(HttpConnector::new(config)?, session)
    };
    let outcome = queue.call(command, None).await;
    queue.shutdown().await;

    let value = outcome?;
    let json = value
        .to_json()
        .map_err(|e| CommandError::encode(e.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), TransportError> {
    let config = load_config(cli.config.as_ref())?;
    match cli.action {
        Action::Stream {
            render_loop,
            camera,
            width,
            height,
            frames,
            out,
        } => {
            let viewer_config = ViewerConfig {
                render_loop_name: render_loop,
                camera_name: camera,
            };
            stream(&config, viewer_config, width, height, frames, out).await
        }
        Action::Call { name, params, ws } => call(&config, parse_command(&name, &params)?, ws).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
