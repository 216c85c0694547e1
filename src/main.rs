// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! nvr-pipeline — single-host NVR pipeline engine
//!
//! Usage:
//!   nvr-pipeline run   --config config.toml
//!   nvr-pipeline probe --config config.toml

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nvr_pipeline::config::Config;
use nvr_pipeline::decoder;
use nvr_pipeline::engine::CameraEngine;

#[derive(Parser)]
#[command(name = "nvr-pipeline", about = "Single-host NVR pipeline engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect every enabled camera and run until Ctrl+C.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run the decoder/sink probe for every enabled camera and print the choice.
    Probe {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = gstreamer::init() {
        error!(error = %e, "gstreamer::init failed");
        std::process::exit(1);
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Probe { config } => probe(config),
    }
}

async fn run(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(cameras = cfg.cameras.len(), root = ?cfg.storage.root, "starting nvr-pipeline");

    let mut engines: Vec<Arc<CameraEngine>> = Vec::new();
    for cam in cfg.cameras.iter().filter(|c| c.enabled) {
        let engine = CameraEngine::new(cam.clone(), cfg.storage.clone(), &cfg.decoder_preference);
        engine.events().register_connection_observer(Box::new(|id, connected| {
            info!(camera = id, connected, "connection state changed");
        }));
        engine.events().register_recording_observer(Box::new(|id, recording| {
            info!(camera = id, recording, "recording state changed");
        }));
        if let Err(e) = engine.connect() {
            error!(camera = cam.id, error = %e, "failed to connect camera");
        }
        engines.push(engine);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    for engine in &engines {
        engine.disconnect();
    }
}

fn probe(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(e) = gstreamer::init() {
        error!(error = %e, "gstreamer::init failed");
        std::process::exit(1);
    }

    for cam in &cfg.cameras {
        let prefs = cam.decoder_preference.clone().unwrap_or_else(|| cfg.decoder_preference.clone());
        match decoder::probe_decoder(&prefs) {
            Ok(choice) => println!(
                "{}: decoder={} hardware_backed={}",
                cam.id, choice.factory_name, choice.hardware_backed
            ),
            Err(e) => println!("{}: decoder probe failed: {e}", cam.id),
        }
    }

    match decoder::probe_video_sink() {
        Ok(sink) => println!("video sink: {sink}"),
        Err(e) => println!("video sink probe failed: {e}"),
    }
}
