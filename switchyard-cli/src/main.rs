#![forbid(unsafe_code)]
#![allow(clippy::print_stdout)]

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use switchyard_channels::{ChannelError, ConfigLoader, LoggingConfig, Socket};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Join a Phoenix channel topic and report the outcome
#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Join a Phoenix channel topic over WebSocket")]
#[command(version)]
struct Cli {
    /// Socket endpoint, e.g. ws://localhost:4000/socket
    #[arg(short, long)]
    url: Option<String>,

    /// Topic to join
    #[arg(short, long, default_value = "agents:lobby")]
    topic: String,

    /// Value of the `token` connect parameter
    #[arg(long)]
    token: Option<String>,

    /// Extra TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level or filter directive
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print inbound events with this name until Ctrl-C (repeatable)
    #[arg(long, value_name = "EVENT")]
    listen: Vec<String>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments first - this will handle --help and --version automatically
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new("switchyard");
    if let Some(ref path) = cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("loading configuration")?;

    if let Some(url) = cli.url {
        config.socket.url = url;
    }
    if let Some(token) = cli.token {
        config.socket.params.insert("token".to_owned(), token);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging);
    debug!(url = %config.socket.url, topic = %cli.topic, "Starting");

    let socket = Socket::new(config.socket).context("creating socket")?;
    if let Err(e) = socket.connect().await {
        println!("Unable to connect: {e}");
        socket.disconnect().await?;
        return Ok(ExitCode::FAILURE);
    }

    let channel = socket.channel(cli.topic.as_str(), json!({})).await?;
    for event in &cli.listen {
        channel.on(event.as_str(), |message| {
            println!("{} {}", message.event, message.payload);
        });
    }

    let code = match channel.join().await {
        Ok(response) => {
            println!("Joined successfully {response}");
            if !cli.listen.is_empty() {
                info!(topic = %cli.topic, events = ?cli.listen, "Listening; press Ctrl-C to stop");
                tokio::signal::ctrl_c()
                    .await
                    .context("waiting for Ctrl-C")?;
            }
            ExitCode::SUCCESS
        }
        Err(ChannelError::Join(reason)) => {
            println!("Unable to join {reason}");
            ExitCode::FAILURE
        }
        Err(e) => {
            println!("Unable to join {e}");
            ExitCode::FAILURE
        }
    };

    socket.disconnect().await?;
    Ok(code)
}
