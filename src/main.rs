// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shuttle tracker command-line client.
//!
//! `publish` streams this machine's gpsd position to the tracking server.
//! `track` follows the server's vehicle feed and logs marker changes.

mod config;
mod map;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use config::AppConfig;
use fusion_client::{
    Fleet, GpsdSource, LocationPublisher, MonotonicClock, ReconnectingSocket, RetryPolicy,
    SocketConfig,
};
use map::LoggingMap;

/// How often the running commands log a summary
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "shuttle-tracker")]
#[command(about = "Publish and follow live shuttle positions", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Tracking server page URL, overriding the configured one
    #[arg(long, global = true)]
    server_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish this device's gpsd position to the server
    Publish {
        /// Publishing socket URL (derived from the server URL if omitted)
        #[arg(long)]
        socket_url: Option<String>,

        /// gpsd address in host:port format
        #[arg(long)]
        gpsd: Option<String>,
    },
    /// Follow the server's vehicle feed
    Track {
        /// Vehicle feed socket URL (derived from the server URL if omitted)
        #[arg(long)]
        feed_url: Option<String>,
    },
    /// Print the configuration file location
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = AppConfig::load()?;
    if let Some(server_url) = cli.server_url {
        config.server_url = server_url;
    }

    match cli.command {
        Command::Publish { socket_url, gpsd } => {
            if socket_url.is_some() {
                config.socket_url = socket_url;
            }
            if let Some(gpsd) = gpsd {
                config.gpsd_address = gpsd;
            }
            publish(&config).await
        }
        Command::Track { feed_url } => {
            if feed_url.is_some() {
                config.feed_url = feed_url;
            }
            track(&config).await
        }
        Command::ConfigPath => {
            println!("{}", AppConfig::get_config_path()?.display());
            Ok(())
        }
    }
}

fn socket(config: &AppConfig, url: String) -> ReconnectingSocket {
    ReconnectingSocket::new(SocketConfig {
        url,
        retry: RetryPolicy::from(&config.retry),
        ..Default::default()
    })
}

async fn publish(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let url = config.publish_url()?;
    info!("Publishing gpsd at {} to {url}", config.gpsd_address);

    let source = Arc::new(GpsdSource::new(config.gpsd_address.clone()));
    let publisher = LocationPublisher::new(socket(config, url), source);
    info!("Session {}", publisher.session_id());
    publisher.start().await?;

    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    summary.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = summary.tick() => {
                let stats = publisher.stats();
                info!(
                    "Published {} fixes ({} dropped, {} rejected, {} failed)",
                    stats.sent, stats.dropped, stats.rejected, stats.failed_fixes
                );
            }
        }
    }

    info!("Shutting down");
    publisher.stop();
    Ok(())
}

async fn track(config: &AppConfig) -> Result<(), Box<dyn Error>> {
    let url = config.updates_url()?;
    info!("Following vehicle feed at {url}");

    let map = Arc::new(LoggingMap::new());
    let fleet = Arc::new(Fleet::new(map.clone(), Arc::new(MonotonicClock::new())));
    for route in &config.routes {
        fleet.add_route(route.clone());
    }

    let socket = socket(config, url);
    let cancel = CancellationToken::new();
    let feed = Arc::clone(&fleet).run(&socket, cancel.clone());
    socket.open();

    let mut summary = tokio::time::interval(SUMMARY_INTERVAL);
    summary.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = summary.tick() => {
                info!(
                    "Tracking {} vehicles, {} on the map",
                    fleet.len(),
                    map.shown()
                );
            }
        }
    }

    info!("Shutting down");
    cancel.cancel();
    socket.shutdown();
    if let Err(e) = feed.await {
        warn!("Vehicle feed task failed: {e}");
    }
    Ok(())
}
