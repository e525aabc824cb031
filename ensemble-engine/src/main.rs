//! # Ensemble (ensemble)
//!
//! CLI front-end for the playback engine: load files, play them
//! synchronized, optionally act as sync leader (`--serve`) or follower
//! (`--follow`).

use anyhow::Result;
use clap::Parser;
use ensemble_common::config::Settings;
use ensemble_common::{ClockMode, EngineParams, EventBus};
use ensemble_engine::audio::{backend::list_output_devices, CpalBackend};
use ensemble_engine::Transport;
use ensemble_sync::{
    ClientEvent, NetworkTimeProvider, SyncClient, SyncClientConfig, SyncServer, SyncServerConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ensemble")]
#[command(about = "Ensemble - synchronized multi-track audio playback")]
#[command(version)]
struct Args {
    /// Audio files to play as synchronized tracks
    files: Vec<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output device name (default device when omitted)
    #[arg(short, long)]
    device: Option<String>,

    /// Sample rate override
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Act as sync leader on the configured UDP port
    #[arg(long)]
    serve: bool,

    /// Follow a sync leader at this address (host:port)
    #[arg(long)]
    follow: Option<SocketAddr>,

    /// Sync UDP port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Master volume, 0.0 - 1.0
    #[arg(long, default_value_t = 1.0)]
    volume: f32,

    /// Initial tempo in percent
    #[arg(long, default_value_t = 100.0)]
    tempo: f32,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ensemble=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in list_output_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    if args.files.is_empty() {
        anyhow::bail!("no input files (try --help)");
    }

    let settings = Settings::load(args.config.as_deref(), args.sample_rate, args.port)?;
    info!(
        "engine config: {} Hz, {} ch, {} frames/buffer",
        settings.audio.sample_rate, settings.audio.channels, settings.audio.buffer_size_frames
    );

    let events = Arc::new(EventBus::new(256));
    let backend = CpalBackend::new(&settings.audio, args.device.clone(), Arc::clone(&events));
    let transport = Transport::new(
        settings.audio,
        EngineParams::default(),
        Box::new(backend),
        Arc::clone(&events),
    );

    for path in &args.files {
        match transport.add_track(path).await {
            Ok(id) => info!("track {} <- {}", id, path.display()),
            Err(e) => {
                error!("failed to load {}: {}", path.display(), e);
            }
        }
    }
    if transport.track_ids().await.is_empty() {
        anyhow::bail!("no playable tracks");
    }

    transport.set_master_volume(args.volume);
    if (args.tempo - 100.0).abs() > f32::EPSILON {
        let applied = transport.set_tempo_percent(args.tempo, true).await;
        info!("tempo set to {:.1}%", applied);
    }

    // Optional sync roles
    let mut server = None;
    let mut client = None;

    if args.serve {
        transport.clock().set_mode(ClockMode::NetworkServer);
        let mut provider = NetworkTimeProvider::new();
        provider.sync(None).await;
        let sync_server = SyncServer::start(
            SyncServerConfig {
                port: settings.sync_port,
            },
            Arc::clone(transport.clock()),
            provider,
        )
        .await?;
        info!("serving sync on {}", sync_server.local_addr()?);
        server = Some(sync_server);
    }

    if let Some(addr) = args.follow {
        transport.clock().set_mode(ClockMode::NetworkClient);
        let mut config = SyncClientConfig::new(addr);
        config.allow_offline_playback = settings.allow_offline_playback;
        let (sync_client, mut client_events) =
            SyncClient::start(config, Arc::clone(transport.clock())).await?;

        // Relay leader commands into the transport
        let relay_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(event) = client_events.recv().await {
                let result = match event {
                    ClientEvent::Play => relay_transport.play().await,
                    ClientEvent::Pause => relay_transport.pause().await,
                    ClientEvent::Stop => relay_transport.stop().await,
                    ClientEvent::Seek(seconds) => relay_transport.seek(seconds).await,
                    ClientEvent::Tempo { value, smooth } => {
                        relay_transport
                            .set_tempo_percent(value * 100.0, smooth)
                            .await;
                        Ok(())
                    }
                    ClientEvent::ConnectionChanged(state) => {
                        relay_transport
                            .shared_state()
                            .set_connection_state(state)
                            .await;
                        info!("sync connection: {:?}", state);
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!("sync command failed: {}", e);
                }
            }
        });
        client = Some(sync_client);
    }

    // Followers wait for the leader's Play; everyone else starts now.
    if args.follow.is_none() {
        transport.play().await?;
    }

    let total = transport.total_duration_seconds().await;
    info!("playing {} track(s), {:.1}s", args.files.len(), total);

    let mut status = tokio::time::interval(std::time::Duration::from_secs(5));
    status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = status.tick() => {
                let position = transport.position_seconds().await;
                let dropouts = transport.shared_state().dropout_count();
                info!("position {:.1}s / {:.1}s ({} dropouts)", position, total, dropouts);

                if args.follow.is_none() && total > 0.0 && position >= total {
                    info!("end of material");
                    break;
                }
            }
        }
    }

    if let Some(mut sync_client) = client.take() {
        sync_client.stop();
    }
    if let Some(mut sync_server) = server.take() {
        sync_server.stop();
    }
    transport.shutdown().await?;
    info!("ensemble shutting down");
    Ok(())
}
