use anyhow::{anyhow, Result};
use clap::Parser;
use huddle_mesh::loopback::LoopbackMedia;
use huddle_mesh::{
    Command, ConnectionManager, LocalTrack, ManagerEvent, MediaRequest, MeshConfig,
    RtcPeerFactory, SignalingClient,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use webrtc::media::Sample;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// Joins a room as a full mesh peer with synthetic media and reports what
/// happens to each connection.
#[derive(Parser, Debug)]
#[command(name = "huddle-peer")]
#[command(about = "Headless huddle mesh participant")]
struct Cli {
    /// Room to join
    #[arg(short, long)]
    room: String,

    /// Display name to join with
    #[arg(short, long, default_value = "huddle-peer")]
    name: String,

    /// Signaling endpoint; overrides HUDDLE_SIGNAL_URL
    #[arg(short, long)]
    url: Option<String>,

    /// How long to stay before leaving
    #[arg(short, long, default_value_t = 60)]
    secs: u64,

    /// Join without a camera track
    #[arg(long)]
    no_video: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!("huddle-peer failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = MeshConfig::from_env();
    if let Some(url) = cli.url {
        config.signal_url = url;
    }
    info!(
        signal_url = %config.signal_url,
        ice_servers = ?config.ice_servers,
        "starting huddle peer"
    );

    let factory = Arc::new(RtcPeerFactory::new(config.ice_servers.clone())?);
    let media = Arc::new(LoopbackMedia::new());
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (manager, mut events) = ConnectionManager::new(factory.clone(), media, outbound_tx);
    let handle = manager.handle();
    let signaling = SignalingClient::connect(
        &config.signal_url,
        outbound_rx,
        handle.input_sender(),
        config.heartbeat(),
    )
    .await?;
    let manager_task = tokio::spawn(manager.run());

    handle.command(Command::AcquireMedia(MediaRequest {
        audio: true,
        video: !cli.no_video,
    }))?;
    handle.command(Command::Join {
        room_id: cli.room.clone(),
        display_name: cli.name,
        avatar_url: None,
    })?;

    let mut pumped = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(cli.secs);
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(anyhow!("connection manager stopped")),
            Err(_) => break,
        };
        match event {
            ManagerEvent::Joined {
                room_id,
                participant_id,
                participants,
                ..
            } => println!(
                "joined {room_id} as {participant_id} with {} participant(s)",
                participants.len()
            ),
            ManagerEvent::LocalMedia(stream) => {
                for track in stream.tracks() {
                    if pumped.insert(track.id().to_string()) {
                        pump_samples(factory.clone(), track.clone());
                    }
                }
            }
            ManagerEvent::ConnectionStateChanged { remote_id, phase } => {
                println!("{remote_id}: {phase}")
            }
            ManagerEvent::RemoteStream { remote_id, stream } => {
                println!("{remote_id}: stream {} with {} track(s)", stream.id(), stream.tracks().len())
            }
            ManagerEvent::ChatMessage(message) => {
                println!("[{}] {}", message.sender_name, message.text)
            }
            ManagerEvent::ServerError(message) => {
                eprintln!("server error: {message}");
                if signaling.is_closed() {
                    break;
                }
            }
            other => println!("{other:?}"),
        }
    }

    handle.command(Command::Leave)?;
    handle.command(Command::Shutdown)?;
    let _ = manager_task.await;

    // The writer flushes the leave once the manager is gone; give it a moment.
    let flushed = tokio::time::timeout(Duration::from_secs(2), async {
        while !signaling.is_closed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if flushed.is_err() {
        signaling.close();
    }
    Ok(())
}

/// Feeds empty samples at a steady pace until the track ends; muting only
/// stops them reaching the wire.
fn pump_samples(factory: Arc<RtcPeerFactory>, track: LocalTrack) {
    tokio::spawn(async move {
        let sample = Sample {
            duration: SAMPLE_INTERVAL,
            ..Default::default()
        };
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        let mut sent = 0u64;
        while !track.is_ended() {
            ticker.tick().await;
            match factory.write_sample(&track, &sample).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(err) => {
                    debug!(track_id = %track.id(), error = %err, "sample write failed");
                    break;
                }
            }
        }
        debug!(track_id = %track.id(), sent, "sample pump stopped");
    });
}
