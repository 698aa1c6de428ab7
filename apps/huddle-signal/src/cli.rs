use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientMessage, ServerMessage};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "huddle-signal")]
#[command(about = "Huddle meeting signaling server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the signaling server (default)
    Serve,

    /// Join a room and print every server event for a while
    Probe {
        /// Signaling endpoint (e.g., ws://localhost:3001/ws)
        #[arg(short, long, default_value = "ws://localhost:3001/ws")]
        url: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// Display name to join with
        #[arg(short, long, default_value = "probe")]
        name: String,

        /// How long to listen before leaving
        #[arg(short, long, default_value_t = 30)]
        secs: u64,
    },
}

pub async fn run_probe(url: String, room: String, name: String, secs: u64) -> Result<()> {
    debug!("Connecting to {} for room {}", url, room);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!(
                "Connection timeout - is the signaling server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let join = ClientMessage::JoinRoom {
        room_id: room.clone(),
        display_name: name,
        avatar_url: None,
    };
    write
        .send(Message::Text(serde_json::to_string(&join)?.into()))
        .await?;

    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Err(anyhow!("Connection closed by server")),
            Err(_) => break,
        };
        let Message::Text(text) = frame else {
            continue;
        };
        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::Error { message }) => eprintln!("server error: {message}"),
            Ok(event) => println!("{}", serde_json::to_string_pretty(&event)?),
            Err(e) => eprintln!("unparsable frame ({e}): {text}"),
        }
    }

    let leave = ClientMessage::LeaveRoom { room_id: room };
    write
        .send(Message::Text(serde_json::to_string(&leave)?.into()))
        .await?;
    let _ = write.close().await;
    Ok(())
}
