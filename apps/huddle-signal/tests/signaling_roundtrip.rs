use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientMessage, CreateRoomResponse, ErrorBody, HealthStatus, RoomInfo, ServerMessage, SessionDescription};
use huddle_signal::{config::Config, hub::SignalingHub};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn start_server() -> SocketAddr {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let hub = Arc::new(SignalingHub::new(Config::default()));
    tokio::spawn(async move {
        let _ = huddle_signal::serve(listener, hub).await;
    });
    addr
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket handshake");
    socket
}

async fn send(socket: &mut Socket, message: &ClientMessage) {
    let text = serde_json::to_string(message).expect("encode client message");
    socket.send(Message::Text(text.into())).await.expect("send frame");
}

/// Reads frames until one named `name` arrives.
async fn wait_for(socket: &mut Socket, name: &str) -> ServerMessage {
    timeout(Duration::from_secs(5), async {
        loop {
            let frame = socket
                .next()
                .await
                .expect("socket open")
                .expect("frame");
            if let Message::Text(text) = frame {
                let message: ServerMessage = serde_json::from_str(&text).expect("server message");
                if message.name() == name {
                    return message;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

async fn join(socket: &mut Socket, room_id: &str, name: &str) -> String {
    send(
        socket,
        &ClientMessage::JoinRoom {
            room_id: room_id.into(),
            display_name: name.into(),
            avatar_url: None,
        },
    )
    .await;
    match wait_for(socket, "joined-room").await {
        ServerMessage::JoinedRoom { room } => room.participant_id,
        other => panic!("unexpected {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn two_participants_meet_exchange_an_offer_and_leave() {
    let addr = start_server().await;
    let http = reqwest::Client::new();

    let mut a = connect(addr).await;
    let a_id = join(&mut a, "R1", "Ada").await;
    match wait_for(&mut a, "participants-updated").await {
        ServerMessage::ParticipantsUpdated { participants } => {
            assert_eq!(participants.len(), 1);
            assert!(participants[0].is_admin);
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut b = connect(addr).await;
    let b_id = join(&mut b, "R1", "Bob").await;
    for socket in [&mut a, &mut b] {
        match wait_for(socket, "participants-updated").await {
            ServerMessage::ParticipantsUpdated { participants } => {
                let ids: Vec<_> = participants.iter().map(|p| p.id.clone()).collect();
                assert_eq!(ids, [a_id.clone(), b_id.clone()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    send(
        &mut a,
        &ClientMessage::HandshakeOffer {
            target_id: b_id.clone(),
            offer: SessionDescription::offer("v=0"),
        },
    )
    .await;
    match wait_for(&mut b, "handshake-offer").await {
        ServerMessage::HandshakeOffer { sender_id, offer } => {
            assert_eq!(sender_id, a_id);
            assert_eq!(offer.sdp, "v=0");
        }
        other => panic!("unexpected {other:?}"),
    }

    let info: RoomInfo = http
        .get(format!("http://{addr}/api/room/R1"))
        .send()
        .await
        .expect("room lookup")
        .json()
        .await
        .expect("room info");
    assert_eq!(info.participant_count, 2);

    b.close(None).await.expect("close b");
    match wait_for(&mut a, "user-left").await {
        ServerMessage::UserLeft { participant_id } => assert_eq!(participant_id, b_id),
        other => panic!("unexpected {other:?}"),
    }

    send(&mut a, &ClientMessage::LeaveRoom { room_id: "R1".into() }).await;
    wait_for(&mut a, "left-room").await;

    let response = http
        .get(format!("http://{addr}/api/room/R1"))
        .send()
        .await
        .expect("room lookup");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: ErrorBody = response.json().await.expect("error body");
    assert_eq!(body.error, "Room not found");
}

#[test_timeout::tokio_timeout_test]
async fn reserved_rooms_are_visible_and_counted_in_health() {
    let addr = start_server().await;
    let http = reqwest::Client::new();

    let created: CreateRoomResponse = http
        .post(format!("http://{addr}/api/create-room"))
        .send()
        .await
        .expect("create room")
        .json()
        .await
        .expect("create body");
    assert_eq!(created.room_id.len(), 8);

    let info: RoomInfo = http
        .get(format!("http://{addr}/api/room/{}", created.room_id))
        .send()
        .await
        .expect("room lookup")
        .json()
        .await
        .expect("room info");
    assert_eq!(info.participant_count, 0);

    let mut a = connect(addr).await;
    join(&mut a, &created.room_id, "Ada").await;

    let health: HealthStatus = http
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("health body");
    assert_eq!(health.status, "ok");
    assert_eq!(health.active_rooms, 1);
    assert_eq!(health.total_participants, 1);
}

#[test_timeout::tokio_timeout_test]
async fn malformed_frames_get_an_error_reply() {
    let addr = start_server().await;
    let mut a = connect(addr).await;

    a.send(Message::Text("{\"type\":\"warp-drive\"}".to_string().into()))
        .await
        .expect("send frame");
    match wait_for(&mut a, "error").await {
        ServerMessage::Error { message } => assert!(message.starts_with("Invalid message format")),
        other => panic!("unexpected {other:?}"),
    }

    send(&mut a, &ClientMessage::Ping).await;
    wait_for(&mut a, "pong").await;
}
