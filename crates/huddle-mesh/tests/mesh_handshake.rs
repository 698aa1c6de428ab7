use huddle_mesh::loopback::{LoopbackFactory, LoopbackMedia};
use huddle_mesh::{
    Command, ConnectionManager, ManagerEvent, ManagerHandle, MediaRequest, PeerPhase,
    SignalingClient,
};
use huddle_proto::MediaKind;
use huddle_signal::{config::Config, hub::SignalingHub};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

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

struct Client {
    handle: ManagerHandle,
    events: mpsc::UnboundedReceiver<ManagerEvent>,
    factory: Arc<LoopbackFactory>,
    _signaling: SignalingClient,
}

impl Client {
    async fn start(addr: SocketAddr, label: &str) -> Self {
        let factory = Arc::new(LoopbackFactory::new(label));
        let media = Arc::new(LoopbackMedia::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (manager, events) = ConnectionManager::new(factory.clone(), media, outbound_tx);
        let handle = manager.handle();
        let signaling = SignalingClient::connect(
            &format!("ws://{addr}/ws"),
            outbound_rx,
            handle.input_sender(),
            Duration::from_secs(30),
        )
        .await
        .expect("signaling connect");
        tokio::spawn(manager.run());
        Self {
            handle,
            events,
            factory,
            _signaling: signaling,
        }
    }

    async fn join(&mut self, room_id: &str, name: &str) -> String {
        self.handle
            .command(Command::AcquireMedia(MediaRequest::default()))
            .expect("acquire media");
        self.handle
            .command(Command::Join {
                room_id: room_id.into(),
                display_name: name.into(),
                avatar_url: None,
            })
            .expect("join");
        self.wait_for(|event| match event {
            ManagerEvent::Joined { participant_id, .. } => Some(participant_id.clone()),
            _ => None,
        })
        .await
    }

    async fn wait_for<T>(&mut self, mut pick: impl FnMut(&ManagerEvent) -> Option<T>) -> T {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("manager running");
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for manager event")
    }

    async fn wait_connected_and_streaming(&mut self, remote: &str) {
        let mut connected = false;
        let mut stream = None;
        while !connected || stream.is_none() {
            let (phase, found) = self
                .wait_for(|event| match event {
                    ManagerEvent::ConnectionStateChanged { remote_id, phase } if remote_id == remote => {
                        Some((Some(*phase), None))
                    }
                    ManagerEvent::RemoteStream { remote_id, stream } if remote_id == remote => {
                        Some((None, Some(stream.clone())))
                    }
                    _ => None,
                })
                .await;
            connected |= phase == Some(PeerPhase::Connected);
            if found.is_some() {
                stream = found;
            }
        }
        let Some(stream) = stream else {
            return;
        };
        // Tracks of one description land together but are applied one by one.
        timeout(Duration::from_secs(5), async {
            while !(stream.has_live(MediaKind::Audio) && stream.has_live(MediaKind::Video)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("both remote tracks live");
    }
}

#[test_timeout::tokio_timeout_test]
async fn two_clients_build_a_mesh_through_the_server() {
    let addr = start_server().await;
    let mut alice = Client::start(addr, "alice").await;
    let mut bob = Client::start(addr, "bob").await;

    let alice_id = alice.join("R1", "Alice").await;
    let bob_id = bob.join("R1", "Bob").await;

    alice.wait_connected_and_streaming(&bob_id).await;
    bob.wait_connected_and_streaming(&alice_id).await;

    // Exactly one side initiated, so each side holds a single link.
    assert_eq!(alice.factory.created(), 1);
    assert_eq!(bob.factory.created(), 1);
    let (initiator, answerer) = if alice_id < bob_id {
        (&alice, &bob_id)
    } else {
        (&bob, &alice_id)
    };
    assert_eq!(
        initiator
            .factory
            .link(answerer)
            .expect("initiator link")
            .offers(),
        1
    );
}

#[test_timeout::tokio_timeout_test]
async fn leaving_tears_down_the_remote_side() {
    let addr = start_server().await;
    let mut alice = Client::start(addr, "alice").await;
    let mut bob = Client::start(addr, "bob").await;

    let alice_id = alice.join("R2", "Alice").await;
    let bob_id = bob.join("R2", "Bob").await;
    bob.wait_connected_and_streaming(&alice_id).await;

    alice.handle.command(Command::Leave).expect("leave");
    let departed = bob
        .wait_for(|event| match event {
            ManagerEvent::ParticipantLeft(id) => Some(id.clone()),
            _ => None,
        })
        .await;
    assert_eq!(departed, alice_id);
    assert!(bob.factory.link(&alice_id).expect("link").is_closed());
    assert!(alice.factory.link(&bob_id).expect("link").is_closed());
}

#[test_timeout::tokio_timeout_test]
async fn chat_reaches_every_participant() {
    let addr = start_server().await;
    let mut alice = Client::start(addr, "alice").await;
    let mut bob = Client::start(addr, "bob").await;

    alice.join("R3", "Alice").await;
    bob.join("R3", "Bob").await;

    bob.handle
        .command(Command::SendChat("  hello mesh ".into()))
        .expect("chat");
    for client in [&mut alice, &mut bob] {
        let text = client
            .wait_for(|event| match event {
                ManagerEvent::ChatMessage(message) => Some(message.text.clone()),
                _ => None,
            })
            .await;
        assert_eq!(text, "hello mesh");
    }
}
