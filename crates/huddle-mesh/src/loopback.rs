//! In-memory peer links and capture devices for tests and demos.
//!
//! A loopback link behaves like a peer connection that never touches the
//! network: descriptions carry the ids of the tracks being sent, applying a
//! remote description reports those tracks as remote tracks, and the link
//! reports `Connected` as soon as both descriptions are in place.

use async_trait::async_trait;
use huddle_proto::{IceCandidate, MediaKind, SdpKind, SessionDescription};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::media::{MediaDevices, MediaError, MediaRequest};
use crate::peer::{
    LinkState, PeerError, PeerEventKind, PeerEventSink, PeerFactory, PeerLink, RemoteTrackInfo,
    TrackChange,
};
use crate::track::{LocalStream, LocalTrack, TrackSource};

#[derive(Default)]
struct LinkInner {
    senders: BTreeMap<MediaKind, Option<String>>,
    replace_calls: Vec<(MediaKind, String)>,
    offers: usize,
    ice_restarts: usize,
    local_set: bool,
    remote_offer: bool,
    remote_set: bool,
    awaiting_answer: bool,
    connected: bool,
    closed: bool,
    fail_replacements: bool,
    remote_candidates: Vec<IceCandidate>,
    remote_tracks: BTreeSet<String>,
}

pub struct LoopbackLink {
    label: String,
    sink: PeerEventSink,
    inner: Mutex<LinkInner>,
}

impl LoopbackLink {
    fn new(label: String, sink: PeerEventSink) -> Self {
        Self {
            label,
            sink,
            inner: Mutex::new(LinkInner::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    pub fn sender_count(&self) -> usize {
        self.inner.lock().senders.len()
    }

    pub fn sender_track(&self, kind: MediaKind) -> Option<String> {
        self.inner.lock().senders.get(&kind).cloned().flatten()
    }

    pub fn replace_calls(&self) -> Vec<(MediaKind, String)> {
        self.inner.lock().replace_calls.clone()
    }

    pub fn offers(&self) -> usize {
        self.inner.lock().offers
    }

    pub fn ice_restarts(&self) -> usize {
        self.inner.lock().ice_restarts
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().remote_candidates.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Makes every later `replace_track` fail.
    pub fn fail_replacements(&self) {
        self.inner.lock().fail_replacements = true;
    }

    /// Reports a network failure.
    pub fn fail(&self) {
        self.inner.lock().connected = false;
        self.sink.emit(PeerEventKind::StateChanged(LinkState::Failed));
    }

    pub fn emit_remote_track(&self, stream_id: &str, track_id: &str, kind: MediaKind, change: TrackChange) {
        self.sink.emit(PeerEventKind::RemoteTrack {
            stream_id: stream_id.to_string(),
            track: RemoteTrackInfo {
                id: track_id.to_string(),
                kind,
            },
            change,
        });
    }

    fn describe(&self, kind: SdpKind, senders: &BTreeMap<MediaKind, Option<String>>) -> SessionDescription {
        let mut sdp = format!("v=0\r\ns=loopback {}\r\n", self.label);
        for (media, track_id) in senders {
            let Some(track_id) = track_id else {
                continue;
            };
            sdp.push_str(&format!("a=msid:{} {} {}\r\n", self.label, track_id, media));
        }
        SessionDescription { kind, sdp }
    }

    fn local_candidate(&self, generation: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{generation} 1 udp 2130706431 127.0.0.1 {} typ host",
                40000 + generation
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Reports `Connected` the first time both descriptions are in place.
    fn settle(&self) {
        let newly_connected = {
            let mut inner = self.inner.lock();
            let ready = inner.local_set && inner.remote_set && !inner.awaiting_answer;
            if ready && !inner.connected && !inner.closed {
                inner.connected = true;
                true
            } else {
                false
            }
        };
        if newly_connected {
            self.sink.emit(PeerEventKind::StateChanged(LinkState::Connected));
        }
    }
}

fn parse_tracks(sdp: &str) -> Vec<(String, RemoteTrackInfo)> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=msid:"))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            let stream_id = parts.next()?;
            let track_id = parts.next()?;
            let kind = match parts.next()? {
                "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                _ => return None,
            };
            Some((
                stream_id.to_string(),
                RemoteTrackInfo {
                    id: track_id.to_string(),
                    kind,
                },
            ))
        })
        .collect()
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PeerError::Closed);
        }
        inner.senders.insert(track.kind(), Some(track.id().to_string()));
        Ok(())
    }

    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PeerError::Closed);
        }
        if inner.fail_replacements {
            return Err(PeerError::Backend("replace_track rejected".to_string()));
        }
        let Some(sender) = inner.senders.get_mut(&kind) else {
            return Err(PeerError::NoSender(kind));
        };
        *sender = Some(track.id().to_string());
        inner.replace_calls.push((kind, track.id().to_string()));
        Ok(())
    }

    async fn clear_track(&self, kind: MediaKind) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PeerError::Closed);
        }
        if inner.fail_replacements {
            return Err(PeerError::Backend("replace_track rejected".to_string()));
        }
        let Some(sender) = inner.senders.get_mut(&kind) else {
            return Err(PeerError::NoSender(kind));
        };
        *sender = None;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let (offer, round) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            inner.offers += 1;
            if ice_restart {
                inner.ice_restarts += 1;
                inner.connected = false;
            }
            inner.local_set = true;
            inner.remote_offer = false;
            inner.awaiting_answer = true;
            (self.describe(SdpKind::Offer, &inner.senders), inner.offers)
        };
        self.sink
            .emit(PeerEventKind::LocalCandidate(self.local_candidate(round)));
        self.settle();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            if !inner.remote_offer {
                return Err(PeerError::InvalidDescription(
                    "no remote offer to answer".to_string(),
                ));
            }
            inner.local_set = true;
            self.describe(SdpKind::Answer, &inner.senders)
        };
        self.sink
            .emit(PeerEventKind::LocalCandidate(self.local_candidate(0)));
        self.settle();
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let fresh = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PeerError::Closed);
            }
            inner.remote_set = true;
            inner.remote_offer = description.kind == SdpKind::Offer;
            if description.kind == SdpKind::Answer {
                inner.awaiting_answer = false;
            }
            parse_tracks(&description.sdp)
                .into_iter()
                .filter(|(_, track)| inner.remote_tracks.insert(track.id.clone()))
                .collect::<Vec<_>>()
        };
        for (stream_id, track) in fresh {
            self.sink.emit(PeerEventKind::RemoteTrack {
                stream_id,
                track,
                change: TrackChange::Added,
            });
        }
        self.settle();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        if !inner.remote_set {
            return Err(PeerError::InvalidDescription(
                "remote description not set".to_string(),
            ));
        }
        inner.remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let was_open = {
            let mut inner = self.inner.lock();
            let was_open = !inner.closed;
            inner.closed = true;
            inner.connected = false;
            was_open
        };
        if was_open {
            self.sink.emit(PeerEventKind::StateChanged(LinkState::Closed));
        }
    }
}

/// Hands out [`LoopbackLink`]s and keeps the latest one per remote.
pub struct LoopbackFactory {
    label: String,
    links: Mutex<HashMap<String, Arc<LoopbackLink>>>,
    created: AtomicUsize,
}

impl LoopbackFactory {
    /// `label` names the local side in generated descriptions.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            links: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    pub fn link(&self, remote_id: &str) -> Option<Arc<LoopbackLink>> {
        self.links.lock().get(remote_id).cloned()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn create_link(
        &self,
        remote_id: &str,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let link = Arc::new(LoopbackLink::new(self.label.clone(), sink));
        self.links
            .lock()
            .insert(remote_id.to_string(), Arc::clone(&link));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(link)
    }
}

#[derive(Default)]
struct MediaInner {
    deny_camera: bool,
    deny_microphone: bool,
    deny_screen: bool,
    camera_requests: usize,
    last_screen: Option<LocalTrack>,
}

/// Capture devices that hand out fresh tracks immediately.
#[derive(Default)]
pub struct LoopbackMedia {
    inner: Mutex<MediaInner>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_camera(&self, deny: bool) {
        self.inner.lock().deny_camera = deny;
    }

    pub fn deny_microphone(&self, deny: bool) {
        self.inner.lock().deny_microphone = deny;
    }

    pub fn deny_screen(&self, deny: bool) {
        self.inner.lock().deny_screen = deny;
    }

    pub fn camera_requests(&self) -> usize {
        self.inner.lock().camera_requests
    }

    pub fn last_screen(&self) -> Option<LocalTrack> {
        self.inner.lock().last_screen.clone()
    }
}

#[async_trait]
impl MediaDevices for LoopbackMedia {
    async fn user_media(&self, request: MediaRequest) -> Result<LocalStream, MediaError> {
        let mut inner = self.inner.lock();
        if request.video {
            inner.camera_requests += 1;
            if inner.deny_camera {
                return Err(MediaError::PermissionDenied(TrackSource::Camera));
            }
        }
        if request.audio && inner.deny_microphone {
            return Err(MediaError::PermissionDenied(TrackSource::Microphone));
        }
        let audio = request
            .audio
            .then(|| LocalTrack::new(TrackSource::Microphone, "loopback microphone"));
        let video = request
            .video
            .then(|| LocalTrack::new(TrackSource::Camera, "loopback camera"));
        Ok(LocalStream::new(audio, video))
    }

    async fn display_media(&self) -> Result<LocalTrack, MediaError> {
        let mut inner = self.inner.lock();
        if inner.deny_screen {
            return Err(MediaError::PermissionDenied(TrackSource::Screen));
        }
        let track = LocalTrack::new(TrackSource::Screen, "loopback display");
        inner.last_screen = Some(track.clone());
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerInput;
    use tokio::sync::mpsc;

    fn link_with_events() -> (LoopbackLink, mpsc::UnboundedReceiver<ManagerInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = LoopbackLink::new("alice".into(), PeerEventSink::new("bob", 7, tx));
        (link, rx)
    }

    fn kinds(rx: &mut mpsc::UnboundedReceiver<ManagerInput>) -> Vec<PeerEventKind> {
        let mut out = Vec::new();
        while let Ok(ManagerInput::Peer(event)) = rx.try_recv() {
            assert_eq!(event.generation, 7);
            out.push(event.kind);
        }
        out
    }

    #[test_timeout::tokio_timeout_test]
    async fn descriptions_carry_tracks_and_connect_both_ways() {
        let (offerer, mut offerer_events) = link_with_events();
        let (answerer, mut answerer_events) = link_with_events();
        let camera = LocalTrack::new(TrackSource::Camera, "cam");
        offerer.add_track(&camera).await.expect("add camera");

        let offer = offerer.create_offer(false).await.expect("offer");
        answerer.set_remote_description(offer).await.expect("apply offer");
        let answer = answerer.create_answer().await.expect("answer");
        offerer.set_remote_description(answer).await.expect("apply answer");

        assert!(offerer.is_connected());
        assert!(answerer.is_connected());

        let seen = kinds(&mut answerer_events);
        assert!(seen.contains(&PeerEventKind::RemoteTrack {
            stream_id: "alice".into(),
            track: RemoteTrackInfo {
                id: camera.id().to_string(),
                kind: MediaKind::Video,
            },
            change: TrackChange::Added,
        }));
        assert!(seen.contains(&PeerEventKind::StateChanged(LinkState::Connected)));
        assert!(kinds(&mut offerer_events)
            .iter()
            .any(|kind| matches!(kind, PeerEventKind::LocalCandidate(_))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn replacing_without_a_sender_fails() {
        let (link, _events) = link_with_events();
        let screen = LocalTrack::new(TrackSource::Screen, "display");
        let err = link
            .replace_track(MediaKind::Video, &screen)
            .await
            .expect_err("no sender yet");
        assert!(matches!(err, PeerError::NoSender(MediaKind::Video)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn answering_needs_a_remote_offer() {
        let (link, _events) = link_with_events();
        assert!(link.create_answer().await.is_err());
        assert!(link
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            })
            .await
            .is_err());
    }
}
