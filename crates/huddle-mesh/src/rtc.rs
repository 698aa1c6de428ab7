//! Peer links backed by the `webrtc` crate.

use async_trait::async_trait;
use huddle_proto::{IceCandidate, MediaKind, SdpKind, SessionDescription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::peer::{
    LinkState, PeerError, PeerEventKind, PeerEventSink, PeerFactory, PeerLink, RemoteTrackInfo,
    TrackChange,
};
use crate::track::LocalTrack;

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        PeerError::Backend(err.to_string())
    }
}

/// Sample tracks fed by local capture, one per [`LocalTrack`], shared by
/// every link that sends it.
#[derive(Default)]
struct SampleTracks {
    stream_id: String,
    tracks: Mutex<HashMap<String, (LocalTrack, Arc<TrackLocalStaticSample>)>>,
}

impl SampleTracks {
    fn get_or_create(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        tracks.retain(|_, (local, _)| !local.is_ended());
        let (_, sample) = tracks.entry(track.id().to_string()).or_insert_with(|| {
            let capability = match track.kind() {
                MediaKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                MediaKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            };
            let sample = Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id().to_string(),
                self.stream_id.clone(),
            ));
            (track.clone(), sample)
        });
        Arc::clone(sample)
    }
}

pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
    samples: Arc<SampleTracks>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            samples: Arc::new(SampleTracks {
                stream_id: Uuid::new_v4().to_string(),
                tracks: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        self.samples.get_or_create(track)
    }

    /// Sends one captured sample of `track` to every link carrying it.
    /// Samples of a disabled or ended track are dropped; returns whether
    /// the sample went out.
    pub async fn write_sample(&self, track: &LocalTrack, sample: &Sample) -> Result<bool, PeerError> {
        if !track.is_enabled() || track.is_ended() {
            trace!(track_id = %track.id(), "dropping sample of a silenced track");
            return Ok(false);
        }
        self.sample_track(track).write_sample(sample).await?;
        Ok(true)
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_link(
        &self,
        remote_id: &str,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);
        wire_callbacks(&pc, &sink);
        debug!(remote_id, generation = sink.generation(), "peer connection created");
        Ok(Arc::new(RtcPeerLink {
            pc,
            samples: Arc::clone(&self.samples),
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, sink: &PeerEventSink) {
    let candidates = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(PeerEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(err) => warn!(remote_id = %sink.remote_id(), error = %err, "unserializable local candidate"),
            }
        })
    }));

    let states = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = states.clone();
        Box::pin(async move {
            trace!(remote_id = %sink.remote_id(), state = ?state, "peer connection state changed");
            let state = match state {
                RTCPeerConnectionState::Connecting => LinkState::Connecting,
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                _ => return,
            };
            sink.emit(PeerEventKind::StateChanged(state));
        })
    }));

    let tracks = sink.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let sink = tracks.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                RTPCodecType::Video => MediaKind::Video,
                _ => return,
            };
            let stream_id = track.stream_id();
            let info = RemoteTrackInfo {
                id: track.id(),
                kind,
            };
            sink.emit(PeerEventKind::RemoteTrack {
                stream_id: stream_id.clone(),
                track: info.clone(),
                change: TrackChange::Added,
            });
            // The track ends when its RTP stream does.
            tokio::spawn(async move {
                while track.read_rtp().await.is_ok() {}
                sink.emit(PeerEventKind::RemoteTrack {
                    stream_id,
                    track: info,
                    change: TrackChange::Ended,
                });
            });
        })
    }));
}

pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    samples: Arc<SampleTracks>,
    senders: Mutex<HashMap<MediaKind, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sample: Arc<dyn TrackLocal + Send + Sync> = self.samples.get_or_create(track);
        let sender = self.pc.add_track(sample).await?;

        // RTCP has to be drained for the interceptors to run.
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(&self, kind: MediaKind, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(PeerError::NoSender(kind))?;
        let sample: Arc<dyn TrackLocal + Send + Sync> = self.samples.get_or_create(track);
        sender.replace_track(Some(sample)).await?;
        Ok(())
    }

    async fn clear_track(&self, kind: MediaKind) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(PeerError::NoSender(kind))?;
        sender.replace_track(None).await?;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|err| PeerError::InvalidDescription(err.to_string()))?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.senders.lock().clear();
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerInput;
    use crate::track::TrackSource;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sink() -> (PeerEventSink, mpsc::UnboundedReceiver<ManagerInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerEventSink::new("remote", 1, tx), rx)
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_carries_added_media() {
        let factory = RtcPeerFactory::new(Vec::new()).expect("api");
        let (sink, _events) = sink();
        let link = factory.create_link("remote", sink).await.expect("link");

        let camera = LocalTrack::new(TrackSource::Camera, "cam");
        link.add_track(&camera).await.expect("add camera");
        let offer = link.create_offer(false).await.expect("offer");

        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=video"));
        link.close().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn replacing_needs_an_existing_sender() {
        let factory = RtcPeerFactory::new(Vec::new()).expect("api");
        let (sink, _events) = sink();
        let link = factory.create_link("remote", sink).await.expect("link");

        let mic = LocalTrack::new(TrackSource::Microphone, "mic");
        let err = link
            .replace_track(MediaKind::Audio, &mic)
            .await
            .expect_err("no audio sender");
        assert!(matches!(err, PeerError::NoSender(MediaKind::Audio)));
        link.close().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn samples_of_a_disabled_track_are_dropped() {
        let factory = RtcPeerFactory::new(Vec::new()).expect("api");
        let (sink, _events) = sink();
        let link = factory.create_link("remote", sink).await.expect("link");
        let mic = LocalTrack::new(TrackSource::Microphone, "mic");
        link.add_track(&mic).await.expect("add mic");
        let sample = Sample {
            duration: Duration::from_millis(20),
            ..Default::default()
        };

        assert!(factory.write_sample(&mic, &sample).await.expect("write"));
        mic.set_enabled(false);
        assert!(!factory.write_sample(&mic, &sample).await.expect("muted write"));
        mic.set_enabled(true);
        assert!(factory.write_sample(&mic, &sample).await.expect("unmuted write"));
        mic.stop();
        assert!(!factory.write_sample(&mic, &sample).await.expect("ended write"));
        link.close().await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn sample_tracks_are_shared_until_the_source_ends() {
        let factory = RtcPeerFactory::new(Vec::new()).expect("api");
        let camera = LocalTrack::new(TrackSource::Camera, "cam");
        let first = factory.sample_track(&camera);
        assert!(Arc::ptr_eq(&first, &factory.sample_track(&camera)));

        camera.stop();
        let other = LocalTrack::new(TrackSource::Screen, "display");
        factory.sample_track(&other);
        assert_eq!(factory.samples.tracks.lock().len(), 1);
    }
}
