//! WebRTC backend for the mesh, built on webrtc-rs.
//!
//! [`WebRtcFactory`] creates one `RTCPeerConnection` per remote participant
//! and routes its local ICE candidates and remote tracks to the mesh's
//! [`PeerObserver`]. Only tracks created by this module can be sent:
//! [`SilentMicrophone`] is the capture source for headless clients with
//! no audio device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::errors::RealtimeError;
use crate::events::{TrackInfo, TrackKind};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices, MediaSink, RemoteTrack};
use crate::mesh::{PeerConnection, PeerConnectionFactory, PeerObserver};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

/// One 20 ms Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn negotiation(context: &'static str) -> impl Fn(webrtc::Error) -> RealtimeError {
    move |e| RealtimeError::Negotiation(format!("{context}: {e}"))
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

fn candidate_to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Video => TrackKind::Video,
        _ => TrackKind::Audio,
    }
}

/// Creates webrtc-rs peer connections with the default codecs and
/// interceptors.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, RealtimeError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation("cannot register codecs"))?;
        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(negotiation("cannot register interceptors"))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
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
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        participant_id: &str,
        observer: PeerObserver,
    ) -> Result<Arc<dyn PeerConnection>, RealtimeError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(negotiation("cannot create peer connection"))?,
        );

        let candidates = observer.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering.
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => candidates.on_local_candidate(candidate_from_init(init)),
                    Err(e) => tracing::warn!(
                        participant = %candidates.participant_id(),
                        "cannot serialize local candidate: {e}"
                    ),
                }
            }
            Box::pin(async {})
        }));

        let tracks = observer;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let info = TrackInfo {
                    id: track.id(),
                    kind: track_kind(track.kind()),
                };
                tracing::debug!(participant = %tracks.participant_id(), track = %info.id, "remote track");
                tracks.on_remote_track(RemoteTrack {
                    info,
                    handle: track,
                });
                Box::pin(async {})
            },
        ));

        tracing::debug!(participant = participant_id, "peer connection created");
        Ok(Arc::new(WebRtcPeer {
            participant_id: participant_id.to_string(),
            pc,
            rtcp_readers: Mutex::new(Vec::new()),
        }))
    }
}

struct WebRtcPeer {
    participant_id: String,
    pc: Arc<RTCPeerConnection>,
    rtcp_readers: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcPeer {
    async fn local_description(&self, kind: SdpType) -> Result<SessionDescription, RealtimeError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| RealtimeError::Negotiation("no local description".into()))?;
        Ok(SessionDescription {
            kind,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), RealtimeError> {
        for track in media.tracks() {
            let local = track
                .backend()
                .and_then(|backend| backend.downcast::<TrackLocalStaticSample>().ok())
                .ok_or_else(|| {
                    RealtimeError::MediaAcquisition(format!(
                        "track {} cannot be sent over webrtc",
                        track.id()
                    ))
                })?;
            let sender = self
                .pc
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(negotiation("cannot add local track"))?;
            // RTCP has to be read for the interceptors to run.
            let reader = tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            lock(&self.rtcp_readers).push(reader);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RealtimeError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(negotiation("cannot create offer"))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation("cannot apply local offer"))?;
        self.local_description(SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, RealtimeError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation("cannot create answer"))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation("cannot apply local answer"))?;
        self.local_description(SdpType::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RealtimeError> {
        let remote = match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(negotiation("malformed remote description"))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation("cannot apply remote description"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RealtimeError> {
        self.pc
            .add_ice_candidate(candidate_to_init(candidate))
            .await
            .map_err(negotiation("cannot add remote candidate"))
    }

    async fn close(&self) {
        for reader in lock(&self.rtcp_readers).drain(..) {
            reader.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!(participant = %self.participant_id, "peer connection close failed: {e}");
        }
    }
}

/// An Opus track that sends silence, so a client without an audio device
/// can still join calls and receive media.
pub struct SilentMicrophone {
    id: String,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    live: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SilentMicrophone {
    /// Must be called from within a tokio runtime.
    pub fn start() -> Self {
        let id = format!("mic-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            "tripsync".to_string(),
        ));
        let enabled = Arc::new(AtomicBool::new(true));

        let sending = track.clone();
        let gate = enabled.clone();
        let pump = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OPUS_FRAME);
            loop {
                ticker.tick().await;
                if !gate.load(Ordering::Relaxed) {
                    continue;
                }
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: OPUS_FRAME,
                    ..Default::default()
                };
                if let Err(e) = sending.write_sample(&sample).await {
                    tracing::trace!("silent frame not sent: {e}");
                }
            }
        });

        Self {
            id,
            track,
            enabled,
            live: AtomicBool::new(true),
            pump: Mutex::new(Some(pump)),
        }
    }
}

impl LocalTrack for SilentMicrophone {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Relaxed);
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    fn backend(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        Some(self.track.clone())
    }
}

impl Drop for SilentMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Devices for a host without capture hardware: a [`SilentMicrophone`]
/// and no camera.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentDevices;

#[async_trait]
impl MediaDevices for SilentDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, RealtimeError> {
        if !constraints.audio {
            return Err(RealtimeError::MediaAcquisition(
                "no camera available and audio was not requested".into(),
            ));
        }
        if constraints.video {
            tracing::info!("no camera available; joining with audio only");
        }
        let microphone: Arc<dyn LocalTrack> = Arc::new(SilentMicrophone::start());
        Ok(LocalMedia::new(vec![microphone]))
    }
}

/// Sink that reads and discards remote RTP, logging how much arrived.
/// Remote tracks must be read or webrtc-rs stops delivering them.
#[derive(Default)]
pub struct DrainSink {
    readers: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl MediaSink for DrainSink {
    fn attach(&self, participant_id: &str, track: RemoteTrack) {
        let Ok(remote) = track.handle.clone().downcast::<TrackRemote>() else {
            tracing::debug!(participant = participant_id, "not a webrtc track; ignored");
            return;
        };
        let participant = participant_id.to_string();
        let track_id = track.info.id;
        let reader = tokio::spawn(async move {
            let mut packets = 0u64;
            while remote.read_rtp().await.is_ok() {
                packets += 1;
            }
            tracing::debug!(participant = %participant, track = %track_id, "remote track ended after {packets} packet(s)");
        });
        lock(&self.readers)
            .entry(participant_id.to_string())
            .or_default()
            .push(reader);
    }

    fn detach(&self, participant_id: &str) {
        if let Some(readers) = lock(&self.readers).remove(participant_id) {
            for reader in readers {
                reader.abort();
            }
        }
    }
}
