//! In-process fakes shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::errors::RealtimeError;
use crate::events::{TrackInfo, TrackKind, TripEvent, TripEventListener};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices, MediaSink, RemoteTrack};
use crate::mesh::{PeerConnection, PeerConnectionFactory, PeerObserver};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<TripEvent>>,
}

impl RecordingListener {
    pub(crate) fn events(&self) -> Vec<TripEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&TripEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl TripEventListener for RecordingListener {
    fn on_event(&self, event: TripEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub(crate) struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub(crate) fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Hands out one microphone and one camera track per acquisition.
#[derive(Default)]
pub(crate) struct FakeDevices {
    fail: AtomicBool,
    gated: AtomicBool,
    pub(crate) started: Notify,
    pub(crate) release: Notify,
    acquired: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeDevices {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make `acquire` wait for `release` after signalling `started`.
    pub(crate) fn gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.acquired.lock().unwrap().clone()
    }

    pub(crate) fn live_tracks(&self) -> usize {
        self.tracks().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, RealtimeError> {
        if self.gated.load(Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RealtimeError::MediaAcquisition("permission denied".into()));
        }
        let mut acquired = self.acquired.lock().unwrap();
        let n = acquired.len();
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            let track = FakeTrack::new(&format!("mic-{n}"), TrackKind::Audio);
            acquired.push(track.clone());
            tracks.push(track);
        }
        if constraints.video {
            let track = FakeTrack::new(&format!("cam-{n}"), TrackKind::Video);
            acquired.push(track.clone());
            tracks.push(track);
        }
        Ok(LocalMedia::new(tracks))
    }
}

/// Records every backend call as a short string, e.g. `remote:answer`.
pub(crate) struct FakeConnection {
    pub(crate) participant_id: String,
    pub(crate) observer: PeerObserver,
    log: Mutex<Vec<String>>,
    fail_offer: bool,
    reject_candidates: bool,
}

impl FakeConnection {
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.log().iter().filter(|l| *l == "close").count()
    }

    pub(crate) fn applied_candidates(&self) -> Vec<String> {
        self.log()
            .iter()
            .filter_map(|l| l.strip_prefix("ice:").map(str::to_string))
            .collect()
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<(), RealtimeError> {
        self.record(format!("tracks:{}", media.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RealtimeError> {
        self.record("offer");
        if self.fail_offer {
            return Err(RealtimeError::Negotiation("offer failed".into()));
        }
        self.observer.on_local_candidate(IceCandidate {
            candidate: format!("host-for-{}", self.participant_id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
        Ok(SessionDescription::offer(format!("offer-to-{}", self.participant_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RealtimeError> {
        self.record("answer");
        Ok(SessionDescription::answer(format!("answer-to-{}", self.participant_id)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), RealtimeError> {
        let kind = match description.kind {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        };
        self.record(format!("remote:{kind}"));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RealtimeError> {
        if self.reject_candidates && candidate.candidate.contains("bad") {
            return Err(RealtimeError::Negotiation("malformed candidate".into()));
        }
        self.record(format!("ice:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    created: Mutex<Vec<Arc<FakeConnection>>>,
    fail_offers: AtomicBool,
}

impl FakeFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn created(&self) -> Vec<Arc<FakeConnection>> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn connections_for(&self, participant_id: &str) -> Vec<Arc<FakeConnection>> {
        self.created()
            .into_iter()
            .filter(|c| c.participant_id == participant_id)
            .collect()
    }

    pub(crate) fn latest(&self, participant_id: &str) -> Arc<FakeConnection> {
        self.connections_for(participant_id)
            .pop()
            .expect("no connection for participant")
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        participant_id: &str,
        observer: PeerObserver,
    ) -> Result<Arc<dyn PeerConnection>, RealtimeError> {
        let connection = Arc::new(FakeConnection {
            participant_id: participant_id.to_string(),
            observer,
            log: Mutex::new(Vec::new()),
            fail_offer: self.fail_offers.load(Ordering::SeqCst),
            reject_candidates: true,
        });
        self.created.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    attached: Mutex<Vec<(String, TrackInfo)>>,
    detached: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub(crate) fn attached(&self) -> Vec<(String, TrackInfo)> {
        self.attached.lock().unwrap().clone()
    }

    pub(crate) fn detached(&self) -> Vec<String> {
        self.detached.lock().unwrap().clone()
    }
}

impl MediaSink for RecordingSink {
    fn attach(&self, participant_id: &str, track: RemoteTrack) {
        self.attached
            .lock()
            .unwrap()
            .push((participant_id.to_string(), track.info));
    }

    fn detach(&self, participant_id: &str) {
        self.detached.lock().unwrap().push(participant_id.to_string());
    }
}
