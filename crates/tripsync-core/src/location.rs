//! Live location sharing over the room session.
//!
//! Inbound batches (`initial-locations`, then `updated-locations`) are
//! appended in delivery order. Sharing runs a local interval timer that
//! samples a [`LocationSource`] and publishes each fix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::errors::RealtimeError;
use crate::events::{ConnectionState, EventEmitter, LocationSample, TripEvent};
use crate::protocol::{inbound, outbound, LocationBatch, LocationUpdate, RoomMember};
use crate::session::{Session, Subscription};

/// A position reading from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: Option<f64>,
}

#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn current_fix(&self) -> Result<GeoFix, RealtimeError>;
}

/// Always reports the same position.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub GeoFix);

#[async_trait]
impl LocationSource for FixedLocation {
    async fn current_fix(&self) -> Result<GeoFix, RealtimeError> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct LocationLog {
    samples: Vec<LocationSample>,
    latest: HashMap<String, LocationSample>,
}

struct Sharing {
    task: JoinHandle<()>,
    generation: u64,
}

#[derive(Clone)]
pub struct LocationChannel {
    session: Arc<Mutex<Option<Session>>>,
    emitter: EventEmitter,
    log: Arc<Mutex<LocationLog>>,
    sharing: Arc<Mutex<Option<Sharing>>>,
    generation: Arc<AtomicU64>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocationChannel {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            session: Arc::new(Mutex::new(None)),
            emitter,
            log: Arc::new(Mutex::new(LocationLog::default())),
            sharing: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn attach(&self, session: &Session) -> Vec<Subscription> {
        *lock(&self.session) = Some(session.clone());
        [inbound::INITIAL_LOCATIONS, inbound::UPDATED_LOCATIONS]
            .into_iter()
            .map(|event| {
                let channel = self.clone();
                session.subscribe_typed(event, move |batch: LocationBatch| {
                    for sample in batch.samples {
                        channel.record(sample);
                    }
                })
            })
            .collect()
    }

    fn record(&self, sample: LocationSample) {
        {
            let mut log = lock(&self.log);
            let newer = log
                .latest
                .get(&sample.participant_id)
                .is_none_or(|current| sample.timestamp_ms >= current.timestamp_ms);
            if newer {
                log.latest
                    .insert(sample.participant_id.clone(), sample.clone());
            }
            log.samples.push(sample.clone());
        }
        self.emitter.emit(TripEvent::LocationReceived(sample));
    }

    fn open_session(&self) -> Result<Session, RealtimeError> {
        let session = lock(&self.session)
            .clone()
            .ok_or_else(|| RealtimeError::Room("not connected".into()))?;
        if !session.is_open() {
            return Err(RealtimeError::Connection(format!(
                "cannot share location: session is {:?}",
                session.state()
            )));
        }
        Ok(session)
    }

    /// Push one position to the room.
    pub fn publish(&self, fix: GeoFix) -> Result<LocationSample, RealtimeError> {
        let session = self.open_session()?;
        let sample = LocationSample {
            participant_id: session.participant_id().to_string(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_m: fix.accuracy_m,
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
        };
        session.emit(
            outbound::LOCATION_UPDATE,
            &LocationUpdate {
                room_id: session.room_id().to_string(),
                sample: sample.clone(),
            },
        );
        Ok(sample)
    }

    /// Publish a fix from `source` now and then every `interval` until
    /// [`stop_sharing`](Self::stop_sharing). Restarts the timer if already
    /// sharing.
    pub fn start_sharing(
        &self,
        source: Arc<dyn LocationSource>,
        interval: Duration,
    ) -> Result<(), RealtimeError> {
        if interval.is_zero() {
            return Err(RealtimeError::Config("location interval must be non-zero".into()));
        }
        self.open_session()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = self.clone();
        // Held until the handle is stored so an early exit finds its own slot.
        let mut sharing = lock(&self.sharing);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let fix = match source.current_fix().await {
                    Ok(fix) => fix,
                    Err(e) => {
                        tracing::warn!("location unavailable: {e}");
                        continue;
                    }
                };
                if channel.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                if let Err(e) = channel.publish(fix) {
                    tracing::debug!("location tick skipped: {e}");
                    let closed = lock(&channel.session)
                        .as_ref()
                        .is_none_or(|s| s.state() == ConnectionState::Closed);
                    if closed {
                        channel.sharing_ended(generation);
                        break;
                    }
                }
            }
        });
        let previous = sharing.replace(Sharing { task, generation });
        drop(sharing);
        match previous {
            Some(previous) => previous.task.abort(),
            None => {
                tracing::info!(interval_ms = interval.as_millis() as u64, "location sharing started");
                self.emitter.emit(TripEvent::LocationSharingChanged(true));
            }
        }
        Ok(())
    }

    /// Stop the sharing timer and tell the room. Returns whether sharing
    /// was active.
    pub fn stop_sharing(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let Some(sharing) = lock(&self.sharing).take() else {
            return false;
        };
        sharing.task.abort();
        if let Ok(session) = self.open_session() {
            session.emit(
                outbound::STOP_LOCATION_SHARING,
                &RoomMember {
                    room_id: session.room_id().to_string(),
                    participant_id: session.participant_id().to_string(),
                },
            );
        }
        tracing::info!("location sharing stopped");
        self.emitter.emit(TripEvent::LocationSharingChanged(false));
        true
    }

    /// The timer for `generation` gave up because the session closed.
    fn sharing_ended(&self, generation: u64) {
        let ended = {
            let mut sharing = lock(&self.sharing);
            match sharing.as_ref() {
                Some(current) if current.generation == generation => sharing.take(),
                _ => None,
            }
        };
        if ended.is_some() {
            tracing::info!("location sharing stopped: session closed");
            self.emitter.emit(TripEvent::LocationSharingChanged(false));
        }
    }

    pub fn is_sharing(&self) -> bool {
        lock(&self.sharing).is_some()
    }

    /// Every received sample, in delivery order.
    pub fn samples(&self) -> Vec<LocationSample> {
        lock(&self.log).samples.clone()
    }

    /// Most recent sample per participant, sorted by participant id.
    pub fn latest(&self) -> Vec<LocationSample> {
        let mut latest: Vec<LocationSample> = lock(&self.log).latest.values().cloned().collect();
        latest.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        latest
    }

    pub fn latest_for(&self, participant_id: &str) -> Option<LocationSample> {
        lock(&self.log).latest.get(participant_id).cloned()
    }

    /// Forget samples and the session (on exit). Call after `stop_sharing`.
    pub fn clear(&self) {
        let mut log = lock(&self.log);
        log.samples.clear();
        log.latest.clear();
        drop(log);
        lock(&self.session).take();
    }
}
