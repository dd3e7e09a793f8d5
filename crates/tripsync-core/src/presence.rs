//! Presence tracking: who is currently in the room.
//!
//! The backend sends a full roster snapshot on join and incremental
//! join/leave deltas afterwards. They are applied strictly in arrival
//! order: a snapshot replaces the active set, deltas then edit it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::api::RosterEntry;
use crate::events::{EventEmitter, Participant, TrackInfo, TripEvent};
use crate::protocol::{inbound, OnlineRoster, ParticipantGone, ParticipantRecord};
use crate::session::{Session, Subscription};

pub const COLOR_PALETTE: [&str; 8] = [
    "teal", "coral", "amber", "violet", "sky", "rose", "lime", "slate",
];

/// Color for the n-th participant seen in a room (0-based).
pub fn color_for_join_order(index: usize) -> &'static str {
    COLOR_PALETTE[index % COLOR_PALETTE.len()]
}

/// Difference between two successive active sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub joined: Vec<Participant>,
    pub left: Vec<String>,
    /// Still-active participants whose display metadata changed.
    pub updated: Vec<Participant>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.updated.is_empty()
    }
}

/// Active participant set for one room, excluding the local participant.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_id: String,
    directory: Vec<RosterEntry>,
    colors: HashMap<String, String>,
    seen: usize,
    active: Vec<Participant>,
}

impl PresenceTracker {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            directory: Vec::new(),
            colors: HashMap::new(),
            seen: 0,
            active: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Display metadata for trip members, typically fetched over REST.
    pub fn seed_directory(&mut self, entries: Vec<RosterEntry>) {
        for entry in &entries {
            if let Some(color) = &entry.color_tag {
                self.colors.insert(entry.participant_id.clone(), color.clone());
            }
        }
        self.directory = entries;
        for p in &mut self.active {
            if p.display_name.is_none() {
                p.display_name = self
                    .directory
                    .iter()
                    .find(|e| e.participant_id == p.participant_id)
                    .map(|e| e.display_name.clone());
            }
        }
    }

    /// Replace the active set with a roster snapshot. Participants that
    /// stay active pick up the names and colors the snapshot announces.
    pub fn apply_snapshot(&mut self, records: &[ParticipantRecord]) -> PresenceChange {
        let mut next: Vec<Participant> = Vec::with_capacity(records.len());
        let mut updated = Vec::new();
        for record in records {
            if record.participant_id == self.local_id
                || next.iter().any(|p| p.participant_id == record.participant_id)
            {
                continue;
            }
            let participant = match self.position(&record.participant_id) {
                Some(i) => {
                    let mut existing = self.active[i].clone();
                    if self.refresh(&mut existing, record) {
                        updated.push(existing.clone());
                    }
                    existing
                }
                None => self.make_participant(record),
            };
            next.push(participant);
        }

        let left: Vec<String> = self
            .active
            .iter()
            .filter(|p| !next.iter().any(|n| n.participant_id == p.participant_id))
            .map(|p| p.participant_id.clone())
            .collect();
        let joined: Vec<Participant> = next
            .iter()
            .filter(|n| self.position(&n.participant_id).is_none())
            .cloned()
            .collect();

        self.active = next;
        PresenceChange {
            joined,
            left,
            updated,
        }
    }

    /// Apply a `new-participant` delta. Already-active participants are a no-op.
    pub fn apply_join(&mut self, record: &ParticipantRecord) -> PresenceChange {
        if record.participant_id == self.local_id || self.position(&record.participant_id).is_some() {
            return PresenceChange::default();
        }
        let participant = self.make_participant(record);
        self.active.push(participant.clone());
        PresenceChange {
            joined: vec![participant],
            ..PresenceChange::default()
        }
    }

    /// Apply a `participant-disconnected` delta. Unknown participants are a no-op.
    pub fn apply_leave(&mut self, participant_id: &str) -> PresenceChange {
        match self.position(participant_id) {
            Some(i) => {
                self.active.remove(i);
                PresenceChange {
                    left: vec![participant_id.to_string()],
                    ..PresenceChange::default()
                }
            }
            None => PresenceChange::default(),
        }
    }

    /// Drop every active participant (the connection was lost).
    pub fn reset(&mut self) -> PresenceChange {
        let left = self.active.drain(..).map(|p| p.participant_id).collect();
        PresenceChange {
            left,
            ..PresenceChange::default()
        }
    }

    pub fn set_tracks(&mut self, participant_id: &str, tracks: Vec<TrackInfo>) -> bool {
        match self.position(participant_id) {
            Some(i) => {
                self.active[i].tracks = tracks;
                true
            }
            None => false,
        }
    }

    pub fn current_participants(&self) -> Vec<Participant> {
        self.active.clone()
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.active.iter().find(|p| p.participant_id == participant_id)
    }

    pub fn is_active(&self, participant_id: &str) -> bool {
        self.position(participant_id).is_some()
    }

    /// Every known trip member (directory first, then unlisted active ones)
    /// with its online flag.
    pub fn roster(&self) -> Vec<Participant> {
        let mut roster: Vec<Participant> = self
            .directory
            .iter()
            .filter(|e| e.participant_id != self.local_id)
            .map(|entry| match self.participant(&entry.participant_id) {
                Some(active) => active.clone(),
                None => Participant {
                    participant_id: entry.participant_id.clone(),
                    display_name: Some(entry.display_name.clone()),
                    color_tag: self
                        .colors
                        .get(&entry.participant_id)
                        .cloned()
                        .unwrap_or_else(|| "slate".to_string()),
                    online: false,
                    tracks: Vec::new(),
                },
            })
            .collect();
        for p in &self.active {
            if !roster.iter().any(|r| r.participant_id == p.participant_id) {
                roster.push(p.clone());
            }
        }
        roster
    }

    fn position(&self, participant_id: &str) -> Option<usize> {
        self.active.iter().position(|p| p.participant_id == participant_id)
    }

    fn make_participant(&mut self, record: &ParticipantRecord) -> Participant {
        let color_tag = self.color_for(&record.participant_id, record.color_tag.as_deref());
        let display_name = record.display_name.clone().or_else(|| {
            self.directory
                .iter()
                .find(|e| e.participant_id == record.participant_id)
                .map(|e| e.display_name.clone())
        });
        Participant {
            participant_id: record.participant_id.clone(),
            display_name,
            color_tag,
            online: true,
            tracks: Vec::new(),
        }
    }

    /// Merge announced metadata into an active participant. Absent fields
    /// keep their current value.
    fn refresh(&mut self, participant: &mut Participant, record: &ParticipantRecord) -> bool {
        let mut changed = false;
        if let Some(name) = &record.display_name {
            if participant.display_name.as_ref() != Some(name) {
                participant.display_name = Some(name.clone());
                changed = true;
            }
        }
        if let Some(color) = &record.color_tag {
            if participant.color_tag != *color {
                self.colors
                    .insert(participant.participant_id.clone(), color.clone());
                participant.color_tag = color.clone();
                changed = true;
            }
        }
        changed
    }

    /// Colors stick to a participant for the lifetime of the tracker unless
    /// the backend announces a new one.
    fn color_for(&mut self, participant_id: &str, announced: Option<&str>) -> String {
        if let Some(color) = self.colors.get(participant_id) {
            return color.clone();
        }
        let color = match announced {
            Some(c) => c.to_string(),
            None => {
                let c = color_for_join_order(self.seen).to_string();
                self.seen += 1;
                c
            }
        };
        self.colors.insert(participant_id.to_string(), color.clone());
        color
    }
}

type ChangeObserver = Arc<dyn Fn(&PresenceChange) + Send + Sync>;

/// Binds a [`PresenceTracker`] to a session's roster events.
#[derive(Clone)]
pub struct Presence {
    tracker: Arc<Mutex<PresenceTracker>>,
    emitter: EventEmitter,
    observers: Arc<Mutex<Vec<ChangeObserver>>>,
}

impl Presence {
    pub fn new(local_id: impl Into<String>, emitter: EventEmitter) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(PresenceTracker::new(local_id))),
            emitter,
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, PresenceTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the roster snapshot and join/leave deltas.
    pub fn attach(&self, session: &Session) -> Vec<Subscription> {
        let roster = self.clone();
        let joins = self.clone();
        let leaves = self.clone();
        vec![
            session.subscribe_typed(inbound::ONLINE_ROSTER, move |snapshot: OnlineRoster| {
                let change = roster.tracker().apply_snapshot(&snapshot.participants);
                roster.publish(change);
            }),
            session.subscribe_typed(inbound::NEW_PARTICIPANT, move |record: ParticipantRecord| {
                let change = joins.tracker().apply_join(&record);
                joins.publish(change);
            }),
            session.subscribe_typed(inbound::PARTICIPANT_DISCONNECTED, move |gone: ParticipantGone| {
                let change = leaves.tracker().apply_leave(&gone.participant_id);
                if change.is_empty() {
                    tracing::debug!("leave for unknown participant {}", gone.participant_id);
                }
                leaves.publish(change);
            }),
        ]
    }

    /// Register a callback run after every effective change, in order.
    pub fn on_change<F>(&self, observer: F)
    where
        F: Fn(&PresenceChange) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    pub fn seed_directory(&self, entries: Vec<RosterEntry>) {
        self.tracker().seed_directory(entries);
    }

    pub fn current_participants(&self) -> Vec<Participant> {
        self.tracker().current_participants()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.tracker().roster()
    }

    pub fn is_active(&self, participant_id: &str) -> bool {
        self.tracker().is_active(participant_id)
    }

    /// Record the remote tracks a participant currently sends us.
    pub fn set_tracks(&self, participant_id: &str, tracks: Vec<TrackInfo>) {
        let updated = self.tracker().set_tracks(participant_id, tracks);
        if updated {
            let current = self.current_participants();
            self.emitter.emit(TripEvent::ParticipantsChanged(current));
        }
    }

    pub fn reset(&self) {
        let change = self.tracker().reset();
        self.publish(change);
    }

    fn publish(&self, change: PresenceChange) {
        if change.is_empty() {
            return;
        }
        for p in &change.joined {
            tracing::info!(participant = %p.participant_id, "participant joined");
            self.emitter.emit(TripEvent::ParticipantJoined(p.clone()));
        }
        for id in &change.left {
            tracing::info!(participant = %id, "participant left");
            self.emitter.emit(TripEvent::ParticipantLeft(id.clone()));
        }
        for p in &change.updated {
            tracing::debug!(participant = %p.participant_id, "participant details refreshed");
        }
        self.emitter
            .emit(TripEvent::ParticipantsChanged(self.current_participants()));

        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(&change);
        }
    }
}
