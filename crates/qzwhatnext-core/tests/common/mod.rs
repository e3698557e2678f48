//! Shared fixtures for integration tests: a static availability provider, a
//! shareable fixed inference adapter, and an in-memory recording calendar.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use qzwhatnext_core::{
    AvailabilityError, AvailabilityProvider, BusyInterval, CalendarWriter, Database, Engine,
    EngineConfig, EventVersion, FixedInferenceAdapter, InferenceAdapter, InferenceError,
    InferenceInput, Interval, ManagedEventPayload, RemoteEvent, SyncError, User, UserRepository,
};

/// Provider returning a fixed busy list on every call.
pub struct StaticAvailability(pub Vec<BusyInterval>);

impl AvailabilityProvider for StaticAvailability {
    fn busy_intervals(
        &self,
        _user_id: &str,
        _window: Interval,
    ) -> Result<Vec<BusyInterval>, AvailabilityError> {
        Ok(self.0.clone())
    }
}

/// Provider that succeeds on the first call and times out afterwards.
pub struct FlakyAfterFirst {
    first: Mutex<Option<Vec<BusyInterval>>>,
}

impl FlakyAfterFirst {
    pub fn new(busy: Vec<BusyInterval>) -> Self {
        Self {
            first: Mutex::new(Some(busy)),
        }
    }
}

impl AvailabilityProvider for FlakyAfterFirst {
    fn busy_intervals(
        &self,
        _user_id: &str,
        _window: Interval,
    ) -> Result<Vec<BusyInterval>, AvailabilityError> {
        match self.first.lock().unwrap().take() {
            Some(busy) => Ok(busy),
            None => Err(AvailabilityError::Timeout),
        }
    }
}

/// Provider that always fails.
pub struct DownAvailability;

impl AvailabilityProvider for DownAvailability {
    fn busy_intervals(
        &self,
        _user_id: &str,
        _window: Interval,
    ) -> Result<Vec<BusyInterval>, AvailabilityError> {
        Err(AvailabilityError::Timeout)
    }
}

/// Fixed inference adapter shareable between the engine and assertions.
#[derive(Clone)]
pub struct SharedInference(pub Arc<FixedInferenceAdapter>);

impl InferenceAdapter for SharedInference {
    fn propose(
        &self,
        input: &InferenceInput,
    ) -> Result<qzwhatnext_core::AttributeProposals, InferenceError> {
        self.0.propose(input)
    }
}

/// A busy interval from an ordinary (non-managed) external event.
pub fn external_busy(start: DateTime<Utc>, end: DateTime<Utc>) -> BusyInterval {
    BusyInterval {
        start,
        end,
        engine_managed: false,
        event_id: None,
    }
}

/// Create an engine over an in-memory database plus one user.
pub fn engine_with_user(
    timezone: &str,
    availability: Box<dyn AvailabilityProvider>,
    inference: Box<dyn InferenceAdapter>,
) -> (Engine, User) {
    let db = Database::open_memory().unwrap();
    let user = User::new("tester", timezone);
    UserRepository::new(&db).create(&user).unwrap();
    let engine = Engine::new(db, EngineConfig::default(), availability, inference);
    (engine, user)
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub title: String,
    pub notes: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub etag_counter: usize,
    pub updated: DateTime<Utc>,
    pub managed_marker: bool,
    pub block_id_property: Option<String>,
}

impl StoredEvent {
    fn etag(&self) -> String {
        format!("etag-{}", self.etag_counter)
    }
}

/// In-memory external calendar that records every write.
#[derive(Default)]
pub struct RecordingWriter {
    pub events: Mutex<HashMap<String, StoredEvent>>,
    next_id: AtomicUsize,
    pub writes: AtomicUsize,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn event_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.events.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Simulate the user moving an event in their calendar app.
    pub fn user_moves_event(&self, event_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut events = self.events.lock().unwrap();
        let event = events.get_mut(event_id).expect("event exists");
        event.start = start;
        event.end = end;
        event.etag_counter += 1;
        event.updated = Utc::now();
    }

    /// Simulate the user retitling an event in their calendar app.
    pub fn user_retitles_event(&self, event_id: &str, title: &str) {
        let mut events = self.events.lock().unwrap();
        let event = events.get_mut(event_id).expect("event exists");
        event.title = title.to_string();
        event.etag_counter += 1;
        event.updated = Utc::now();
    }

    /// Strip the managed marker, as if the user copied the event.
    pub fn strip_marker(&self, event_id: &str) {
        let mut events = self.events.lock().unwrap();
        let event = events.get_mut(event_id).expect("event exists");
        event.managed_marker = false;
        event.etag_counter += 1;
    }

    fn to_remote(event_id: &str, stored: &StoredEvent) -> RemoteEvent {
        RemoteEvent {
            event_id: event_id.to_string(),
            etag: stored.etag(),
            updated: stored.updated,
            start: stored.start,
            end: stored.end,
            title: stored.title.clone(),
            notes: stored.notes.clone(),
            managed_marker: stored.managed_marker,
            block_id_property: stored.block_id_property.clone(),
        }
    }
}

impl CalendarWriter for RecordingWriter {
    fn create_event(
        &self,
        _user_id: &str,
        payload: &ManagedEventPayload,
    ) -> Result<EventVersion, SyncError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event_id = format!("ev-{n}");
        let stored = StoredEvent {
            title: payload.title.clone(),
            notes: payload.notes.clone(),
            start: payload.start,
            end: payload.end,
            etag_counter: 1,
            updated: Utc::now(),
            managed_marker: true,
            block_id_property: Some(payload.block_id.clone()),
        };
        let version = EventVersion {
            event_id: event_id.clone(),
            etag: stored.etag(),
            updated: stored.updated,
        };
        self.events.lock().unwrap().insert(event_id, stored);
        Ok(version)
    }

    fn get_event(&self, _user_id: &str, event_id: &str) -> Result<Option<RemoteEvent>, SyncError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(event_id)
            .map(|stored| Self::to_remote(event_id, stored)))
    }

    fn update_event(
        &self,
        _user_id: &str,
        event_id: &str,
        payload: &ManagedEventPayload,
        etag: &str,
    ) -> Result<EventVersion, SyncError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut events = self.events.lock().unwrap();
        let stored = events.get_mut(event_id).ok_or_else(|| {
            SyncError::Api(format!("update of missing event {event_id}"))
        })?;
        if stored.etag() != etag {
            return Err(SyncError::EtagConflict {
                event_id: event_id.to_string(),
            });
        }
        stored.title = payload.title.clone();
        stored.notes = payload.notes.clone();
        stored.start = payload.start;
        stored.end = payload.end;
        stored.etag_counter += 1;
        stored.updated = Utc::now();
        Ok(EventVersion {
            event_id: event_id.to_string(),
            etag: stored.etag(),
            updated: stored.updated,
        })
    }

    fn delete_event(&self, _user_id: &str, event_id: &str) -> Result<(), SyncError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().remove(event_id);
        Ok(())
    }
}
