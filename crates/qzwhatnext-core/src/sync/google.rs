//! Google Calendar transport.
//!
//! Implements the calendar writer and availability provider boundaries over
//! the Calendar v3 REST API. Auth stays with the collaborator behind
//! [`AccessTokenProvider`]; revocation shows up here as `Unauthorized`.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::engine::availability::{AvailabilityError, AvailabilityProvider, BusyInterval, Interval};

use super::{
    CalendarWriter, EventVersion, ManagedEventPayload, RemoteEvent, SyncError, BLOCK_ID_PROPERTY,
    MANAGED_PROPERTY,
};

const API_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// Boundary 4 collaborator: supplies short-lived access tokens per user.
/// The engine never sees refresh tokens or raw credentials.
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self, user_id: &str) -> Result<String, SyncError>;
}

/// Google Calendar client for managed events.
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    calendar_id: String,
    tokens: Box<dyn AccessTokenProvider>,
}

impl GoogleCalendarClient {
    pub fn new(
        calendar_id: impl Into<String>,
        tokens: Box<dyn AccessTokenProvider>,
        timeout: std::time::Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            calendar_id: calendar_id.into(),
            tokens,
        }
    }

    fn events_url(&self) -> String {
        format!(
            "{API_BASE}/calendars/{}/events",
            urlencoding::encode(&self.calendar_id)
        )
    }

    fn event_url(&self, event_id: &str) -> String {
        format!("{}/{}", self.events_url(), urlencoding::encode(event_id))
    }

    fn event_body(payload: &ManagedEventPayload) -> serde_json::Value {
        let mut body = json!({
            "summary": payload.title,
            "start": {"dateTime": payload.start.to_rfc3339(), "timeZone": "UTC"},
            "end": {"dateTime": payload.end.to_rfc3339(), "timeZone": "UTC"},
            "extendedProperties": {
                "private": {
                    BLOCK_ID_PROPERTY: payload.block_id,
                    MANAGED_PROPERTY: "1",
                }
            }
        });
        if let Some(notes) = &payload.notes {
            body["description"] = json!(notes);
        }
        if let Some(rrule) = &payload.rrule {
            body["recurrence"] = json!([format!("RRULE:{rrule}")]);
        }
        body
    }

    fn check_status(status: reqwest::StatusCode, context: &str) -> Result<(), SyncError> {
        if status.is_success() {
            return Ok(());
        }
        match status.as_u16() {
            401 | 403 => Err(SyncError::Unauthorized),
            429 => Err(SyncError::RateLimited),
            _ => Err(SyncError::Api(format!("{context}: HTTP {status}"))),
        }
    }
}

impl CalendarWriter for GoogleCalendarClient {
    fn create_event(
        &self,
        user_id: &str,
        payload: &ManagedEventPayload,
    ) -> Result<EventVersion, SyncError> {
        let token = self.tokens.access_token(user_id)?;
        let body = Self::event_body(payload);
        let response = tokio::runtime::Handle::current().block_on(async {
            self.http
                .post(self.events_url())
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
        })?;
        Self::check_status(response.status(), "create event")?;
        let event: serde_json::Value =
            tokio::runtime::Handle::current().block_on(response.json())?;
        debug!(block_id = %payload.block_id, "external event created");
        parse_version(&event)
    }

    fn get_event(&self, user_id: &str, event_id: &str) -> Result<Option<RemoteEvent>, SyncError> {
        let token = self.tokens.access_token(user_id)?;
        let response = tokio::runtime::Handle::current().block_on(async {
            self.http
                .get(self.event_url(event_id))
                .bearer_auth(&token)
                .send()
                .await
        })?;
        if response.status().as_u16() == 404 || response.status().as_u16() == 410 {
            return Ok(None);
        }
        Self::check_status(response.status(), "get event")?;
        let event: serde_json::Value =
            tokio::runtime::Handle::current().block_on(response.json())?;
        if event["status"].as_str() == Some("cancelled") {
            return Ok(None);
        }
        Ok(Some(parse_remote_event(&event)?))
    }

    fn update_event(
        &self,
        user_id: &str,
        event_id: &str,
        payload: &ManagedEventPayload,
        etag: &str,
    ) -> Result<EventVersion, SyncError> {
        let token = self.tokens.access_token(user_id)?;
        let body = Self::event_body(payload);
        let response = tokio::runtime::Handle::current().block_on(async {
            self.http
                .put(self.event_url(event_id))
                .bearer_auth(&token)
                .header("If-Match", etag)
                .json(&body)
                .send()
                .await
        })?;
        if response.status().as_u16() == 412 {
            return Err(SyncError::EtagConflict {
                event_id: event_id.to_string(),
            });
        }
        Self::check_status(response.status(), "update event")?;
        let event: serde_json::Value =
            tokio::runtime::Handle::current().block_on(response.json())?;
        parse_version(&event)
    }

    fn delete_event(&self, user_id: &str, event_id: &str) -> Result<(), SyncError> {
        let token = self.tokens.access_token(user_id)?;
        let response = tokio::runtime::Handle::current().block_on(async {
            self.http
                .delete(self.event_url(event_id))
                .bearer_auth(&token)
                .send()
                .await
        })?;
        // Already gone counts as deleted.
        if response.status().as_u16() == 404 || response.status().as_u16() == 410 {
            return Ok(());
        }
        Self::check_status(response.status(), "delete event")
    }
}

impl AvailabilityProvider for GoogleCalendarClient {
    /// Read busy intervals. Only `(start, end)`, the event id, and the
    /// managed marker are requested; titles and attendees never leave the
    /// provider.
    fn busy_intervals(
        &self,
        user_id: &str,
        window: Interval,
    ) -> Result<Vec<BusyInterval>, AvailabilityError> {
        let token = self
            .tokens
            .access_token(user_id)
            .map_err(|e| match e {
                SyncError::Unauthorized => AvailabilityError::Unauthorized,
                other => AvailabilityError::Provider(other.to_string()),
            })?;
        let params = [
            ("timeMin".to_string(), window.start.to_rfc3339()),
            ("timeMax".to_string(), window.end.to_rfc3339()),
            ("singleEvents".to_string(), "true".to_string()),
            ("orderBy".to_string(), "startTime".to_string()),
            (
                "fields".to_string(),
                "items(id,start,end,extendedProperties/private)".to_string(),
            ),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}?{}", self.events_url(), query);

        let response = tokio::runtime::Handle::current()
            .block_on(async { self.http.get(&url).bearer_auth(&token).send().await })
            .map_err(|e| {
                if e.is_timeout() {
                    AvailabilityError::Timeout
                } else {
                    AvailabilityError::Provider(e.to_string())
                }
            })?;
        match response.status().as_u16() {
            401 | 403 => return Err(AvailabilityError::Unauthorized),
            s if !response.status().is_success() => {
                return Err(AvailabilityError::Provider(format!("HTTP {s}")))
            }
            _ => {}
        }
        let listing: serde_json::Value = tokio::runtime::Handle::current()
            .block_on(response.json())
            .map_err(|e| AvailabilityError::Provider(e.to_string()))?;

        let mut busy = Vec::new();
        for item in listing["items"].as_array().into_iter().flatten() {
            let Some((start, end)) = parse_item_interval(item) else {
                continue;
            };
            let private = &item["extendedProperties"]["private"];
            busy.push(BusyInterval {
                start,
                end,
                engine_managed: private[MANAGED_PROPERTY].as_str().is_some(),
                event_id: item["id"].as_str().map(|s| s.to_string()),
            });
        }
        Ok(busy)
    }
}

fn parse_version(event: &serde_json::Value) -> Result<EventVersion, SyncError> {
    let event_id = event["id"]
        .as_str()
        .ok_or_else(|| SyncError::Api("event response missing id".to_string()))?;
    let etag = event["etag"].as_str().unwrap_or_default();
    let updated = event["updated"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Ok(EventVersion {
        event_id: event_id.to_string(),
        etag: etag.to_string(),
        updated,
    })
}

fn parse_remote_event(event: &serde_json::Value) -> Result<RemoteEvent, SyncError> {
    let version = parse_version(event)?;
    let (start, end) = parse_item_interval(event)
        .ok_or_else(|| SyncError::Api("event response missing start/end".to_string()))?;
    let private = &event["extendedProperties"]["private"];
    Ok(RemoteEvent {
        event_id: version.event_id,
        etag: version.etag,
        updated: version.updated,
        start,
        end,
        title: event["summary"].as_str().unwrap_or_default().to_string(),
        notes: event["description"].as_str().map(|s| s.to_string()),
        managed_marker: private[MANAGED_PROPERTY].as_str().is_some(),
        block_id_property: private[BLOCK_ID_PROPERTY].as_str().map(|s| s.to_string()),
    })
}

/// Start/end of an event item. All-day events carry `date` bounds with an
/// exclusive end date, which maps directly onto half-open instants.
fn parse_item_interval(item: &serde_json::Value) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    fn bound(value: &serde_json::Value) -> Option<DateTime<Utc>> {
        if let Some(s) = value["dateTime"].as_str() {
            return DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }
        let date = value["date"].as_str()?;
        let day = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        Some(day.and_time(chrono::NaiveTime::MIN).and_utc())
    }
    let start = bound(&item["start"])?;
    let end = bound(&item["end"])?;
    Some((start, end))
}
