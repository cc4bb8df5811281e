//! Canonical event record and correlation-key construction.
//!
//! `MediaEvent` unifies playback events reported by Plex, Tautulli, Jellyfin,
//! and Emby into one record shape (grounded in the teacher's `Event`/
//! `EventPayload` split in `events.rs`), plus the correlation-key machinery
//! used to recognise the same playback session reported by more than one
//! source.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, Result};

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Originating media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Plex,
    Tautulli,
    Jellyfin,
    Emby,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Plex, Source::Tautulli, Source::Jellyfin, Source::Emby];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Plex => "plex",
            Source::Tautulli => "tautulli",
            Source::Jellyfin => "jellyfin",
            Source::Emby => "emby",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plex" => Ok(Source::Plex),
            "tautulli" => Ok(Source::Tautulli),
            "jellyfin" => Ok(Source::Jellyfin),
            "emby" => Ok(Source::Emby),
            other => Err(IngestError::permanent(format!("unknown source: {other}"))),
        }
    }
}

/// Kind of media being played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Episode,
    Track,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Episode => "episode",
            MediaType::Track => "track",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Client network location relative to the media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    Wan,
    Lan,
}

/// Canonical playback event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaEvent {
    // Identity
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    // Who
    pub user_id: i64,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_thumb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    // What
    pub media_type: MediaType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grandparent_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_duration: Option<i64>,

    // When
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_counter: Option<i32>,

    // How: platform/player descriptors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,

    // How: network descriptors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_type: Option<LocationType>,

    // How: streaming-quality descriptors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_channels: Option<i32>,

    // How: flags
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relayed: Option<bool>,

    pub schema_version: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl MediaEvent {
    /// Produce a fresh record for the given source: new UUID, current
    /// ingest timestamp, and the current schema version.
    pub fn new_event(source: Source) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            session_key: None,
            correlation_key: None,
            transaction_id: None,
            source,
            server_id: None,
            user_id: 0,
            username: String::new(),
            friendly_name: None,
            user_thumb: None,
            email: None,
            media_type: MediaType::Movie,
            title: String::new(),
            parent_title: None,
            grandparent_title: None,
            rating_key: None,
            year: None,
            media_duration: None,
            started_at: None,
            stopped_at: None,
            percent_complete: None,
            play_duration: None,
            paused_counter: None,
            platform: None,
            player: None,
            product: None,
            device: None,
            machine_id: None,
            ip_address: None,
            location_type: None,
            transcode_decision: None,
            video_codec: None,
            audio_codec: None,
            bitrate: None,
            audio_channels: None,
            secure: None,
            local: None,
            relayed: None,
            schema_version: CURRENT_SCHEMA_VERSION,
            raw_payload: None,
            timestamp: Utc::now(),
        }
    }

    /// Validate the record is admissible. Fails with a field-qualified
    /// [`IngestError::Permanent`] if any required field is empty.
    pub fn validate(&self) -> Result<()> {
        if self.event_id.trim().is_empty() {
            return Err(IngestError::permanent("event_id must not be empty"));
        }
        if self.user_id == 0 {
            return Err(IngestError::permanent("user_id must be set"));
        }
        if self.title.trim().is_empty() {
            return Err(IngestError::permanent("title must not be empty"));
        }
        if let (Some(started), Some(stopped)) = (self.started_at, self.stopped_at) {
            if stopped < started {
                return Err(IngestError::permanent(
                    "stopped_at must not precede started_at",
                ));
            }
        }
        Ok(())
    }

    /// Compute and set the correlation key described in the data model.
    /// Idempotent: calling this repeatedly with unchanged fields produces
    /// the same key.
    pub fn set_correlation_key(&mut self) -> Result<()> {
        let started_at = self
            .started_at
            .ok_or_else(|| IngestError::permanent("started_at must be set before correlation"))?;

        let server = self.server_id.as_deref().unwrap_or("default");
        let rating_or_title = self
            .rating_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.title);
        let machine = self.machine_id.as_deref().unwrap_or("unknown");
        let time_bucket = started_at
            .trunc_subsecs(0)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let session_or_event = self
            .session_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.event_id);

        let key = format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.source, server, self.user_id, rating_or_title, machine, time_bucket, session_or_event
        );

        self.correlation_key = Some(key);
        Ok(())
    }

    /// Strip the source prefix (and, for current-format keys, the session
    /// suffix) from a correlation key, yielding the content-identifying
    /// "cross-source key". Legacy 6-segment keys carry no session suffix and
    /// only have the source prefix stripped.
    pub fn cross_source_key(corr_key: &str) -> String {
        let parts: Vec<&str> = corr_key.split(':').collect();
        match parts.len() {
            0..=5 => String::new(),
            6 => parts[1..].join(":"),
            _ => parts[1..parts.len() - 1].join(":"),
        }
    }

    /// Return the leading source segment of a correlation key, or an empty
    /// string if the key has no segments.
    pub fn source_from(corr_key: &str) -> String {
        corr_key.split(':').next().unwrap_or("").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event(source: Source, event_id: &str, session_key: &str) -> MediaEvent {
        let mut event = MediaEvent::new_event(source);
        event.event_id = event_id.to_string();
        event.session_key = Some(session_key.to_string());
        event.user_id = 12345;
        event.username = "alice".to_string();
        event.media_type = MediaType::Movie;
        event.title = "M".to_string();
        event.rating_key = Some("54321".to_string());
        event.machine_id = Some("dev-1".to_string());
        event.started_at = Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
        event
    }

    #[test]
    fn validate_rejects_missing_required_fields() {
        let mut event = MediaEvent::new_event(Source::Plex);
        assert!(event.validate().is_err());
        event.user_id = 1;
        event.title = "ok".to_string();
        assert!(event.validate().is_ok());

        event.event_id.clear();
        assert!(event.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_event() {
        let event = sample_event(Source::Plex, "plex-1", "s-p");
        assert!(event.validate().is_ok());
    }

    #[test]
    fn validate_rejects_stopped_before_started() {
        let mut event = sample_event(Source::Plex, "plex-1", "s-p");
        event.stopped_at = Some(event.started_at.unwrap() - chrono::Duration::seconds(5));
        assert!(event.validate().is_err());
    }

    #[test]
    fn cross_source_key_matches_across_sources_same_bucket() {
        let mut a = sample_event(Source::Plex, "plex-1", "s-p");
        let mut b = sample_event(Source::Tautulli, "taut-1", "s-t");

        a.set_correlation_key().unwrap();
        b.set_correlation_key().unwrap();

        assert_ne!(a.correlation_key, b.correlation_key);
        assert_eq!(
            MediaEvent::cross_source_key(a.correlation_key.as_ref().unwrap()),
            MediaEvent::cross_source_key(b.correlation_key.as_ref().unwrap())
        );
    }

    #[test]
    fn set_correlation_key_is_idempotent() {
        let mut event = sample_event(Source::Plex, "plex-1", "s-p");
        event.set_correlation_key().unwrap();
        let first = event.correlation_key.clone();
        event.set_correlation_key().unwrap();
        assert_eq!(first, event.correlation_key);
    }

    #[test]
    fn source_from_returns_leading_segment() {
        let mut event = sample_event(Source::Jellyfin, "jf-1", "s-j");
        event.set_correlation_key().unwrap();
        let key = event.correlation_key.unwrap();
        assert_eq!(MediaEvent::source_from(&key), "jellyfin");
    }

    #[test]
    fn source_from_empty_key_is_empty() {
        assert_eq!(MediaEvent::source_from(""), "");
    }

    #[test]
    fn cross_source_key_handles_legacy_six_segment_keys() {
        let legacy = "plex:srv:12345:54321:dev-1:2024-01-15T10:30:00Z";
        assert_eq!(
            MediaEvent::cross_source_key(legacy),
            "srv:12345:54321:dev-1:2024-01-15T10:30:00Z"
        );
    }
}
