use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinates::TileCoordinates;
use crate::error_code::ErrorCode;
use crate::ids::{RunId, TileId, TileJobKey, WorkerToken};

/// Longest error message kept on a record, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileJobStatus {
    Pending,
    Claimed,
    Processing,
    Succeeded,
    Failed,
}

impl TileJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileJobStatus::Pending => "PENDING",
            TileJobStatus::Claimed => "CLAIMED",
            TileJobStatus::Processing => "PROCESSING",
            TileJobStatus::Succeeded => "SUCCEEDED",
            TileJobStatus::Failed => "FAILED",
        }
    }

    /// Statuses in which a worker is expected to hold the lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, TileJobStatus::Claimed | TileJobStatus::Processing)
    }
}

/// Failure classes that decide retry versus terminal failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Validation,
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "VALIDATION",
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::Permanent => "PERMANENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileError {
    pub code: String,
    pub message: String,
    pub classification: ErrorClass,
    pub occurred_at: DateTime<Utc>,
}

impl TileError {
    pub fn new(
        code: ErrorCode,
        message: impl Into<String>,
        classification: ErrorClass,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            code: code.to_string(),
            message: truncate_chars(message.into(), MAX_ERROR_MESSAGE_CHARS),
            classification,
            occurred_at,
        }
    }
}

fn truncate_chars(mut message: String, max: usize) -> String {
    if let Some((idx, _)) = message.char_indices().nth(max) {
        message.truncate(idx);
    }
    message
}

/// Location of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileResult {
    pub label: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
}

/// Per-tile work record.
///
/// `finished_at` is set exactly when the record reaches a terminal state;
/// a FAILED record without it is waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileJob {
    pub run_id: RunId,
    pub tile_id: TileId,
    pub coordinates: TileCoordinates,
    pub status: TileJobStatus,
    #[serde(default)]
    pub lock_owner: Option<WorkerToken>,
    #[serde(default)]
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<TileError>,
    #[serde(default)]
    pub result: Option<TileResult>,
    /// Imagery saved by an earlier attempt.
    #[serde(default)]
    pub checkpoint: Option<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TileJob {
    pub fn pending(
        run_id: RunId,
        coordinates: TileCoordinates,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            tile_id: coordinates.tile_id(),
            coordinates,
            status: TileJobStatus::Pending,
            lock_owner: None,
            lock_expires_at: None,
            attempt_count: 0,
            last_error: None,
            result: None,
            checkpoint: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            finished_at: None,
        }
    }

    pub fn key(&self) -> TileJobKey {
        TileJobKey::new(self.run_id.clone(), self.tile_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    /// True while some worker holds an unexpired lease.
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some()
            && self.lock_expires_at.is_some_and(|expires| now < expires)
    }

    pub fn is_owned_by(&self, token: &WorkerToken) -> bool {
        self.lock_owner.as_ref() == Some(token)
    }

    pub fn failure_class(&self) -> Option<ErrorClass> {
        self.last_error.as_ref().map(|err| err.classification)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn error_messages_are_truncated_on_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_MESSAGE_CHARS + 20);
        let err = TileError::new(
            ErrorCode::UnknownError,
            long,
            ErrorClass::Permanent,
            Utc::now(),
        );
        assert_eq!(err.message.chars().count(), MAX_ERROR_MESSAGE_CHARS);
        assert_eq!(err.code, "UNKNOWN_ERROR");
    }

    #[test]
    fn lease_liveness_is_strict() {
        let now = Utc::now();
        let coords = TileCoordinates::mapbox(2, 1, 1).expect("valid");
        let mut job = TileJob::pending(RunId::new("run_a"), coords, now);
        assert!(!job.lease_is_live(now));

        job.lock_owner = Some(WorkerToken::new());
        job.lock_expires_at = Some(now + Duration::seconds(10));
        assert!(job.lease_is_live(now + Duration::seconds(9)));
        assert!(!job.lease_is_live(now + Duration::seconds(10)));
    }
}
