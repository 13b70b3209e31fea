//! Failure classification.
//!
//! Every failure the engine can observe maps to exactly one [`ErrorClass`] and
//! one stable [`ErrorCode`]. The mapping is total: the match arms below are
//! exhaustive and carry no fallthrough that could leave a failure
//! unclassified.

use chrono::{DateTime, Utc};

use pyrolysis_contracts::collaborators::CollaboratorFailure;
use pyrolysis_contracts::queue::{BatchSendFailure, QueueError};
use pyrolysis_model::{ErrorClass, ErrorCode, RowError, Service, TileError};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureVerdict {
    pub classification: ErrorClass,
    pub code: ErrorCode,
    pub message: String,
}

impl FailureVerdict {
    fn new(
        classification: ErrorClass,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            classification,
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.classification == ErrorClass::Transient
    }

    pub fn to_tile_error(&self, at: DateTime<Utc>) -> TileError {
        TileError::new(self.code, self.message.clone(), self.classification, at)
    }
}

pub fn classify_failure(failure: &CollaboratorFailure) -> FailureVerdict {
    use CollaboratorFailure as F;
    use ErrorClass::{Permanent, Transient, Validation};

    let message = failure.to_string();
    match failure {
        F::Http {
            service, status, ..
        } => classify_status(*service, *status, message),
        F::Timeout { service } => {
            FailureVerdict::new(Transient, ErrorCode::Timeout(*service), message)
        }
        // Connection resets and DNS hiccups surface like timeouts upstream.
        F::Network { service, .. } => {
            FailureVerdict::new(Transient, ErrorCode::Timeout(*service), message)
        }
        F::Auth { service, .. } => {
            FailureVerdict::new(Permanent, ErrorCode::Auth(*service), message)
        }
        F::BadResponse { service, .. } => FailureVerdict::new(
            Transient,
            ErrorCode::BadResponse(*service),
            message,
        ),
        F::Validation { .. } => {
            FailureVerdict::new(Validation, ErrorCode::SchemaInvalid, message)
        }
        F::ArtifactPut { .. } => {
            FailureVerdict::new(Transient, ErrorCode::ArtifactPutFailed, message)
        }
        F::ArtifactGet { .. } => {
            FailureVerdict::new(Transient, ErrorCode::ArtifactGetFailed, message)
        }
        F::Other { .. } => {
            FailureVerdict::new(Permanent, ErrorCode::UnknownError, message)
        }
    }
}

fn classify_status(
    service: Service,
    status: u16,
    message: String,
) -> FailureVerdict {
    use ErrorClass::{Permanent, Transient};

    match status {
        429 => FailureVerdict::new(
            Transient,
            ErrorCode::RateLimited(service),
            message,
        ),
        408 => {
            FailureVerdict::new(Transient, ErrorCode::Timeout(service), message)
        }
        500..=599 => FailureVerdict::new(
            Transient,
            ErrorCode::ServerError(service),
            message,
        ),
        400 => FailureVerdict::new(
            Permanent,
            ErrorCode::BadRequest(service),
            message,
        ),
        401 | 403 => {
            FailureVerdict::new(Permanent, ErrorCode::Auth(service), message)
        }
        402..=499 => FailureVerdict::new(
            Permanent,
            ErrorCode::ClientError(service),
            message,
        ),
        // A status outside 4xx/5xx reported as a failure is not something a
        // retry will fix.
        _ => FailureVerdict::new(
            Permanent,
            ErrorCode::BadResponse(service),
            message,
        ),
    }
}

pub fn classify_row_error(error: &RowError) -> FailureVerdict {
    FailureVerdict::new(
        ErrorClass::Validation,
        ErrorCode::SchemaInvalid,
        error.to_string(),
    )
}

/// Per-entry batch rejection. A payload the queue refuses will be refused
/// again; anything else may go through on a later ingestion.
pub fn classify_enqueue_failure(failure: &BatchSendFailure) -> FailureVerdict {
    if failure.sender_fault {
        FailureVerdict::new(
            ErrorClass::Validation,
            ErrorCode::EnqueueRejected,
            failure.reason.clone(),
        )
    } else {
        FailureVerdict::new(
            ErrorClass::Transient,
            ErrorCode::EnqueueFailed,
            failure.reason.clone(),
        )
    }
}

pub fn classify_queue_error(error: &QueueError) -> FailureVerdict {
    let message = error.to_string();
    match error {
        QueueError::Unavailable(_) => FailureVerdict::new(
            ErrorClass::Transient,
            ErrorCode::EnqueueFailed,
            message,
        ),
        QueueError::Rejected(_) | QueueError::Serialization(_) => {
            FailureVerdict::new(
                ErrorClass::Validation,
                ErrorCode::EnqueueRejected,
                message,
            )
        }
    }
}

/// Engine-side faults hit while a lease is held. None of them says anything
/// about the tile, so the attempt is always worth repeating.
pub fn classify_engine_error(error: &CoreError) -> FailureVerdict {
    let code = match error {
        CoreError::Store(_) => ErrorCode::StoreUnavailable,
        CoreError::Queue(_) => ErrorCode::EnqueueFailed,
        _ => ErrorCode::UnknownError,
    };
    FailureVerdict::new(ErrorClass::Transient, code, error.to_string())
}

#[cfg(test)]
mod tests {
    use pyrolysis_model::TileId;

    use super::*;

    fn http(service: Service, status: u16) -> CollaboratorFailure {
        CollaboratorFailure::Http {
            service,
            status,
            message: "boom".into(),
        }
    }

    #[test]
    fn retryable_http_statuses_are_transient() {
        for (status, code) in [
            (429, "MAPBOX_429"),
            (500, "MAPBOX_5XX"),
            (503, "MAPBOX_5XX"),
            (408, "MAPBOX_TIMEOUT"),
        ] {
            let verdict = classify_failure(&http(Service::Mapbox, status));
            assert_eq!(verdict.classification, ErrorClass::Transient);
            assert_eq!(verdict.code.to_string(), code);
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for (status, code) in [
            (400, "VISION_BAD_REQUEST"),
            (401, "VISION_AUTH"),
            (403, "VISION_AUTH"),
            (404, "VISION_4XX"),
            (302, "VISION_BAD_RESPONSE"),
        ] {
            let verdict = classify_failure(&http(Service::Vision, status));
            assert_eq!(verdict.classification, ErrorClass::Permanent, "{status}");
            assert_eq!(verdict.code.to_string(), code);
        }
    }

    #[test]
    fn non_http_failures_are_classified() {
        let cases = [
            (
                CollaboratorFailure::Timeout {
                    service: Service::Google,
                },
                ErrorClass::Transient,
                "GOOGLE_TIMEOUT",
            ),
            (
                CollaboratorFailure::Auth {
                    service: Service::Google,
                    message: "malformed key".into(),
                },
                ErrorClass::Permanent,
                "GOOGLE_AUTH",
            ),
            (
                CollaboratorFailure::Validation {
                    message: "x out of range".into(),
                },
                ErrorClass::Validation,
                "SCHEMA_INVALID",
            ),
            (
                CollaboratorFailure::ArtifactPut {
                    message: "slow down".into(),
                },
                ErrorClass::Transient,
                "ARTIFACT_PUT_FAILED",
            ),
            (
                CollaboratorFailure::Other {
                    message: "???".into(),
                },
                ErrorClass::Permanent,
                "UNKNOWN_ERROR",
            ),
        ];
        for (failure, class, code) in cases {
            let verdict = classify_failure(&failure);
            assert_eq!(verdict.classification, class);
            assert_eq!(verdict.code.to_string(), code);
        }
    }

    #[test]
    fn enqueue_failures_split_on_sender_fault() {
        let rejected = BatchSendFailure {
            tile_id: TileId::from_raw("1/0/0"),
            sender_fault: true,
            reason: "payload too large".into(),
        };
        assert_eq!(
            classify_enqueue_failure(&rejected).classification,
            ErrorClass::Validation
        );
        let throttled = BatchSendFailure {
            sender_fault: false,
            ..rejected
        };
        let verdict = classify_enqueue_failure(&throttled);
        assert_eq!(verdict.classification, ErrorClass::Transient);
        assert_eq!(verdict.code, ErrorCode::EnqueueFailed);
    }

    #[test]
    fn engine_errors_are_transient() {
        let store = CoreError::Store(
            pyrolysis_contracts::store::StoreError::Unavailable("down".into()),
        );
        let verdict = classify_engine_error(&store);
        assert!(verdict.is_transient());
        assert_eq!(verdict.code.to_string(), "STORE_UNAVAILABLE");

        let missing =
            CoreError::RunNotFound(pyrolysis_model::RunId::new("run_gone"));
        assert_eq!(classify_engine_error(&missing).code, ErrorCode::UnknownError);
    }
}
