use std::fmt;

use serde::{Deserialize, Serialize};

/// External service a failure originated from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Service {
    Mapbox,
    Google,
    Vision,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Mapbox => "MAPBOX",
            Service::Google => "GOOGLE",
            Service::Vision => "VISION",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error codes recorded on failed tile jobs.
///
/// The rendered form (`MAPBOX_429`, `RETRY_EXHAUSTED`, ...) is what lands in
/// storage and dashboards, so it must not change once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    RateLimited(Service),
    ServerError(Service),
    ClientError(Service),
    BadRequest(Service),
    Auth(Service),
    Timeout(Service),
    BadResponse(Service),
    ArtifactPutFailed,
    ArtifactGetFailed,
    SchemaInvalid,
    MessageParseError,
    EnqueueFailed,
    EnqueueRejected,
    RetryExhausted,
    StoreUnavailable,
    UnknownError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::RateLimited(service) => write!(f, "{service}_429"),
            ErrorCode::ServerError(service) => write!(f, "{service}_5XX"),
            ErrorCode::ClientError(service) => write!(f, "{service}_4XX"),
            ErrorCode::BadRequest(service) => {
                write!(f, "{service}_BAD_REQUEST")
            }
            ErrorCode::Auth(service) => write!(f, "{service}_AUTH"),
            ErrorCode::Timeout(service) => write!(f, "{service}_TIMEOUT"),
            ErrorCode::BadResponse(service) => {
                write!(f, "{service}_BAD_RESPONSE")
            }
            ErrorCode::ArtifactPutFailed => f.write_str("ARTIFACT_PUT_FAILED"),
            ErrorCode::ArtifactGetFailed => f.write_str("ARTIFACT_GET_FAILED"),
            ErrorCode::SchemaInvalid => f.write_str("SCHEMA_INVALID"),
            ErrorCode::MessageParseError => f.write_str("MESSAGE_PARSE_ERROR"),
            ErrorCode::EnqueueFailed => f.write_str("ENQUEUE_FAILED"),
            ErrorCode::EnqueueRejected => f.write_str("ENQUEUE_REJECTED"),
            ErrorCode::RetryExhausted => f.write_str("RETRY_EXHAUSTED"),
            ErrorCode::StoreUnavailable => f.write_str("STORE_UNAVAILABLE"),
            ErrorCode::UnknownError => f.write_str("UNKNOWN_ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_stably() {
        assert_eq!(
            ErrorCode::RateLimited(Service::Mapbox).to_string(),
            "MAPBOX_429"
        );
        assert_eq!(
            ErrorCode::ServerError(Service::Vision).to_string(),
            "VISION_5XX"
        );
        assert_eq!(
            ErrorCode::BadRequest(Service::Google).to_string(),
            "GOOGLE_BAD_REQUEST"
        );
        assert_eq!(ErrorCode::RetryExhausted.to_string(), "RETRY_EXHAUSTED");
    }
}
