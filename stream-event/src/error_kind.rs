//! Stream error taxonomy (spec §4.5 `categorizeError`, §7).

use serde::{Deserialize, Serialize};

/// Classification of a stream-ending error, used both to decide retry policy
/// inside the engine and to pick a UI-safe message on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    NotStreaming,
    AlreadyStreaming,
    ModelNotFound,
    PreviousResponseNotFound,
    ContextExceeded,
    RateLimit,
    Quota,
    Auth,
    Network,
    Io,
    Invalid,
    Unknown,
}

impl StreamErrorKind {
    /// Whether the engine's retry path should attempt this again automatically.
    /// Quota errors must never auto-retry (spec §7); everything transient may.
    pub fn is_auto_retryable(self) -> bool {
        matches!(self, StreamErrorKind::Network | StreamErrorKind::RateLimit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_never_auto_retryable() {
        assert!(!StreamErrorKind::Quota.is_auto_retryable());
    }

    #[test]
    fn network_and_rate_limit_are_retryable() {
        assert!(StreamErrorKind::Network.is_auto_retryable());
        assert!(StreamErrorKind::RateLimit.is_auto_retryable());
    }

    #[test]
    fn serializes_snake_case() {
        let value = serde_json::to_value(StreamErrorKind::ContextExceeded).unwrap();
        assert_eq!(value, "context_exceeded");
    }
}
