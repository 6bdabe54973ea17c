// src/types.rs
use serde::{Deserialize, Serialize};

/// Where the samples of a session come from.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Mock,
    Arduino,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Mock => "mock",
            DataSource::Arduino => "arduino",
        }
    }
}

/// Session tag supplied by the surrounding app; forwarded with every persisted sample.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub data_source: DataSource,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, data_source: DataSource) -> Self {
        Self {
            session_id: session_id.into(),
            data_source,
        }
    }
}

// Transport lifecycle as seen by the aggregator
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Messages the forwarding worker sends back to the aggregator.
#[derive(Clone, Debug, PartialEq)]
pub enum ForwardEvent {
    Persisted { sequence: u64 },
    Failed { sequence: u64, reason: String },
}

impl ForwardEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            ForwardEvent::Persisted { sequence } => *sequence,
            ForwardEvent::Failed { sequence, .. } => *sequence,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ForwardEvent::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_source_serializes_as_backend_tag() {
        assert_eq!(serde_json::to_string(&DataSource::Arduino).unwrap(), "\"arduino\"");
        assert_eq!(DataSource::Mock.as_str(), "mock");
    }

    #[test]
    fn forward_event_accessors() {
        let ok = ForwardEvent::Persisted { sequence: 3 };
        let failed = ForwardEvent::Failed {
            sequence: 4,
            reason: "timeout".into(),
        };
        assert_eq!(ok.sequence(), 3);
        assert!(!ok.is_failure());
        assert_eq!(failed.sequence(), 4);
        assert!(failed.is_failure());
    }
}
