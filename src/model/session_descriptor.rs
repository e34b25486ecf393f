//! Session Descriptor (spec.md §3): the identity bundle carried by a live
//! call from FSM creation through Recorder/Feedback Store bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which backend family is currently serving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Provider,
    Local,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Provider => "provider",
            BackendKind::Local => "local",
        }
    }
}

/// Identity and routing state for one live call (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub call_id: String,
    pub policy_variant_id: String,
    pub backend_kind: BackendKind,
    pub created_at: DateTime<Utc>,
}

impl SessionDescriptor {
    #[must_use]
    pub fn new(
        session_id: String,
        call_id: String,
        policy_variant_id: String,
        backend_kind: BackendKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            call_id,
            policy_variant_id,
            backend_kind,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_serializes_snake_case() {
        let json = serde_json::to_string(&BackendKind::Provider).expect("serialize");
        assert_eq!(json, "\"provider\"");
        let json = serde_json::to_string(&BackendKind::Local).expect("serialize");
        assert_eq!(json, "\"local\"");
    }

    #[test]
    fn descriptor_roundtrips_through_json() {
        let desc = SessionDescriptor::new(
            "s1".into(),
            "c1".into(),
            "v0".into(),
            BackendKind::Local,
            Utc::now(),
        );
        let json = serde_json::to_string(&desc).expect("serialize");
        let back: SessionDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.session_id, "s1");
        assert_eq!(back.backend_kind, BackendKind::Local);
    }
}
