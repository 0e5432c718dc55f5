use serde::{Deserialize, Serialize};

/// The single command that flows through the replicated log.
///
/// Encoded as a JSON object with exactly the fields `key` and `value`. The
/// same encoding is the on-wire log payload and, aggregated as one object for
/// the whole store, the snapshot format, so field names must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogEntry {
    pub key: String,
    pub value: String,
}

impl LogEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
