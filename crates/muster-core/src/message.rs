use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Destination of a brokered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    /// A single agent, by identifier.
    Agent(String),
    /// Every currently subscribed agent.
    Broadcast,
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Agent(id) => write!(f, "{id}"),
            Recipient::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// A message as delivered into a recipient's mailbox.
///
/// `seq` is monotonic per sender→recipient pair. Delivery is at-least-once
/// and the broker never deduplicates; recipients that need exactly-once
/// semantics deduplicate on `(sender, seq)` and `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending agent or component identifier.
    pub sender: String,
    /// Destination the sender addressed.
    pub recipient: Recipient,
    /// Sequence number, monotonic per sender→recipient pair.
    pub seq: u64,
    /// Ties a response to its originating request.
    pub correlation_id: Option<Uuid>,
    /// Opaque message body.
    pub payload: serde_json::Value,
    /// Send timestamp.
    pub sent_at: DateTime<Utc>,
}
