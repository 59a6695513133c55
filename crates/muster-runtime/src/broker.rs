use chrono::Utc;
use muster_core::{Envelope, MusterError, MusterResult, Recipient};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// What `send` does when the recipient's mailbox is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Suspend the sender until mailbox space frees.
    Block,
    /// Fail fast with `QueueFull`; the caller retries with backoff.
    Reject,
}

struct BrokerState {
    mailboxes: HashMap<String, mpsc::Sender<Envelope>>,
    /// Next sequence number per sender→recipient pair.
    seqs: HashMap<(String, String), u64>,
}

/// Delivers point-to-point and broadcast messages between agents.
///
/// Every subscriber gets a bounded mailbox; bounded queues are the
/// backpressure mechanism that keeps a slow agent from growing memory
/// without limit. Under [`OverflowPolicy::Reject`] both the sequence stamp
/// and the delivery happen under the broker lock, so a mailbox observes
/// strictly increasing sequence numbers per sender→recipient pair even with
/// concurrent senders. Under [`OverflowPolicy::Block`] the send suspends
/// outside the lock and that guarantee holds only for a sequential sender.
/// Delivery is at-least-once and never deduplicated here; recipients
/// needing exactly-once semantics deduplicate on sequence number and
/// correlation id.
pub struct MessageBroker {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<BrokerState>,
}

impl MessageBroker {
    /// Creates a broker with the given per-mailbox capacity and overflow
    /// policy.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(BrokerState {
                mailboxes: HashMap::new(),
                seqs: HashMap::new(),
            }),
        }
    }

    /// Opens (or replaces) the mailbox for `agent_id` and returns its
    /// receiving end. Re-subscribing drops the previous mailbox.
    pub async fn subscribe(&self, agent_id: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state.lock().await;
        state.mailboxes.insert(agent_id.to_string(), tx);
        tracing::debug!(agent_id, "Mailbox opened");
        rx
    }

    /// Closes the mailbox for `agent_id`, if any.
    pub async fn unsubscribe(&self, agent_id: &str) {
        let mut state = self.state.lock().await;
        state.mailboxes.remove(agent_id);
    }

    /// Sends a message to a single recipient, returning the sequence number
    /// it was stamped with.
    ///
    /// Under [`OverflowPolicy::Block`] the caller suspends on a full
    /// mailbox; under [`OverflowPolicy::Reject`] a full mailbox fails with
    /// [`MusterError::QueueFull`]. An unsubscribed recipient fails with
    /// [`MusterError::UnknownAgent`].
    pub async fn send(
        &self,
        sender: &str,
        recipient: &str,
        payload: serde_json::Value,
        correlation_id: Option<Uuid>,
    ) -> MusterResult<u64> {
        let mut state = self.state.lock().await;
        let tx = state
            .mailboxes
            .get(recipient)
            .cloned()
            .ok_or_else(|| MusterError::UnknownAgent(recipient.to_string()))?;
        let seq = Self::next_seq(&mut state, sender, recipient);
        let envelope = Envelope {
            sender: sender.to_string(),
            recipient: Recipient::Agent(recipient.to_string()),
            seq,
            correlation_id,
            payload,
            sent_at: Utc::now(),
        };
        match self.policy {
            OverflowPolicy::Reject => {
                // Stamp and delivery stay under the one lock; a concurrent
                // sender cannot slip a later seq into the mailbox first.
                Self::try_deliver(&tx, recipient, envelope)?;
            }
            OverflowPolicy::Block => {
                drop(state);
                tx.send(envelope)
                    .await
                    .map_err(|_| MusterError::UnknownAgent(recipient.to_string()))?;
            }
        }
        Ok(seq)
    }

    /// Delivers a message to every current subscriber except the sender.
    /// Per-recipient failures are collected, not fatal to the broadcast.
    pub async fn broadcast(
        &self,
        sender: &str,
        payload: serde_json::Value,
        correlation_id: Option<Uuid>,
    ) -> Vec<(String, MusterError)> {
        let mut errors = Vec::new();
        let blocked: Vec<(String, mpsc::Sender<Envelope>, Envelope)> = {
            let mut state = self.state.lock().await;
            let recipients: Vec<(String, mpsc::Sender<Envelope>)> = state
                .mailboxes
                .iter()
                .filter(|(id, _)| id.as_str() != sender)
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect();
            let mut blocked = Vec::new();
            for (id, tx) in recipients {
                let seq = Self::next_seq(&mut state, sender, &id);
                let envelope = Envelope {
                    sender: sender.to_string(),
                    recipient: Recipient::Broadcast,
                    seq,
                    correlation_id,
                    payload: payload.clone(),
                    sent_at: Utc::now(),
                };
                match self.policy {
                    OverflowPolicy::Reject => {
                        if let Err(e) = Self::try_deliver(&tx, &id, envelope) {
                            tracing::warn!(recipient = %id, error = %e, "Broadcast delivery failed");
                            errors.push((id, e));
                        }
                    }
                    OverflowPolicy::Block => blocked.push((id, tx, envelope)),
                }
            }
            blocked
        };

        for (id, tx, envelope) in blocked {
            if tx.send(envelope).await.is_err() {
                let e = MusterError::UnknownAgent(id.clone());
                tracing::warn!(recipient = %id, error = %e, "Broadcast delivery failed");
                errors.push((id, e));
            }
        }
        errors
    }

    fn next_seq(state: &mut BrokerState, sender: &str, recipient: &str) -> u64 {
        let counter = state
            .seqs
            .entry((sender.to_string(), recipient.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    fn try_deliver(
        tx: &mpsc::Sender<Envelope>,
        recipient: &str,
        envelope: Envelope,
    ) -> MusterResult<()> {
        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MusterError::QueueFull(recipient.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                MusterError::UnknownAgent(recipient.to_string())
            }
        })
    }

    /// Mailbox fill fraction in `[0, 1]` for a subscriber, `None` when the
    /// agent has no mailbox. Reported to the monitor as saturation.
    pub async fn saturation(&self, agent_id: &str) -> Option<f64> {
        let state = self.state.lock().await;
        state.mailboxes.get(agent_id).map(|tx| {
            let free = tx.capacity();
            (self.capacity - free) as f64 / self.capacity as f64
        })
    }

    /// Identifiers of all current subscribers, ordered.
    pub async fn subscribers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.mailboxes.keys().cloned().collect();
        ids.sort();
        ids
    }
}
