//! Inter-worker messages routed by the priority bus.

use crate::ids::{MessageId, WorkerId};
use crate::status::{DeliveryState, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A priority-tagged message between two workers.
///
/// The bus exclusively owns every `Message`; workers only ever see copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,

    /// Sending worker.
    pub from: WorkerId,

    /// Receiving worker.
    pub to: WorkerId,

    /// Application-level type tag ("task_handoff", "review_request", ...).
    pub kind: String,

    /// Opaque payload as a JSON string.
    pub payload_json: String,

    /// Delivery tier.
    pub priority: Priority,

    /// When the bus accepted the message.
    pub sent_at: DateTime<Utc>,

    /// Where the message is in its delivery lifecycle.
    pub state: DeliveryState,
}

/// Input for sending a message; the bus assigns id, timestamp, and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Sending worker.
    pub from: WorkerId,

    /// Receiving worker.
    pub to: WorkerId,

    /// Application-level type tag.
    pub kind: String,

    /// Opaque payload as a JSON string.
    #[serde(default)]
    pub payload_json: String,

    /// Delivery tier.
    #[serde(default)]
    pub priority: Priority,
}

impl MessageDraft {
    /// Create a draft with normal priority and an empty payload.
    pub fn new(
        from: impl Into<WorkerId>,
        to: impl Into<WorkerId>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
            payload_json: String::new(),
            priority: Priority::default(),
        }
    }

    /// Builder method to set the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the payload.
    pub fn with_payload(mut self, payload_json: impl Into<String>) -> Self {
        self.payload_json = payload_json.into();
        self
    }

    /// Seal the draft into an owned Message in state `pending`.
    pub fn into_message(self) -> Message {
        Message {
            id: MessageId::generate(),
            from: self.from,
            to: self.to,
            kind: self.kind,
            payload_json: self.payload_json,
            priority: self.priority,
            sent_at: Utc::now(),
            state: DeliveryState::Pending,
        }
    }
}
