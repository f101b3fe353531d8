//! Priority message bus - tiered delivery between workers.
//!
//! The bus owns every message outright; workers only ever see copies. A
//! drain always yields all `critical` before any `high`, and so on down the
//! tiers; within a tier, arrival order is preserved. Delivery is
//! at-least-once: a message stays with the bus until it is explicitly
//! acknowledged, cleared, or requeued — there is no automatic retry and no
//! expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use fleet_core::{CoreError, DeliveryState, Message, MessageDraft, MessageId, Priority, WorkerId};

/// Bound on the rolling flow history kept for inspection.
const FLOW_HISTORY_CAP: usize = 1024;

/// Aggregated traffic between one (sender, recipient) pair.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FlowStat {
    /// Sending worker.
    pub from: WorkerId,
    /// Receiving worker.
    pub to: WorkerId,
    /// Messages sent over the pair's lifetime.
    pub count: u64,
    /// When the pair last saw traffic.
    pub last_seen: DateTime<Utc>,
}

/// One entry in the bounded rolling history of sends.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FlowRecord {
    pub from: WorkerId,
    pub to: WorkerId,
    pub priority: Priority,
    pub at: DateTime<Utc>,
}

/// Criteria narrowing which queued messages `consume` may return.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Only messages with this type tag.
    pub kind: Option<String>,
    /// Only messages from this sender.
    pub from: Option<WorkerId>,
}

impl MessageFilter {
    fn matches(&self, msg: &Message) -> bool {
        if let Some(kind) = &self.kind {
            if &msg.kind != kind {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if &msg.from != from {
                return false;
            }
        }
        true
    }
}

fn tier(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

#[derive(Default)]
struct BusInner {
    // recipient -> one FIFO queue per tier, drained critical-first
    queues: HashMap<WorkerId, [VecDeque<Message>; 4]>,
    // delivered but not yet acknowledged
    in_flight: HashMap<MessageId, Message>,
    flows: HashMap<(WorkerId, WorkerId), FlowStat>,
    recent: VecDeque<FlowRecord>,
}

/// In-memory priority message bus. Cheap to share via `Arc`.
pub struct MessageBus {
    inner: RwLock<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BusInner::default()),
        }
    }

    /// Accept a message onto the recipient's tier queue and record the flow.
    pub fn send(&self, draft: MessageDraft) -> Message {
        let message = draft.into_message();
        let mut inner = self.inner.write().expect("bus lock poisoned");

        let stat = inner
            .flows
            .entry((message.from.clone(), message.to.clone()))
            .or_insert_with(|| FlowStat {
                from: message.from.clone(),
                to: message.to.clone(),
                count: 0,
                last_seen: message.sent_at,
            });
        stat.count += 1;
        stat.last_seen = message.sent_at;

        if inner.recent.len() == FLOW_HISTORY_CAP {
            inner.recent.pop_front();
        }
        inner.recent.push_back(FlowRecord {
            from: message.from.clone(),
            to: message.to.clone(),
            priority: message.priority,
            at: message.sent_at,
        });

        debug!(
            message_id = %message.id,
            from = %message.from,
            to = %message.to,
            priority = %message.priority,
            kind = %message.kind,
            "Message queued"
        );

        let queues = inner.queues.entry(message.to.clone()).or_default();
        queues[tier(message.priority)].push_back(message.clone());

        message
    }

    /// Hand the next eligible message to the recipient, honoring tier order
    /// then FIFO. The message is marked `delivered` and parked in-flight
    /// until it is acknowledged or requeued.
    pub fn consume(
        &self,
        recipient: &WorkerId,
        filter: Option<&MessageFilter>,
    ) -> Option<Message> {
        let mut inner = self.inner.write().expect("bus lock poisoned");
        let queues = inner.queues.get_mut(recipient)?;

        let mut found: Option<Message> = None;
        for queue in queues.iter_mut() {
            let position = match filter {
                Some(filter) => queue.iter().position(|m| filter.matches(m)),
                None => (!queue.is_empty()).then_some(0),
            };
            if let Some(mut message) = position.and_then(|p| queue.remove(p)) {
                message.state = DeliveryState::Delivered;
                found = Some(message);
                break;
            }
        }

        let message = found?;
        inner.in_flight.insert(message.id.clone(), message.clone());
        debug!(message_id = %message.id, to = %recipient, "Message delivered");
        Some(message)
    }

    /// Consume every queued message for the recipient, in delivery order.
    pub fn drain(&self, recipient: &WorkerId) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(message) = self.consume(recipient, None) {
            messages.push(message);
        }
        messages
    }

    /// Acknowledge an in-flight message; the bus drops it as `consumed`.
    pub fn ack(&self, message_id: &MessageId) -> Result<Message, CoreError> {
        let mut inner = self.inner.write().expect("bus lock poisoned");
        let mut message = inner
            .in_flight
            .remove(message_id)
            .ok_or_else(|| CoreError::MessageNotFound(message_id.clone()))?;
        message.state = DeliveryState::Consumed;
        debug!(message_id = %message_id, "Message consumed");
        Ok(message)
    }

    /// Put an in-flight message back at the front of its tier queue.
    pub fn requeue(&self, message_id: &MessageId) -> Result<(), CoreError> {
        let mut inner = self.inner.write().expect("bus lock poisoned");
        let mut message = inner
            .in_flight
            .remove(message_id)
            .ok_or_else(|| CoreError::MessageNotFound(message_id.clone()))?;
        message.state = DeliveryState::Pending;
        debug!(message_id = %message_id, to = %message.to, "Message requeued");
        let queues = inner.queues.entry(message.to.clone()).or_default();
        queues[tier(message.priority)].push_front(message);
        Ok(())
    }

    /// Drop queued (not in-flight) messages, scoped to one recipient or all.
    /// Returns how many were dropped.
    pub fn clear(&self, recipient: Option<&WorkerId>) -> usize {
        let mut inner = self.inner.write().expect("bus lock poisoned");
        let dropped = match recipient {
            Some(recipient) => inner
                .queues
                .remove(recipient)
                .map(|queues| queues.iter().map(VecDeque::len).sum())
                .unwrap_or(0),
            None => {
                let total = inner
                    .queues
                    .values()
                    .map(|queues| queues.iter().map(VecDeque::len).sum::<usize>())
                    .sum();
                inner.queues.clear();
                total
            }
        };
        if dropped > 0 {
            debug!(dropped, "Cleared queued messages");
        }
        dropped
    }

    /// Total queued (not in-flight) messages across all recipients.
    pub fn queued_total(&self) -> usize {
        let inner = self.inner.read().expect("bus lock poisoned");
        inner
            .queues
            .values()
            .map(|queues| queues.iter().map(VecDeque::len).sum::<usize>())
            .sum()
    }

    /// Number of queued (not in-flight) messages for a recipient.
    pub fn pending_count(&self, recipient: &WorkerId) -> usize {
        let inner = self.inner.read().expect("bus lock poisoned");
        inner
            .queues
            .get(recipient)
            .map(|queues| queues.iter().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Per-pair traffic statistics, unordered.
    pub fn flow_stats(&self) -> Vec<FlowStat> {
        let inner = self.inner.read().expect("bus lock poisoned");
        inner.flows.values().cloned().collect()
    }

    /// The most recent `n` sends, oldest first.
    pub fn recent_flows(&self, n: usize) -> Vec<FlowRecord> {
        let inner = self.inner.read().expect("bus lock poisoned");
        let skip = inner.recent.len().saturating_sub(n);
        inner.recent.iter().skip(skip).cloned().collect()
    }
}
