//! Session event types and per-session fan-out
//!
//! Events are JSON-framed as `{"event": "...", "data": {...}}` on the
//! wire. Fan-out uses a broadcast channel: late subscribers receive only
//! future events (history is fetched from the conversation store), and a
//! subscriber that falls more than the buffer behind is disconnected
//! rather than allowed to stall the producer.

use parley_core::{MessageRowId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Ordered streaming events for one session.
///
/// For a given pending `message_id` the order is always
/// `agent.start` → `agent.chunk*` → (`agent.end` | `agent.error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// A persona began generating a reply.
    #[serde(rename = "agent.start")]
    AgentStart {
        message_id: String,
        sender: String,
        session_id: String,
        timestamp: Timestamp,
    },

    /// One streamed fragment of the pending reply.
    #[serde(rename = "agent.chunk")]
    AgentChunk {
        message_id: String,
        sender: String,
        content: String,
    },

    /// Terminal success event carrying the assembled reply. The
    /// persisted id is absent when nothing was committed (cancelled or
    /// empty replies).
    #[serde(rename = "agent.end")]
    AgentEnd {
        message_id: String,
        sender: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        persisted_message_id: Option<MessageRowId>,
        timestamp: Timestamp,
    },

    /// Terminal failure event for one persona's reply; the turn moves on
    /// to the next speaker.
    #[serde(rename = "agent.error")]
    AgentError {
        message_id: String,
        sender: String,
        reason: String,
    },

    /// A user-authored message was committed to the log.
    #[serde(rename = "message.new")]
    MessageNew {
        message_id: MessageRowId,
        sender: String,
        content: String,
        timestamp: Timestamp,
    },

    /// A session-level failure outside any single reply.
    #[serde(rename = "system.error")]
    SystemError { reason: String },
}

impl SessionEvent {
    /// Event name for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::AgentStart { .. } => "agent.start",
            SessionEvent::AgentChunk { .. } => "agent.chunk",
            SessionEvent::AgentEnd { .. } => "agent.end",
            SessionEvent::AgentError { .. } => "agent.error",
            SessionEvent::MessageNew { .. } => "message.new",
            SessionEvent::SystemError { .. } => "system.error",
        }
    }
}

/// Per-session publish/subscribe channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// `capacity` bounds how far a subscriber may lag before it starts
    /// losing events (and gets disconnected by the WS layer).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Non-blocking publish. Dropped silently when nobody subscribes.
    pub fn publish(&self, event: SessionEvent) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(event_type, receivers, "published session event");
            }
            Err(_) => {
                debug!(event_type, "no subscribers for session event");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_wire_frame_shape() {
        let event = SessionEvent::AgentChunk {
            message_id: "bob_0a1b2c3d".to_string(),
            sender: "bob".to_string(),
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "agent.chunk");
        assert_eq!(json["data"]["sender"], "bob");

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_agent_end_omits_absent_persisted_id() {
        let event = SessionEvent::AgentEnd {
            message_id: "bob_0a1b2c3d".to_string(),
            sender: "bob".to_string(),
            content: String::new(),
            persisted_message_id: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["data"].get("persisted_message_id").is_none());
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(SessionEvent::SystemError {
            reason: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        for i in 0..3 {
            bus.publish(SessionEvent::AgentChunk {
                message_id: "m".to_string(),
                sender: "bob".to_string(),
                content: format!("c{}", i),
            });
        }
        for i in 0..3 {
            match rx.recv().await.unwrap() {
                SessionEvent::AgentChunk { content, .. } => {
                    assert_eq!(content, format!("c{}", i));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_future_events() {
        let bus = EventBus::new(8);
        bus.publish(SessionEvent::SystemError {
            reason: "before".to_string(),
        });
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::SystemError {
            reason: "after".to_string(),
        });
        match rx.recv().await.unwrap() {
            SessionEvent::SystemError { reason } => assert_eq!(reason, "after"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(SessionEvent::AgentChunk {
                message_id: "m".to_string(),
                sender: "bob".to_string(),
                content: format!("c{}", i),
            });
        }
        // The first recv reports the overflow.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 1),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
