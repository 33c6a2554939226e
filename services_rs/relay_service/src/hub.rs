//! Live SSE connections, indexed by user so presence and message fan-out
//! only touch the recipient's own queues.

use crate::models::EnvelopeOut;
use dashmap::DashMap;
use relay_core::broadcast::{Audience, DeliveryError, PresenceOutlet, PresencePayload};
use relay_core::model::{DeviceRef, StoredEnvelope};
use relay_core::presence::{ConnectionId, PresenceTracker};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Ready {
        connection_id: u64,
        user_id: String,
        device_id: String,
    },
    Presence {
        #[serde(skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
        #[serde(flatten)]
        presence: PresencePayload,
    },
    Message {
        envelope: EnvelopeOut,
    },
}

impl HubEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Presence { .. } => "presence",
            Self::Message { .. } => "message",
        }
    }
}

struct Handle {
    device_id: String,
    tx: mpsc::Sender<HubEvent>,
}

pub struct Hub {
    next_id: AtomicU64,
    buffer: usize,
    users: DashMap<String, HashMap<ConnectionId, Handle>>,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            users: DashMap::new(),
        }
    }

    /// Register a connection and mark it present. The returned guard undoes
    /// both when dropped.
    pub fn connect(
        self: &Arc<Self>,
        tracker: &Arc<PresenceTracker>,
        device: DeviceRef,
    ) -> (ConnectionGuard, mpsc::Receiver<HubEvent>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = tx.try_send(HubEvent::Ready {
            connection_id: id.0,
            user_id: device.user_id.clone(),
            device_id: device.device_id.clone(),
        });
        self.users.entry(device.user_id.clone()).or_default().insert(
            id,
            Handle {
                device_id: device.device_id.clone(),
                tx,
            },
        );
        let change = tracker.on_connect(&device.user_id, id);
        tracing::info!(
            user_id = %device.user_id,
            device_id = %device.device_id,
            connection = %id,
            count = change.count,
            "event stream connected"
        );
        (
            ConnectionGuard {
                hub: self.clone(),
                tracker: tracker.clone(),
                device,
                id,
            },
            rx,
        )
    }

    fn remove(&self, user_id: &str, id: ConnectionId) {
        if let Some(mut conns) = self.users.get_mut(user_id) {
            conns.remove(&id);
        }
        self.users.remove_if(user_id, |_, conns| conns.is_empty());
    }

    pub fn connection_count(&self) -> usize {
        self.users.iter().map(|e| e.value().len()).sum()
    }

    /// Push a stored envelope to every connected device holding a wrapped
    /// key for it. Each device sees only its own key. Returns the number of
    /// queues that accepted it.
    pub fn deliver_envelope(&self, envelope: &StoredEnvelope) -> usize {
        let mut delivered = 0;
        for w in &envelope.wrapped_keys {
            let Some(conns) = self.users.get(&w.user_id) else {
                continue;
            };
            let device = w.device();
            let view = EnvelopeOut::from(&envelope.view_for(&device));
            for (id, handle) in conns.iter().filter(|(_, h)| h.device_id == w.device_id) {
                match handle.tx.try_send(HubEvent::Message {
                    envelope: view.clone(),
                }) {
                    Ok(()) => delivered += 1,
                    Err(e) => tracing::warn!(
                        error = %e,
                        connection = %id,
                        message_id = %envelope.message_id,
                        "message delivery dropped"
                    ),
                }
            }
        }
        delivered
    }
}

impl PresenceOutlet for Hub {
    fn deliver(
        &self,
        recipient_user_id: &str,
        audience: &Audience,
        payload: &PresencePayload,
    ) -> Result<usize, DeliveryError> {
        let Some(conns) = self.users.get(recipient_user_id) else {
            return Ok(0);
        };
        let group_id = match audience {
            Audience::Group(id) => Some(id.clone()),
            Audience::Conversation(_) => None,
        };
        let mut delivered = 0;
        let mut last_err = None;
        for handle in conns.values() {
            let event = HubEvent::Presence {
                group_id: group_id.clone(),
                presence: payload.clone(),
            };
            match handle.tx.try_send(event) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => last_err = Some(DeliveryError::QueueFull),
                Err(TrySendError::Closed(_)) => last_err = Some(DeliveryError::Closed),
            }
        }
        match last_err {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(delivered),
        }
    }
}

/// Owned by the SSE stream. Dropping it (client gone, server shutdown)
/// removes the connection and reports the disconnect exactly once.
pub struct ConnectionGuard {
    hub: Arc<Hub>,
    tracker: Arc<PresenceTracker>,
    device: DeviceRef,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.remove(&self.device.user_id, self.id);
        let count = self
            .tracker
            .on_disconnect(&self.device.user_id, self.id)
            .map(|c| c.count)
            .unwrap_or(0);
        tracing::info!(
            user_id = %self.device.user_id,
            device_id = %self.device.device_id,
            connection = %self.id,
            count,
            "event stream disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::model::WrappedKey;

    fn envelope() -> StoredEnvelope {
        StoredEnvelope {
            id: "e1".to_string(),
            seq: 1,
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender_user_id: "alice".to_string(),
            sender_device_id: "a1".to_string(),
            ephemeral_key: vec![1; 32],
            iv: vec![2; 12],
            ciphertext: vec![3; 8],
            wrapped_keys: vec![
                WrappedKey {
                    user_id: "bob".to_string(),
                    device_id: "b1".to_string(),
                    wrapped_key: vec![4; 48],
                    nonce: vec![5; 12],
                },
                WrappedKey {
                    user_id: "bob".to_string(),
                    device_id: "b2".to_string(),
                    wrapped_key: vec![6; 48],
                    nonce: vec![7; 12],
                },
            ],
            signature: vec![8; 64],
            sent_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn guard_drop_disconnects_presence_and_hub() {
        let hub = Arc::new(Hub::new(8));
        let tracker = Arc::new(PresenceTracker::new());
        let (guard, mut rx) = hub.connect(&tracker, DeviceRef::new("bob", "b1"));
        assert!(matches!(rx.recv().await, Some(HubEvent::Ready { .. })));
        assert!(tracker.is_online("bob"));
        assert_eq!(hub.connection_count(), 1);

        drop(guard);
        assert!(!tracker.is_online("bob"));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn envelope_reaches_each_device_with_only_its_key() {
        let hub = Arc::new(Hub::new(8));
        let tracker = Arc::new(PresenceTracker::new());
        let (_g1, mut rx1) = hub.connect(&tracker, DeviceRef::new("bob", "b1"));
        let (_g2, mut rx2) = hub.connect(&tracker, DeviceRef::new("bob", "b2"));
        let (_g3, mut rx3) = hub.connect(&tracker, DeviceRef::new("eve", "e1"));
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let _ = rx.recv().await;
        }

        assert_eq!(hub.deliver_envelope(&envelope()), 2);

        let Some(HubEvent::Message { envelope }) = rx1.recv().await else {
            panic!("expected message on b1");
        };
        assert_eq!(envelope.wrapped_keys.len(), 1);
        assert_eq!(envelope.wrapped_keys[0].device_id, "b1");

        let Some(HubEvent::Message { envelope }) = rx2.recv().await else {
            panic!("expected message on b2");
        };
        assert_eq!(envelope.wrapped_keys[0].device_id, "b2");

        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_reports_queue_full_instead_of_blocking() {
        let hub = Arc::new(Hub::new(1));
        let tracker = Arc::new(PresenceTracker::new());
        let (_g, _rx) = hub.connect(&tracker, DeviceRef::new("bob", "b1"));
        let payload = PresencePayload {
            user_id: "alice".to_string(),
            online: true,
            count: 1,
            conversation_id: None,
        };
        let err = hub
            .deliver("bob", &Audience::Group("g1".to_string()), &payload)
            .expect_err("ready event fills the queue");
        assert!(matches!(err, DeliveryError::QueueFull));
        assert_eq!(
            hub.deliver("nobody", &Audience::Group("g1".to_string()), &payload)
                .expect("offline"),
            0
        );
    }

    #[test]
    fn presence_event_wire_shape() {
        let ev = HubEvent::Presence {
            group_id: None,
            presence: PresencePayload {
                user_id: "alice".to_string(),
                online: false,
                count: 0,
                conversation_id: Some("c1".to_string()),
            },
        };
        let v = serde_json::to_value(&ev).expect("json");
        assert_eq!(
            v,
            serde_json::json!({
                "type": "presence",
                "user_id": "alice",
                "online": false,
                "count": 0,
                "conversation_id": "c1"
            })
        );
        assert_eq!(ev.name(), "presence");
    }
}
