//! Live-connection presence, process-local and rebuilt empty on restart.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One connect or disconnect as seen by the tracker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PresenceChange {
    pub user_id: String,
    pub online: bool,
    pub count: usize,
}

/// `userId -> set<connectionId>` on a sharded map: one user's updates are
/// serialized by its shard entry, different users proceed independently.
///
/// When a notifier is attached, each change is queued while the entry is
/// still held, so the queue sees one user's changes in the order they were
/// applied.
#[derive(Default)]
pub struct PresenceTracker {
    sessions: DashMap<String, HashSet<ConnectionId>>,
    notifier: Option<mpsc::UnboundedSender<PresenceChange>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(notifier: mpsc::UnboundedSender<PresenceChange>) -> Self {
        Self {
            sessions: DashMap::new(),
            notifier: Some(notifier),
        }
    }

    pub fn on_connect(&self, user_id: &str, connection: ConnectionId) -> PresenceChange {
        let mut set = self.sessions.entry(user_id.to_string()).or_default();
        set.insert(connection);
        let change = PresenceChange {
            user_id: user_id.to_string(),
            online: true,
            count: set.len(),
        };
        self.notify(&change);
        change
    }

    /// Unknown users and unknown connections are ignored: transport teardown
    /// can race with cleanup.
    pub fn on_disconnect(&self, user_id: &str, connection: ConnectionId) -> Option<PresenceChange> {
        let Entry::Occupied(mut entry) = self.sessions.entry(user_id.to_string()) else {
            return None;
        };
        if !entry.get_mut().remove(&connection) {
            return None;
        }
        let count = entry.get().len();
        let change = PresenceChange {
            user_id: user_id.to_string(),
            online: count > 0,
            count,
        };
        self.notify(&change);
        if count == 0 {
            entry.remove();
        }
        Some(change)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.sessions.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn online_user_count(&self) -> usize {
        self.sessions.len()
    }

    fn notify(&self, change: &PresenceChange) {
        if let Some(tx) = &self.notifier {
            if tx.send(change.clone()).is_err() {
                tracing::warn!(user_id = %change.user_id, "presence queue closed; change dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn two_connections_then_both_disconnect() {
        let tracker = PresenceTracker::new();
        let c1 = tracker.on_connect("u", ConnectionId(1));
        let c2 = tracker.on_connect("u", ConnectionId(2));
        assert_eq!((c1.online, c1.count), (true, 1));
        assert_eq!((c2.online, c2.count), (true, 2));
        assert!(tracker.is_online("u"));
        assert_eq!(tracker.connection_count("u"), 2);

        let d1 = tracker.on_disconnect("u", ConnectionId(1)).expect("known");
        assert_eq!((d1.online, d1.count), (true, 1));
        assert!(tracker.is_online("u"));

        let d2 = tracker.on_disconnect("u", ConnectionId(2)).expect("known");
        assert_eq!((d2.online, d2.count), (false, 0));
        assert!(!tracker.is_online("u"));
        assert_eq!(tracker.online_user_count(), 0);
    }

    #[test]
    fn disconnect_for_unknown_user_or_connection_is_a_noop() {
        let tracker = PresenceTracker::new();
        assert!(tracker.on_disconnect("ghost", ConnectionId(9)).is_none());
        tracker.on_connect("u", ConnectionId(1));
        assert!(tracker.on_disconnect("u", ConnectionId(2)).is_none());
        assert!(tracker.is_online("u"));
    }

    #[test]
    fn every_change_is_queued_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = PresenceTracker::with_notifier(tx);
        tracker.on_connect("u", ConnectionId(1));
        tracker.on_connect("u", ConnectionId(2));
        tracker.on_disconnect("u", ConnectionId(2));
        tracker.on_disconnect("u", ConnectionId(1));
        tracker.on_disconnect("u", ConnectionId(1));

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            seen.push((change.online, change.count));
        }
        assert_eq!(seen, vec![(true, 1), (true, 2), (true, 1), (false, 0)]);
    }

    #[test]
    fn concurrent_connects_and_disconnects_do_not_lose_updates() {
        let tracker = Arc::new(PresenceTracker::new());
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200u64 {
                    let id = ConnectionId(t * 1000 + i);
                    tracker.on_connect("shared", id);
                    tracker.on_connect(&format!("solo-{t}"), id);
                    tracker.on_disconnect("shared", id);
                }
            }));
        }
        for h in handles {
            h.join().expect("worker");
        }
        assert!(!tracker.is_online("shared"));
        for t in 0..8u64 {
            assert_eq!(tracker.connection_count(&format!("solo-{t}")), 200);
        }
    }
}
