//! Presence fan-out scoped to the groups and conversations a user belongs to.
//!
//! There is no unscoped path: every event is addressed to an audience that
//! was resolved from membership for that specific change.

use crate::error::{RelayError, RelayResult, StoreResult};
use crate::gate::DenyReason;
use crate::presence::{PresenceChange, PresenceTracker};
use crate::store::MembershipStore;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Audience {
    Group(String),
    Conversation(String),
}

/// Wire payload. Conversation audiences also carry the conversation id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PresencePayload {
    pub user_id: String,
    pub online: bool,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl PresencePayload {
    fn for_audience(change: &PresenceChange, audience: &Audience) -> Self {
        Self {
            user_id: change.user_id.clone(),
            online: change.online,
            count: change.count,
            conversation_id: match audience {
                Audience::Group(_) => None,
                Audience::Conversation(id) => Some(id.clone()),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("recipient queue full")]
    QueueFull,

    #[error("recipient connection closed")]
    Closed,
}

/// Hands a payload to every live connection of one audience member.
pub trait PresenceOutlet: Send + Sync {
    /// Returns how many connections accepted the event; zero when the member
    /// is offline.
    fn deliver(
        &self,
        recipient_user_id: &str,
        audience: &Audience,
        payload: &PresencePayload,
    ) -> Result<usize, DeliveryError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub audiences: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct ScopedBroadcaster<S: ?Sized> {
    store: Arc<S>,
    outlet: Arc<dyn PresenceOutlet>,
}

impl<S> ScopedBroadcaster<S>
where
    S: MembershipStore + ?Sized,
{
    pub fn new(store: Arc<S>, outlet: Arc<dyn PresenceOutlet>) -> Self {
        Self { store, outlet }
    }

    /// Resolve the audiences of `change.user_id` and deliver to each member.
    /// A failure for one member or one audience is logged and skipped.
    pub async fn publish(&self, change: &PresenceChange) -> StoreResult<BroadcastReport> {
        let mut audiences: Vec<Audience> = self
            .store
            .groups_for_user(&change.user_id)
            .await?
            .into_iter()
            .map(Audience::Group)
            .collect();
        audiences.extend(
            self.store
                .conversations_for_user(&change.user_id)
                .await?
                .into_iter()
                .map(Audience::Conversation),
        );

        let mut report = BroadcastReport::default();
        for audience in &audiences {
            let members = match audience {
                Audience::Group(id) => self.store.group_member_ids(id).await,
                Audience::Conversation(id) => self.store.conversation_member_ids(id).await,
            };
            let members = match members {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, ?audience, "presence audience lookup failed");
                    continue;
                }
            };
            report.audiences += 1;
            let payload = PresencePayload::for_audience(change, audience);
            for member in members {
                match self.outlet.deliver(&member, audience, &payload) {
                    Ok(n) => report.delivered += n,
                    Err(e) => {
                        report.failed += 1;
                        tracing::debug!(error = %e, recipient = %member, ?audience, "presence delivery skipped");
                    }
                }
            }
        }
        Ok(report)
    }

    /// Drain tracker changes one at a time, preserving arrival order.
    pub async fn run(self, mut changes: mpsc::UnboundedReceiver<PresenceChange>) {
        while let Some(change) = changes.recv().await {
            if let Err(e) = self.publish(&change).await {
                tracing::warn!(error = %e, user_id = %change.user_id, "presence broadcast failed");
            }
        }
        tracing::info!("presence broadcaster stopped");
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OnlineMember {
    pub user_id: String,
    pub count: usize,
}

/// Online members of a group with their connection counts, in membership
/// order. Only members of the group may ask.
pub async fn group_snapshot<S>(
    store: &S,
    tracker: &PresenceTracker,
    requester_user_id: &str,
    group_id: &str,
) -> RelayResult<Vec<OnlineMember>>
where
    S: MembershipStore + ?Sized,
{
    if !store.is_group_member(group_id, requester_user_id).await? {
        return Err(RelayError::Unauthorized(DenyReason::NotGroupMember));
    }
    Ok(store
        .group_member_ids(group_id)
        .await?
        .into_iter()
        .filter_map(|user_id| {
            let count = tracker.connection_count(&user_id);
            (count > 0).then_some(OnlineMember { user_id, count })
        })
        .collect())
}
