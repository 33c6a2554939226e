//! Authorization gate for fan-out sends plus the read-receipt projections.
//!
//! Every function here is evaluative against the store and holds no
//! in-process state, so concurrent callers never contend on anything but the
//! store itself.

use crate::error::{RelayError, RelayResult, StoreResult};
use crate::model::{Conversation, DeviceKeyStatus, DeviceRef, Reader};
use crate::store::MembershipStore;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenyReason {
    ConversationNotFound,
    ConversationGroupMismatch,
    SenderNotMember,
    SenderDeviceRevoked,
    SenderDeviceUnknown,
    RecipientNotMember(DeviceRef),
    RecipientDeviceRevoked(DeviceRef),
    RecipientDeviceUnknown(DeviceRef),
    NotGroupMember,
    NotPermitted,
    DeviceRevoked,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConversationNotFound => "conversation_not_found",
            Self::ConversationGroupMismatch => "conversation_group_mismatch",
            Self::SenderNotMember => "sender_not_member",
            Self::SenderDeviceRevoked => "sender_device_revoked",
            Self::SenderDeviceUnknown => "sender_device_unknown",
            Self::RecipientNotMember(_) => "recipient_not_member",
            Self::RecipientDeviceRevoked(_) => "recipient_device_revoked",
            Self::RecipientDeviceUnknown(_) => "recipient_device_unknown",
            Self::NotGroupMember => "not_group_member",
            Self::NotPermitted => "not_permitted",
            Self::DeviceRevoked => "device_revoked",
        }
    }

    /// A missing conversation is `NotFound`; everything else is `Unauthorized`.
    pub fn into_error(self) -> RelayError {
        match self {
            Self::ConversationNotFound => RelayError::NotFound("conversation"),
            reason => RelayError::Unauthorized(reason),
        }
    }

    fn sender_key(status: DeviceKeyStatus) -> Option<Self> {
        match status {
            DeviceKeyStatus::Active => None,
            DeviceKeyStatus::Revoked => Some(Self::SenderDeviceRevoked),
            DeviceKeyStatus::Absent => Some(Self::SenderDeviceUnknown),
        }
    }

    fn recipient_key(status: DeviceKeyStatus, device: &DeviceRef) -> Option<Self> {
        match status {
            DeviceKeyStatus::Active => None,
            DeviceKeyStatus::Revoked => Some(Self::RecipientDeviceRevoked(device.clone())),
            DeviceKeyStatus::Absent => Some(Self::RecipientDeviceUnknown(device.clone())),
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Lift a denial into the error taxonomy.
    pub fn into_result(self) -> RelayResult<()> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(reason) => Err(reason.into_error()),
        }
    }
}

/// Decide whether `sender` may fan out to `recipients` in the conversation.
///
/// Checks run in a fixed order and stop at the first failure:
/// conversation/group binding, sender membership, sender key status, then
/// each recipient's membership and key status. One bad recipient denies the
/// whole request.
pub async fn authorize_send<S>(
    store: &S,
    sender: &DeviceRef,
    group_id: &str,
    conversation_id: &str,
    recipients: &[DeviceRef],
) -> StoreResult<Decision>
where
    S: MembershipStore + ?Sized,
{
    let conversation = match conversation_in_group(store, conversation_id, group_id).await? {
        Ok(c) => c,
        Err(reason) => return Ok(Decision::Deny(reason)),
    };

    if !store
        .is_conversation_member(&conversation.id, &sender.user_id)
        .await?
    {
        return Ok(Decision::Deny(DenyReason::SenderNotMember));
    }

    let status = store
        .device_key_status(group_id, &sender.user_id, &sender.device_id)
        .await?;
    if let Some(reason) = DenyReason::sender_key(status) {
        return Ok(Decision::Deny(reason));
    }

    for recipient in recipients {
        if !store
            .is_conversation_member(&conversation.id, &recipient.user_id)
            .await?
        {
            return Ok(Decision::Deny(DenyReason::RecipientNotMember(
                recipient.clone(),
            )));
        }
        let status = store
            .device_key_status(group_id, &recipient.user_id, &recipient.device_id)
            .await?;
        if let Some(reason) = DenyReason::recipient_key(status, recipient) {
            return Ok(Decision::Deny(reason));
        }
    }

    Ok(Decision::Allow)
}

pub async fn can_send<S>(
    store: &S,
    sender: &DeviceRef,
    group_id: &str,
    conversation_id: &str,
    recipients: &[DeviceRef],
) -> StoreResult<bool>
where
    S: MembershipStore + ?Sized,
{
    Ok(authorize_send(store, sender, group_id, conversation_id, recipients)
        .await?
        .is_allowed())
}

/// Read access to a conversation's history: the device must belong to a
/// member and hold an active key in the owning group.
pub async fn authorize_read<S>(
    store: &S,
    device: &DeviceRef,
    conversation_id: &str,
) -> StoreResult<Result<Conversation, DenyReason>>
where
    S: MembershipStore + ?Sized,
{
    let Some(conversation) = store.conversation(conversation_id).await? else {
        return Ok(Err(DenyReason::ConversationNotFound));
    };
    if !store
        .is_conversation_member(conversation_id, &device.user_id)
        .await?
    {
        return Ok(Err(DenyReason::SenderNotMember));
    }
    let status = store
        .device_key_status(&conversation.group_id, &device.user_id, &device.device_id)
        .await?;
    if let Some(reason) = DenyReason::sender_key(status) {
        return Ok(Err(reason));
    }
    Ok(Ok(conversation))
}

async fn conversation_in_group<S>(
    store: &S,
    conversation_id: &str,
    group_id: &str,
) -> StoreResult<Result<Conversation, DenyReason>>
where
    S: MembershipStore + ?Sized,
{
    let Some(conversation) = store.conversation(conversation_id).await? else {
        return Ok(Err(DenyReason::ConversationNotFound));
    };
    if conversation.group_id != group_id {
        return Ok(Err(DenyReason::ConversationGroupMismatch));
    }
    Ok(Ok(conversation))
}

/// Set `lastReadAt` for the membership row to server time and return it.
/// The stored value never moves backwards.
pub async fn mark_conversation_read<S>(
    store: &S,
    conversation_id: &str,
    user_id: &str,
) -> RelayResult<DateTime<Utc>>
where
    S: MembershipStore + ?Sized,
{
    store
        .mark_read(conversation_id, user_id, Utc::now())
        .await?
        .ok_or(RelayError::NotFound("conversation membership"))
}

/// Membership joined to user identity. Callers establish that the requester
/// is a member before exposing this.
pub async fn list_readers<S>(store: &S, conversation_id: &str) -> RelayResult<Vec<Reader>>
where
    S: MembershipStore + ?Sized,
{
    Ok(store.list_readers(conversation_id).await?)
}
