//! Query/mutate contracts consumed from the key/membership store.
//!
//! The relational backend lives in the service crate; [`memory::MemoryStore`]
//! implements the same contracts in-process for tests and local runs.

pub mod memory;

use crate::error::StoreResult;
use crate::model::{
    Conversation, DeviceKeyRecord, DeviceKeyStatus, DeviceRef, EnvelopeDraft, GroupRole,
    NewDeviceKey, Reader, RefreshRecord, StoredEnvelope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// What an upsert does when the tuple's record is `revoked`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevokedKey {
    Keep,
    Reactivate,
}

/// Bounds of one history page. `since` and `after_seq` are both exclusive
/// and may be combined. `after_seq` names an envelope of the same
/// conversation and resumes strictly after its `(sent_at, seq)` position; an
/// unknown anchor yields an empty page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryWindow {
    pub since: Option<DateTime<Utc>>,
    pub after_seq: Option<i64>,
    pub limit: usize,
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>>;

    async fn is_conversation_member(&self, conversation_id: &str, user_id: &str)
        -> StoreResult<bool>;

    async fn group_role(&self, group_id: &str, user_id: &str) -> StoreResult<Option<GroupRole>>;

    async fn is_group_member(&self, group_id: &str, user_id: &str) -> StoreResult<bool> {
        Ok(self.group_role(group_id, user_id).await?.is_some())
    }

    async fn device_key_status(
        &self,
        group_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> StoreResult<DeviceKeyStatus>;

    /// Every `active` device, in `group_id`, of every member of the conversation.
    async fn active_conversation_devices(
        &self,
        conversation_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<DeviceRef>>;

    /// Insert version 1, or bump `key_version` and set `active` on an existing
    /// row. With [`RevokedKey::Keep`] a revoked row is left untouched and the
    /// call returns `None`; the check and the write are one atomic step.
    async fn upsert_device_key(
        &self,
        key: &NewDeviceKey,
        revoked: RevokedKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeviceKeyRecord>>;

    /// `None` when the tuple has no record. Revoking a revoked record is a no-op.
    async fn revoke_device_key(
        &self,
        group_id: &str,
        device: &DeviceRef,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeviceKeyRecord>>;

    async fn groups_for_user(&self, user_id: &str) -> StoreResult<Vec<String>>;

    async fn conversations_for_user(&self, user_id: &str) -> StoreResult<Vec<String>>;

    async fn group_member_ids(&self, group_id: &str) -> StoreResult<Vec<String>>;

    async fn conversation_member_ids(&self, conversation_id: &str) -> StoreResult<Vec<String>>;

    /// Advance `lastReadAt` to `max(previous, now)`. `None` when the user is
    /// not a member of the conversation.
    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    /// Members joined with their user identity, in membership order.
    async fn list_readers(&self, conversation_id: &str) -> StoreResult<Vec<Reader>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(StoredEnvelope),
    Duplicate,
}

#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Insert-if-absent on `message_id`, atomically with the wrapped keys.
    async fn insert_envelope(
        &self,
        draft: &EnvelopeDraft,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome>;

    /// Envelopes addressed to `device` or sent from it, ordered by
    /// `(sent_at, seq)`, each already reduced to the device's view.
    async fn history(
        &self,
        conversation_id: &str,
        device: &DeviceRef,
        window: HistoryWindow,
    ) -> StoreResult<Vec<StoredEnvelope>>;

    async fn envelope_by_message_id(&self, message_id: &str)
        -> StoreResult<Option<StoredEnvelope>>;

    /// Sets the soft-delete marker once; later calls keep the first timestamp.
    async fn soft_delete(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_refresh(&self, record: &RefreshRecord) -> StoreResult<()>;

    async fn find_refresh(&self, token_hash: &str) -> StoreResult<Option<RefreshRecord>>;

    /// `true` when a row was removed. Used for both logout and rotation, so a
    /// concurrent second use of the same credential loses the race.
    async fn delete_refresh(&self, token_hash: &str) -> StoreResult<bool>;
}

/// Everything the relay needs from one backend.
pub trait RelayStore: MembershipStore + EnvelopeStore + CredentialStore {}

impl<T: MembershipStore + EnvelopeStore + CredentialStore> RelayStore for T {}
