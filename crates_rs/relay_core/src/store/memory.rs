use super::{
    CredentialStore, EnvelopeStore, HistoryWindow, InsertOutcome, MembershipStore, RevokedKey,
};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    Conversation, ConversationKind, DeviceKeyRecord, DeviceKeyStatus, DeviceRef, EnvelopeDraft,
    GroupRole, KeyStatus, NewDeviceKey, Reader, RefreshRecord, StoredEnvelope,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct UserRow {
    username: String,
}

#[derive(Debug, Clone)]
struct GroupMemberRow {
    group_id: String,
    user_id: String,
    role: GroupRole,
}

#[derive(Debug, Clone)]
struct ConversationMemberRow {
    conversation_id: String,
    user_id: String,
    last_read_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserRow>,
    groups: HashMap<String, String>,
    group_members: Vec<GroupMemberRow>,
    conversations: HashMap<String, Conversation>,
    conversation_members: Vec<ConversationMemberRow>,
    keys: HashMap<(String, String, String), DeviceKeyRecord>,
    envelopes: Vec<StoredEnvelope>,
    by_message_id: HashMap<String, usize>,
    refresh: HashMap<String, RefreshRecord>,
    next_seq: i64,
}

impl Inner {
    fn is_conversation_member(&self, conversation_id: &str, user_id: &str) -> bool {
        self.conversation_members
            .iter()
            .any(|m| m.conversation_id == conversation_id && m.user_id == user_id)
    }
}

/// Process-local store with the same contracts as the relational backend.
/// Rows are kept in insertion order so membership order is observable.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as a backend outage until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory store unavailable".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))
    }

    pub fn add_user(&self, user_id: &str, username: &str) -> StoreResult<()> {
        let mut g = self.lock()?;
        g.users.insert(
            user_id.to_string(),
            UserRow {
                username: username.to_string(),
            },
        );
        Ok(())
    }

    pub fn add_group(&self, group_id: &str, name: &str) -> StoreResult<()> {
        let mut g = self.lock()?;
        g.groups.insert(group_id.to_string(), name.to_string());
        Ok(())
    }

    pub fn add_group_member(&self, group_id: &str, user_id: &str, role: GroupRole) -> StoreResult<()> {
        let mut g = self.lock()?;
        if let Some(row) = g
            .group_members
            .iter_mut()
            .find(|m| m.group_id == group_id && m.user_id == user_id)
        {
            row.role = role;
            return Ok(());
        }
        g.group_members.push(GroupMemberRow {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            role,
        });
        Ok(())
    }

    /// Conversations have a fixed membership list at creation.
    pub fn add_conversation(
        &self,
        conversation_id: &str,
        group_id: &str,
        kind: ConversationKind,
        members: &[&str],
    ) -> StoreResult<()> {
        let mut g = self.lock()?;
        g.conversations.insert(
            conversation_id.to_string(),
            Conversation {
                id: conversation_id.to_string(),
                group_id: group_id.to_string(),
                kind,
            },
        );
        for user_id in members {
            if g.is_conversation_member(conversation_id, user_id) {
                continue;
            }
            g.conversation_members.push(ConversationMemberRow {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                last_read_at: None,
            });
        }
        Ok(())
    }

    pub fn envelope_count(&self) -> StoreResult<usize> {
        Ok(self.lock()?.envelopes.len())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self.lock()?.conversations.get(conversation_id).cloned())
    }

    async fn is_conversation_member(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> StoreResult<bool> {
        Ok(self.lock()?.is_conversation_member(conversation_id, user_id))
    }

    async fn group_role(&self, group_id: &str, user_id: &str) -> StoreResult<Option<GroupRole>> {
        Ok(self
            .lock()?
            .group_members
            .iter()
            .find(|m| m.group_id == group_id && m.user_id == user_id)
            .map(|m| m.role))
    }

    async fn device_key_status(
        &self,
        group_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> StoreResult<DeviceKeyStatus> {
        let g = self.lock()?;
        let key = (
            group_id.to_string(),
            user_id.to_string(),
            device_id.to_string(),
        );
        Ok(g.keys.get(&key).map(|r| r.status).into())
    }

    async fn active_conversation_devices(
        &self,
        conversation_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<DeviceRef>> {
        let g = self.lock()?;
        let mut out: Vec<DeviceRef> = g
            .keys
            .values()
            .filter(|r| r.group_id == group_id && r.status == KeyStatus::Active)
            .filter(|r| g.is_conversation_member(conversation_id, &r.user_id))
            .map(|r| DeviceRef::new(r.user_id.clone(), r.device_id.clone()))
            .collect();
        out.sort();
        Ok(out)
    }

    async fn upsert_device_key(
        &self,
        key: &NewDeviceKey,
        revoked: RevokedKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeviceKeyRecord>> {
        let mut g = self.lock()?;
        let k = (
            key.group_id.clone(),
            key.device.user_id.clone(),
            key.device.device_id.clone(),
        );
        let existing = g.keys.get(&k);
        if revoked == RevokedKey::Keep
            && existing.is_some_and(|r| r.status == KeyStatus::Revoked)
        {
            return Ok(None);
        }
        let version = existing.map(|r| r.key_version + 1).unwrap_or(1);
        let rec = DeviceKeyRecord {
            group_id: key.group_id.clone(),
            user_id: key.device.user_id.clone(),
            device_id: key.device.device_id.clone(),
            signing_key: key.signing_key.clone(),
            exchange_key: key.exchange_key.clone(),
            key_version: version,
            status: KeyStatus::Active,
            updated_at: now,
        };
        g.keys.insert(k, rec.clone());
        Ok(Some(rec))
    }

    async fn revoke_device_key(
        &self,
        group_id: &str,
        device: &DeviceRef,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeviceKeyRecord>> {
        let mut g = self.lock()?;
        let k = (
            group_id.to_string(),
            device.user_id.clone(),
            device.device_id.clone(),
        );
        let Some(rec) = g.keys.get_mut(&k) else {
            return Ok(None);
        };
        if rec.status == KeyStatus::Active {
            rec.status = KeyStatus::Revoked;
            rec.updated_at = now;
        }
        Ok(Some(rec.clone()))
    }

    async fn groups_for_user(&self, user_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .group_members
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.group_id.clone())
            .collect())
    }

    async fn conversations_for_user(&self, user_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .conversation_members
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.conversation_id.clone())
            .collect())
    }

    async fn group_member_ids(&self, group_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .group_members
            .iter()
            .filter(|m| m.group_id == group_id)
            .map(|m| m.user_id.clone())
            .collect())
    }

    async fn conversation_member_ids(&self, conversation_id: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .conversation_members
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.user_id.clone())
            .collect())
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut g = self.lock()?;
        let Some(row) = g
            .conversation_members
            .iter_mut()
            .find(|m| m.conversation_id == conversation_id && m.user_id == user_id)
        else {
            return Ok(None);
        };
        let next = match row.last_read_at {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        row.last_read_at = Some(next);
        Ok(Some(next))
    }

    async fn list_readers(&self, conversation_id: &str) -> StoreResult<Vec<Reader>> {
        let g = self.lock()?;
        Ok(g.conversation_members
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| Reader {
                user_id: m.user_id.clone(),
                username: g
                    .users
                    .get(&m.user_id)
                    .map(|u| u.username.clone())
                    .unwrap_or_default(),
                last_read_at: m.last_read_at,
            })
            .collect())
    }
}

#[async_trait]
impl EnvelopeStore for MemoryStore {
    async fn insert_envelope(
        &self,
        draft: &EnvelopeDraft,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome> {
        let mut g = self.lock()?;
        if g.by_message_id.contains_key(&draft.message_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        g.next_seq += 1;
        let stored = StoredEnvelope {
            id: Uuid::new_v4().to_string(),
            seq: g.next_seq,
            message_id: draft.message_id.clone(),
            conversation_id: draft.conversation_id.clone(),
            sender_user_id: draft.sender.user_id.clone(),
            sender_device_id: draft.sender.device_id.clone(),
            ephemeral_key: draft.ephemeral_key.clone(),
            iv: draft.iv.clone(),
            ciphertext: draft.ciphertext.clone(),
            wrapped_keys: draft.wrapped_keys.clone(),
            signature: draft.signature.clone(),
            sent_at,
            deleted_at: None,
        };
        let idx = g.envelopes.len();
        g.envelopes.push(stored.clone());
        g.by_message_id.insert(draft.message_id.clone(), idx);
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn history(
        &self,
        conversation_id: &str,
        device: &DeviceRef,
        window: HistoryWindow,
    ) -> StoreResult<Vec<StoredEnvelope>> {
        let g = self.lock()?;
        let anchor = match window.after_seq {
            Some(seq) => match g
                .envelopes
                .iter()
                .find(|e| e.seq == seq && e.conversation_id == conversation_id)
            {
                Some(e) => Some((e.sent_at, e.seq)),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let mut rows: Vec<&StoredEnvelope> = g
            .envelopes
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .filter(|e| window.since.map_or(true, |s| e.sent_at > s))
            .filter(|e| anchor.map_or(true, |a| (e.sent_at, e.seq) > a))
            .filter(|e| e.visible_to(device))
            .collect();
        rows.sort_by_key(|e| (e.sent_at, e.seq));
        Ok(rows
            .into_iter()
            .take(window.limit)
            .map(|e| e.view_for(device))
            .collect())
    }

    async fn envelope_by_message_id(
        &self,
        message_id: &str,
    ) -> StoreResult<Option<StoredEnvelope>> {
        let g = self.lock()?;
        Ok(g
            .by_message_id
            .get(message_id)
            .and_then(|idx| g.envelopes.get(*idx))
            .cloned())
    }

    async fn soft_delete(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let mut g = self.lock()?;
        let Some(idx) = g.by_message_id.get(message_id).copied() else {
            return Ok(None);
        };
        let Some(env) = g.envelopes.get_mut(idx) else {
            return Ok(None);
        };
        let marker = *env.deleted_at.get_or_insert(now);
        Ok(Some(marker))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_refresh(&self, record: &RefreshRecord) -> StoreResult<()> {
        let mut g = self.lock()?;
        g.refresh.insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn find_refresh(&self, token_hash: &str) -> StoreResult<Option<RefreshRecord>> {
        Ok(self.lock()?.refresh.get(token_hash).cloned())
    }

    async fn delete_refresh(&self, token_hash: &str) -> StoreResult<bool> {
        Ok(self.lock()?.refresh.remove(token_hash).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft(message_id: &str) -> EnvelopeDraft {
        EnvelopeDraft {
            message_id: message_id.to_string(),
            group_id: "g1".to_string(),
            conversation_id: "c1".to_string(),
            sender: DeviceRef::new("a", "a1"),
            ephemeral_key: vec![0; 32],
            iv: vec![0; 12],
            ciphertext: vec![1, 2, 3],
            wrapped_keys: vec![crate::model::WrappedKey {
                user_id: "b".to_string(),
                device_id: "b1".to_string(),
                wrapped_key: vec![9; 48],
                nonce: vec![0; 12],
            }],
            signature: vec![0; 64],
        }
    }

    fn window(after_seq: Option<i64>, limit: usize) -> HistoryWindow {
        HistoryWindow {
            since: None,
            after_seq,
            limit,
        }
    }

    #[tokio::test]
    async fn key_versions_only_move_forward() {
        let store = MemoryStore::new();
        let key = NewDeviceKey {
            group_id: "g1".to_string(),
            device: DeviceRef::new("a", "a1"),
            signing_key: vec![1; 32],
            exchange_key: vec![2; 32],
        };
        let now = Utc::now();
        let v1 = store
            .upsert_device_key(&key, RevokedKey::Keep, now)
            .await
            .expect("v1")
            .expect("inserted");
        assert_eq!(v1.key_version, 1);
        let revoked = store
            .revoke_device_key("g1", &key.device, now)
            .await
            .expect("revoke")
            .expect("record");
        assert_eq!(revoked.status, KeyStatus::Revoked);
        assert_eq!(revoked.key_version, 1);

        let kept = store
            .upsert_device_key(&key, RevokedKey::Keep, now)
            .await
            .expect("keep");
        assert_eq!(kept, None);

        let v2 = store
            .upsert_device_key(&key, RevokedKey::Reactivate, now)
            .await
            .expect("v2")
            .expect("reactivated");
        assert_eq!(v2.key_version, 2);
        assert_eq!(v2.status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn history_orders_by_sent_at_then_insertion() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.insert_envelope(&draft("m2"), t0).await.expect("m2");
        store.insert_envelope(&draft("m3"), t0).await.expect("m3");
        store
            .insert_envelope(&draft("m1"), t0 - Duration::seconds(5))
            .await
            .expect("m1");

        let rows = store
            .history("c1", &DeviceRef::new("b", "b1"), window(None, 10))
            .await
            .expect("history");
        let ids: Vec<&str> = rows.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let other = store
            .history("c1", &DeviceRef::new("c", "c1"), window(None, 10))
            .await
            .expect("history");
        assert!(other.is_empty());

        let sender = store
            .history("c1", &DeviceRef::new("a", "a1"), window(None, 10))
            .await
            .expect("sender history");
        assert_eq!(sender.len(), 3);
        assert!(sender.iter().all(|e| e.wrapped_keys.is_empty()));
    }

    #[tokio::test]
    async fn seq_cursor_resumes_inside_a_timestamp_tie() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        for id in ["m1", "m2", "m3"] {
            store.insert_envelope(&draft(id), t0).await.expect("insert");
        }
        let bob = DeviceRef::new("b", "b1");

        let mut seen = Vec::new();
        let mut after_seq = None;
        loop {
            let page = store
                .history("c1", &bob, window(after_seq, 1))
                .await
                .expect("page");
            let Some(last) = page.last() else { break };
            after_seq = Some(last.seq);
            seen.extend(page.iter().map(|e| e.message_id.clone()));
        }
        assert_eq!(seen, vec!["m1", "m2", "m3"]);

        let unknown = store
            .history("c1", &bob, window(Some(999), 10))
            .await
            .expect("unknown anchor");
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn soft_delete_keeps_first_marker() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.insert_envelope(&draft("m1"), t0).await.expect("insert");
        let first = store.soft_delete("m1", t0).await.expect("delete");
        let second = store
            .soft_delete("m1", t0 + Duration::seconds(30))
            .await
            .expect("delete again");
        assert_eq!(first, Some(t0));
        assert_eq!(second, Some(t0));
        assert_eq!(store.soft_delete("nope", t0).await.expect("missing"), None);
    }

    #[tokio::test]
    async fn outage_surfaces_as_backend_error() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.conversation("c1").await.expect_err("outage");
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
