//! Postgres implementation of the relay store contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::model::{
    Conversation, ConversationKind, DeviceKeyRecord, DeviceKeyStatus, DeviceRef, EnvelopeDraft,
    GroupRole, KeyStatus, NewDeviceKey, Reader, RefreshRecord, StoredEnvelope, WrappedKey,
};
use relay_core::store::{
    CredentialStore, EnvelopeStore, HistoryWindow, InsertOutcome, MembershipStore, RevokedKey,
};
use relay_core::{StoreError, StoreResult};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

fn table_name(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) => format!("{s}.{name}"),
        None => name.to_string(),
    }
}

pub async fn connect(db_url: &str, acquire_timeout: Duration) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout)
        .connect(db_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool, db_schema: &Option<String>) -> Result<(), sqlx::Error> {
    if let Some(schema) = db_schema {
        let ddl = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let users = table_name(db_schema, "users");
    let groups = table_name(db_schema, "groups");
    let group_members = table_name(db_schema, "group_members");
    let conversations = table_name(db_schema, "conversations");
    let conversation_members = table_name(db_schema, "conversation_members");
    let device_keys = table_name(db_schema, "device_keys");
    let envelopes = table_name(db_schema, "envelopes");
    let envelope_keys = table_name(db_schema, "envelope_keys");
    let refresh_tokens = table_name(db_schema, "refresh_tokens");

    let ddls = [
        format!(
            "CREATE TABLE IF NOT EXISTS {users} (\
             id VARCHAR(64) PRIMARY KEY,\
             username VARCHAR(120) NOT NULL,\
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {groups} (\
             id VARCHAR(64) PRIMARY KEY,\
             name VARCHAR(120) NOT NULL,\
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {group_members} (\
             seq BIGSERIAL,\
             group_id VARCHAR(64) NOT NULL,\
             user_id VARCHAR(64) NOT NULL,\
             role VARCHAR(16) NOT NULL DEFAULT 'member',\
             joined_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\
             PRIMARY KEY (group_id, user_id)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {conversations} (\
             id VARCHAR(64) PRIMARY KEY,\
             group_id VARCHAR(64) NOT NULL,\
             kind VARCHAR(16) NOT NULL,\
             created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {conversation_members} (\
             seq BIGSERIAL,\
             conversation_id VARCHAR(64) NOT NULL,\
             user_id VARCHAR(64) NOT NULL,\
             last_read_at TIMESTAMPTZ,\
             PRIMARY KEY (conversation_id, user_id)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {device_keys} (\
             group_id VARCHAR(64) NOT NULL,\
             user_id VARCHAR(64) NOT NULL,\
             device_id VARCHAR(64) NOT NULL,\
             signing_key BYTEA NOT NULL,\
             exchange_key BYTEA NOT NULL,\
             key_version BIGINT NOT NULL DEFAULT 1,\
             status VARCHAR(16) NOT NULL DEFAULT 'active',\
             updated_at TIMESTAMPTZ NOT NULL,\
             PRIMARY KEY (group_id, user_id, device_id)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {envelopes} (\
             id VARCHAR(36) PRIMARY KEY,\
             seq BIGSERIAL UNIQUE,\
             message_id VARCHAR(64) NOT NULL UNIQUE,\
             conversation_id VARCHAR(64) NOT NULL,\
             sender_user_id VARCHAR(64) NOT NULL,\
             sender_device_id VARCHAR(64) NOT NULL,\
             ephemeral_key BYTEA NOT NULL,\
             iv BYTEA NOT NULL,\
             ciphertext BYTEA NOT NULL,\
             signature BYTEA NOT NULL,\
             sent_at TIMESTAMPTZ NOT NULL,\
             deleted_at TIMESTAMPTZ\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {envelope_keys} (\
             envelope_id VARCHAR(36) NOT NULL,\
             position INTEGER NOT NULL,\
             user_id VARCHAR(64) NOT NULL,\
             device_id VARCHAR(64) NOT NULL,\
             wrapped_key BYTEA NOT NULL,\
             nonce BYTEA NOT NULL,\
             PRIMARY KEY (envelope_id, user_id, device_id)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {refresh_tokens} (\
             token_hash VARCHAR(64) PRIMARY KEY,\
             user_id VARCHAR(64) NOT NULL,\
             device_id VARCHAR(64) NOT NULL,\
             expires_at TIMESTAMPTZ NOT NULL,\
             created_at TIMESTAMPTZ NOT NULL\
             )"
        ),
    ];
    for ddl in ddls {
        sqlx::query(&ddl).execute(pool).await?;
    }

    let indexes = [
        format!(
            "CREATE INDEX IF NOT EXISTS ix_envelopes_conv_sent ON {envelopes}(conversation_id, sent_at, seq)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_envelope_keys_device ON {envelope_keys}(user_id, device_id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_conversation_members_user ON {conversation_members}(user_id)"
        ),
        format!("CREATE INDEX IF NOT EXISTS ix_group_members_user ON {group_members}(user_id)"),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_refresh_tokens_device ON {refresh_tokens}(user_id, device_id)"
        ),
    ];
    for ddl in indexes {
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    Ok(())
}

const KEY_COLUMNS: &str =
    "group_id,user_id,device_id,signing_key,exchange_key,key_version,status,updated_at";

const ENVELOPE_COLUMNS: &str = "e.id,e.seq,e.message_id,e.conversation_id,e.sender_user_id,e.sender_device_id,e.ephemeral_key,e.iv,e.ciphertext,e.signature,e.sent_at,e.deleted_at";

fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        other => StoreError::Backend(other.to_string()),
    }
}

fn key_record(row: &PgRow) -> Result<DeviceKeyRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(DeviceKeyRecord {
        group_id: row.try_get("group_id")?,
        user_id: row.try_get("user_id")?,
        device_id: row.try_get("device_id")?,
        signing_key: row.try_get("signing_key")?,
        exchange_key: row.try_get("exchange_key")?,
        key_version: row.try_get("key_version")?,
        status: KeyStatus::parse(&status).unwrap_or(KeyStatus::Revoked),
        updated_at: row.try_get("updated_at")?,
    })
}

fn envelope_row(row: &PgRow, wrapped_keys: Vec<WrappedKey>) -> Result<StoredEnvelope, sqlx::Error> {
    Ok(StoredEnvelope {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        message_id: row.try_get("message_id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_user_id: row.try_get("sender_user_id")?,
        sender_device_id: row.try_get("sender_device_id")?,
        ephemeral_key: row.try_get("ephemeral_key")?,
        iv: row.try_get("iv")?,
        ciphertext: row.try_get("ciphertext")?,
        wrapped_keys,
        signature: row.try_get("signature")?,
        sent_at: row.try_get("sent_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn wrapped_key_row(row: &PgRow) -> Result<WrappedKey, sqlx::Error> {
    Ok(WrappedKey {
        user_id: row.try_get("k_user_id")?,
        device_id: row.try_get("k_device_id")?,
        wrapped_key: row.try_get("wrapped_key")?,
        nonce: row.try_get("nonce")?,
    })
}

/// Every call is bounded by `timeout`; expiry surfaces as
/// [`StoreError::Timeout`] rather than a hung request.
pub struct PgStore {
    pool: PgPool,
    schema: Option<String>,
    timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: Option<String>, timeout: Duration) -> Self {
        Self {
            pool,
            schema,
            timeout,
        }
    }

    fn table(&self, name: &str) -> String {
        table_name(&self.schema, name)
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(store_error),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn ids(&self, sql: String, key: &str) -> StoreResult<Vec<String>> {
        self.bounded(async {
            let rows = sqlx::query(&sql).bind(key).fetch_all(&self.pool).await?;
            rows.iter()
                .map(|r| r.try_get::<String, _>(0))
                .collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }
}

#[async_trait]
impl MembershipStore for PgStore {
    async fn conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let conversations = self.table("conversations");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "SELECT id,group_id,kind FROM {conversations} WHERE id=$1"
            ))
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let kind: String = row.try_get("kind")?;
            Ok::<_, sqlx::Error>(Some(Conversation {
                id: row.try_get("id")?,
                group_id: row.try_get("group_id")?,
                kind: ConversationKind::parse(&kind),
            }))
        })
        .await
    }

    async fn is_conversation_member(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> StoreResult<bool> {
        let conversation_members = self.table("conversation_members");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "SELECT 1 AS one FROM {conversation_members} WHERE conversation_id=$1 AND user_id=$2"
            ))
            .bind(conversation_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok::<_, sqlx::Error>(row.is_some())
        })
        .await
    }

    async fn group_role(&self, group_id: &str, user_id: &str) -> StoreResult<Option<GroupRole>> {
        let group_members = self.table("group_members");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "SELECT role FROM {group_members} WHERE group_id=$1 AND user_id=$2"
            ))
            .bind(group_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            let role = match row {
                Some(r) => Some(GroupRole::parse(&r.try_get::<String, _>("role")?)),
                None => None,
            };
            Ok::<_, sqlx::Error>(role)
        })
        .await
    }

    async fn device_key_status(
        &self,
        group_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> StoreResult<DeviceKeyStatus> {
        let device_keys = self.table("device_keys");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "SELECT status FROM {device_keys} WHERE group_id=$1 AND user_id=$2 AND device_id=$3"
            ))
            .bind(group_id)
            .bind(user_id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
            let status = match row {
                // Unrecognized values never count as active.
                Some(r) => Some(
                    KeyStatus::parse(&r.try_get::<String, _>("status")?)
                        .unwrap_or(KeyStatus::Revoked),
                ),
                None => None,
            };
            Ok::<_, sqlx::Error>(DeviceKeyStatus::from(status))
        })
        .await
    }

    async fn active_conversation_devices(
        &self,
        conversation_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<DeviceRef>> {
        let device_keys = self.table("device_keys");
        let conversation_members = self.table("conversation_members");
        self.bounded(async {
            let rows = sqlx::query(&format!(
                "SELECT k.user_id,k.device_id FROM {device_keys} k \
                 JOIN {conversation_members} m ON m.user_id=k.user_id AND m.conversation_id=$1 \
                 WHERE k.group_id=$2 AND k.status='active' \
                 ORDER BY k.user_id,k.device_id"
            ))
            .bind(conversation_id)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(|r| {
                    Ok(DeviceRef::new(
                        r.try_get::<String, _>("user_id")?,
                        r.try_get::<String, _>("device_id")?,
                    ))
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    async fn upsert_device_key(
        &self,
        key: &NewDeviceKey,
        revoked: RevokedKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeviceKeyRecord>> {
        let device_keys = self.table("device_keys");
        self.bounded(async {
            // A skipped conflict update returns no row.
            let row = sqlx::query(&format!(
                "INSERT INTO {device_keys} AS k ({KEY_COLUMNS}) \
                 VALUES ($1,$2,$3,$4,$5,1,'active',$6) \
                 ON CONFLICT (group_id,user_id,device_id) DO UPDATE SET \
                 signing_key=EXCLUDED.signing_key,\
                 exchange_key=EXCLUDED.exchange_key,\
                 key_version=k.key_version+1,\
                 status='active',\
                 updated_at=EXCLUDED.updated_at \
                 WHERE $7 OR k.status<>'revoked' \
                 RETURNING {KEY_COLUMNS}"
            ))
            .bind(&key.group_id)
            .bind(&key.device.user_id)
            .bind(&key.device.device_id)
            .bind(&key.signing_key)
            .bind(&key.exchange_key)
            .bind(now)
            .bind(revoked == RevokedKey::Reactivate)
            .fetch_optional(&self.pool)
            .await?;
            row.as_ref().map(key_record).transpose()
        })
        .await
    }

    async fn revoke_device_key(
        &self,
        group_id: &str,
        device: &DeviceRef,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DeviceKeyRecord>> {
        let device_keys = self.table("device_keys");
        self.bounded(async {
            let updated = sqlx::query(&format!(
                "UPDATE {device_keys} SET status='revoked', updated_at=$4 \
                 WHERE group_id=$1 AND user_id=$2 AND device_id=$3 AND status='active' \
                 RETURNING {KEY_COLUMNS}"
            ))
            .bind(group_id)
            .bind(&device.user_id)
            .bind(&device.device_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = updated {
                return key_record(&row).map(Some);
            }
            let existing = sqlx::query(&format!(
                "SELECT {KEY_COLUMNS} FROM {device_keys} \
                 WHERE group_id=$1 AND user_id=$2 AND device_id=$3"
            ))
            .bind(group_id)
            .bind(&device.user_id)
            .bind(&device.device_id)
            .fetch_optional(&self.pool)
            .await?;
            existing.as_ref().map(key_record).transpose()
        })
        .await
    }

    async fn groups_for_user(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let group_members = self.table("group_members");
        self.ids(
            format!("SELECT group_id FROM {group_members} WHERE user_id=$1 ORDER BY seq"),
            user_id,
        )
        .await
    }

    async fn conversations_for_user(&self, user_id: &str) -> StoreResult<Vec<String>> {
        let conversation_members = self.table("conversation_members");
        self.ids(
            format!(
                "SELECT conversation_id FROM {conversation_members} WHERE user_id=$1 ORDER BY seq"
            ),
            user_id,
        )
        .await
    }

    async fn group_member_ids(&self, group_id: &str) -> StoreResult<Vec<String>> {
        let group_members = self.table("group_members");
        self.ids(
            format!("SELECT user_id FROM {group_members} WHERE group_id=$1 ORDER BY seq"),
            group_id,
        )
        .await
    }

    async fn conversation_member_ids(&self, conversation_id: &str) -> StoreResult<Vec<String>> {
        let conversation_members = self.table("conversation_members");
        self.ids(
            format!(
                "SELECT user_id FROM {conversation_members} WHERE conversation_id=$1 ORDER BY seq"
            ),
            conversation_id,
        )
        .await
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let conversation_members = self.table("conversation_members");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "UPDATE {conversation_members} \
                 SET last_read_at=GREATEST(COALESCE(last_read_at,$3),$3) \
                 WHERE conversation_id=$1 AND user_id=$2 \
                 RETURNING last_read_at"
            ))
            .bind(conversation_id)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            let marker = match row {
                Some(r) => Some(r.try_get::<DateTime<Utc>, _>("last_read_at")?),
                None => None,
            };
            Ok::<_, sqlx::Error>(marker)
        })
        .await
    }

    async fn list_readers(&self, conversation_id: &str) -> StoreResult<Vec<Reader>> {
        let conversation_members = self.table("conversation_members");
        let users = self.table("users");
        self.bounded(async {
            let rows = sqlx::query(&format!(
                "SELECT m.user_id, COALESCE(u.username, m.user_id) AS username, m.last_read_at \
                 FROM {conversation_members} m LEFT JOIN {users} u ON u.id=m.user_id \
                 WHERE m.conversation_id=$1 ORDER BY m.seq"
            ))
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(|r| {
                    Ok(Reader {
                        user_id: r.try_get("user_id")?,
                        username: r.try_get("username")?,
                        last_read_at: r.try_get("last_read_at")?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }
}

#[async_trait]
impl EnvelopeStore for PgStore {
    async fn insert_envelope(
        &self,
        draft: &EnvelopeDraft,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome> {
        let envelopes = self.table("envelopes");
        let envelope_keys = self.table("envelope_keys");
        self.bounded(async {
            let id = Uuid::new_v4().to_string();
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query(&format!(
                "INSERT INTO {envelopes} \
                 (id,message_id,conversation_id,sender_user_id,sender_device_id,ephemeral_key,iv,ciphertext,signature,sent_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
                 ON CONFLICT (message_id) DO NOTHING \
                 RETURNING seq"
            ))
            .bind(&id)
            .bind(&draft.message_id)
            .bind(&draft.conversation_id)
            .bind(&draft.sender.user_id)
            .bind(&draft.sender.device_id)
            .bind(&draft.ephemeral_key)
            .bind(&draft.iv)
            .bind(&draft.ciphertext)
            .bind(&draft.signature)
            .bind(sent_at)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else {
                tx.rollback().await?;
                return Ok(InsertOutcome::Duplicate);
            };
            let seq: i64 = row.try_get("seq")?;

            for (position, w) in draft.wrapped_keys.iter().enumerate() {
                sqlx::query(&format!(
                    "INSERT INTO {envelope_keys} \
                     (envelope_id,position,user_id,device_id,wrapped_key,nonce) \
                     VALUES ($1,$2,$3,$4,$5,$6)"
                ))
                .bind(&id)
                .bind(position as i32)
                .bind(&w.user_id)
                .bind(&w.device_id)
                .bind(&w.wrapped_key)
                .bind(&w.nonce)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;

            Ok::<_, sqlx::Error>(InsertOutcome::Inserted(StoredEnvelope {
                id,
                seq,
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
            }))
        })
        .await
    }

    async fn history(
        &self,
        conversation_id: &str,
        device: &DeviceRef,
        window: HistoryWindow,
    ) -> StoreResult<Vec<StoredEnvelope>> {
        let envelopes = self.table("envelopes");
        let envelope_keys = self.table("envelope_keys");
        self.bounded(async {
            let rows = sqlx::query(&format!(
                "SELECT {ENVELOPE_COLUMNS}, k.user_id AS k_user_id, k.device_id AS k_device_id, \
                 k.wrapped_key, k.nonce \
                 FROM {envelopes} e \
                 LEFT JOIN {envelope_keys} k \
                 ON k.envelope_id=e.id AND k.user_id=$2 AND k.device_id=$3 \
                 WHERE e.conversation_id=$1 \
                 AND (k.envelope_id IS NOT NULL OR (e.sender_user_id=$2 AND e.sender_device_id=$3)) \
                 AND ($4::timestamptz IS NULL OR e.sent_at > $4) \
                 AND ($5::bigint IS NULL OR (e.sent_at, e.seq) > \
                 (SELECT a.sent_at, a.seq FROM {envelopes} a WHERE a.seq=$5 AND a.conversation_id=$1)) \
                 ORDER BY e.sent_at ASC, e.seq ASC \
                 LIMIT $6"
            ))
            .bind(conversation_id)
            .bind(&device.user_id)
            .bind(&device.device_id)
            .bind(window.since)
            .bind(window.after_seq)
            .bind(window.limit as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(|r| {
                    let own_key: Option<String> = r.try_get("k_user_id")?;
                    let keys = match own_key {
                        Some(_) => vec![wrapped_key_row(r)?],
                        None => Vec::new(),
                    };
                    envelope_row(r, keys).map(|e| e.view_for(device))
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
        })
        .await
    }

    async fn envelope_by_message_id(
        &self,
        message_id: &str,
    ) -> StoreResult<Option<StoredEnvelope>> {
        let envelopes = self.table("envelopes");
        let envelope_keys = self.table("envelope_keys");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "SELECT {ENVELOPE_COLUMNS} FROM {envelopes} e WHERE e.message_id=$1"
            ))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let id: String = row.try_get("id")?;
            let key_rows = sqlx::query(&format!(
                "SELECT user_id AS k_user_id, device_id AS k_device_id, wrapped_key, nonce \
                 FROM {envelope_keys} WHERE envelope_id=$1 ORDER BY position"
            ))
            .bind(&id)
            .fetch_all(&self.pool)
            .await?;
            let keys = key_rows
                .iter()
                .map(wrapped_key_row)
                .collect::<Result<Vec<_>, _>>()?;
            envelope_row(&row, keys).map(Some)
        })
        .await
    }

    async fn soft_delete(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let envelopes = self.table("envelopes");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "UPDATE {envelopes} SET deleted_at=COALESCE(deleted_at,$2) \
                 WHERE message_id=$1 RETURNING deleted_at"
            ))
            .bind(message_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            let marker = match row {
                Some(r) => Some(r.try_get::<DateTime<Utc>, _>("deleted_at")?),
                None => None,
            };
            Ok::<_, sqlx::Error>(marker)
        })
        .await
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn insert_refresh(&self, record: &RefreshRecord) -> StoreResult<()> {
        let refresh_tokens = self.table("refresh_tokens");
        self.bounded(async {
            sqlx::query(&format!(
                "INSERT INTO {refresh_tokens} (token_hash,user_id,device_id,expires_at,created_at) \
                 VALUES ($1,$2,$3,$4,$5)"
            ))
            .bind(&record.token_hash)
            .bind(&record.user_id)
            .bind(&record.device_id)
            .bind(record.expires_at)
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, sqlx::Error>(())
        })
        .await
    }

    async fn find_refresh(&self, token_hash: &str) -> StoreResult<Option<RefreshRecord>> {
        let refresh_tokens = self.table("refresh_tokens");
        self.bounded(async {
            let row = sqlx::query(&format!(
                "SELECT token_hash,user_id,device_id,expires_at,created_at \
                 FROM {refresh_tokens} WHERE token_hash=$1"
            ))
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
            let Some(r) = row else {
                return Ok(None);
            };
            Ok::<_, sqlx::Error>(Some(RefreshRecord {
                token_hash: r.try_get("token_hash")?,
                user_id: r.try_get("user_id")?,
                device_id: r.try_get("device_id")?,
                expires_at: r.try_get("expires_at")?,
                created_at: r.try_get("created_at")?,
            }))
        })
        .await
    }

    async fn delete_refresh(&self, token_hash: &str) -> StoreResult<bool> {
        let refresh_tokens = self.table("refresh_tokens");
        self.bounded(async {
            let res = sqlx::query(&format!(
                "DELETE FROM {refresh_tokens} WHERE token_hash=$1"
            ))
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
            Ok::<_, sqlx::Error>(res.rows_affected() > 0)
        })
        .await
    }
}
