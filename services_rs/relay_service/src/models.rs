use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use relay_core::broadcast::OnlineMember;
use relay_core::model::{ConversationKind, DeviceKeyRecord, Reader, StoredEnvelope, WrappedKey};
use relay_core::session::IssuedSession;
use serde::{Deserialize, Serialize};

pub fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[derive(Debug, Deserialize)]
pub struct IssueSessionReq {
    pub user_id: String,
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshReq {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionOut {
    pub token_type: &'static str,
    pub access_token: String,
    pub access_expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub refresh_expires_at: String,
}

impl From<IssuedSession> for SessionOut {
    fn from(s: IssuedSession) -> Self {
        Self {
            token_type: "Bearer",
            access_token: s.access_token,
            access_expires_at: iso(s.access_expires_at),
            refresh_token: s.refresh_token,
            refresh_expires_at: iso(s.refresh_expires_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MeOut {
    pub user_id: String,
    pub device_id: String,
    pub expires_at: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterKeyReq {
    pub signing_key_b64: String,
    pub exchange_key_b64: String,
}

/// Admin re-enrollment of a revoked device with fresh public keys.
#[derive(Debug, Deserialize)]
pub struct ReenrollKeyReq {
    pub user_id: String,
    pub device_id: String,
    pub signing_key_b64: String,
    pub exchange_key_b64: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeKeyReq {
    /// Defaults to the caller.
    pub user_id: Option<String>,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct KeyRecordOut {
    pub group_id: String,
    pub user_id: String,
    pub device_id: String,
    pub signing_key_b64: String,
    pub exchange_key_b64: String,
    pub key_version: i64,
    pub status: &'static str,
    pub updated_at: String,
}

impl From<DeviceKeyRecord> for KeyRecordOut {
    fn from(r: DeviceKeyRecord) -> Self {
        Self {
            signing_key_b64: b64(&r.signing_key),
            exchange_key_b64: b64(&r.exchange_key),
            status: r.status.as_str(),
            updated_at: iso(r.updated_at),
            group_id: r.group_id,
            user_id: r.user_id,
            device_id: r.device_id,
            key_version: r.key_version,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecipientIn {
    pub user_id: String,
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WrappedKeyIn {
    pub user_id: String,
    pub device_id: String,
    pub wrapped_key_b64: String,
    pub nonce_b64: String,
}

#[derive(Debug, Deserialize)]
pub struct SendReq {
    pub message_id: String,
    pub group_id: String,
    /// When omitted, the devices named by `wrapped_keys` are the recipients.
    pub recipients: Option<Vec<RecipientIn>>,
    pub ephemeral_key_b64: String,
    pub iv_b64: String,
    pub ciphertext_b64: String,
    pub wrapped_keys: Vec<WrappedKeyIn>,
    pub signature_b64: String,
}

#[derive(Debug, Serialize)]
pub struct SendOut {
    pub id: String,
    pub message_id: String,
    pub sent_at: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct WrappedKeyOut {
    pub user_id: String,
    pub device_id: String,
    pub wrapped_key_b64: String,
    pub nonce_b64: String,
}

impl From<&WrappedKey> for WrappedKeyOut {
    fn from(w: &WrappedKey) -> Self {
        Self {
            user_id: w.user_id.clone(),
            device_id: w.device_id.clone(),
            wrapped_key_b64: b64(&w.wrapped_key),
            nonce_b64: b64(&w.nonce),
        }
    }
}

/// One envelope as a single device sees it.
#[derive(Clone, Debug, Serialize)]
pub struct EnvelopeOut {
    pub id: String,
    pub seq: i64,
    pub message_id: String,
    pub conversation_id: String,
    pub sender_user_id: String,
    pub sender_device_id: String,
    pub ephemeral_key_b64: String,
    pub iv_b64: String,
    pub ciphertext_b64: String,
    pub wrapped_keys: Vec<WrappedKeyOut>,
    pub signature_b64: String,
    pub sent_at: String,
    pub deleted_at: Option<String>,
}

impl From<&StoredEnvelope> for EnvelopeOut {
    fn from(e: &StoredEnvelope) -> Self {
        Self {
            id: e.id.clone(),
            seq: e.seq,
            message_id: e.message_id.clone(),
            conversation_id: e.conversation_id.clone(),
            sender_user_id: e.sender_user_id.clone(),
            sender_device_id: e.sender_device_id.clone(),
            ephemeral_key_b64: b64(&e.ephemeral_key),
            iv_b64: b64(&e.iv),
            ciphertext_b64: b64(&e.ciphertext),
            wrapped_keys: e.wrapped_keys.iter().map(WrappedKeyOut::from).collect(),
            signature_b64: b64(&e.signature),
            sent_at: iso(e.sent_at),
            deleted_at: e.deleted_at.map(iso),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub since: Option<String>,
    /// `seq` of the last envelope already seen.
    pub after_seq: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryOut {
    pub conversation_id: String,
    pub kind: ConversationKind,
    pub messages: Vec<EnvelopeOut>,
    pub next_after_seq: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReadOut {
    pub conversation_id: String,
    pub last_read_at: String,
}

#[derive(Debug, Serialize)]
pub struct ReaderOut {
    pub user_id: String,
    pub username: String,
    pub last_read_at: Option<String>,
}

impl From<Reader> for ReaderOut {
    fn from(r: Reader) -> Self {
        Self {
            user_id: r.user_id,
            username: r.username,
            last_read_at: r.last_read_at.map(iso),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteOut {
    pub message_id: String,
    pub conversation_id: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GroupPresenceOut {
    pub group_id: String,
    pub online: Vec<OnlineMember>,
}
