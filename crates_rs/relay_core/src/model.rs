//! Normalized entities shared by the gate, the envelope path and presence.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

pub const SIGNING_KEY_LEN: usize = 32;
pub const EXCHANGE_KEY_LEN: usize = 32;
pub const EPHEMERAL_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const SIGNATURE_LEN: usize = 64;
pub const WRAP_NONCE_LEN: usize = 12;
pub const MAX_WRAPPED_KEY_LEN: usize = 256;

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"))
}

/// Opaque identifiers (users, devices, groups, conversations, message ids).
pub fn is_valid_id(raw: &str) -> bool {
    id_re().is_match(raw)
}

/// A `(userId, deviceId)` pair. Ordering is used to keep fan-out sets stable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceRef {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceRef {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Result of a key record lookup. A missing record is a distinct state, never
/// folded into `Revoked`, so logs can tell the two apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKeyStatus {
    Active,
    Revoked,
    Absent,
}

impl From<Option<KeyStatus>> for DeviceKeyStatus {
    fn from(v: Option<KeyStatus>) -> Self {
        match v {
            Some(KeyStatus::Active) => Self::Active,
            Some(KeyStatus::Revoked) => Self::Revoked,
            None => Self::Absent,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Member,
    Admin,
}

impl GroupRole {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("admin") {
            Self::Admin
        } else {
            Self::Member
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Subset,
}

impl ConversationKind {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("private") {
            Self::Private
        } else {
            Self::Subset
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub group_id: String,
    pub kind: ConversationKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceKeyRecord {
    pub group_id: String,
    pub user_id: String,
    pub device_id: String,
    pub signing_key: Vec<u8>,
    pub exchange_key: Vec<u8>,
    pub key_version: i64,
    pub status: KeyStatus,
    pub updated_at: DateTime<Utc>,
}

/// Keys presented by a device when (re)registering in a group.
#[derive(Clone, Debug)]
pub struct NewDeviceKey {
    pub group_id: String,
    pub device: DeviceRef,
    pub signing_key: Vec<u8>,
    pub exchange_key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reader {
    pub user_id: String,
    pub username: String,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub user_id: String,
    pub device_id: String,
    pub wrapped_key: Vec<u8>,
    pub nonce: Vec<u8>,
}

impl WrappedKey {
    pub fn device(&self) -> DeviceRef {
        DeviceRef::new(self.user_id.clone(), self.device_id.clone())
    }
}

/// Envelope fields after base64 decoding, before any check has run.
#[derive(Clone, Debug)]
pub struct EnvelopeDraft {
    pub message_id: String,
    pub group_id: String,
    pub conversation_id: String,
    pub sender: DeviceRef,
    pub ephemeral_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub wrapped_keys: Vec<WrappedKey>,
    pub signature: Vec<u8>,
}

/// An envelope as persisted. `wrapped_keys` may be filtered down to the
/// requesting device on read paths.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredEnvelope {
    pub id: String,
    pub seq: i64,
    pub message_id: String,
    pub conversation_id: String,
    pub sender_user_id: String,
    pub sender_device_id: String,
    pub ephemeral_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub wrapped_keys: Vec<WrappedKey>,
    pub signature: Vec<u8>,
    pub sent_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredEnvelope {
    /// Copy addressed to one device: only its wrapped key survives, and a
    /// soft-deleted envelope loses its payload.
    pub fn view_for(&self, device: &DeviceRef) -> StoredEnvelope {
        let mut out = self.clone();
        out.wrapped_keys
            .retain(|w| w.user_id == device.user_id && w.device_id == device.device_id);
        if out.deleted_at.is_some() {
            out.ciphertext.clear();
            out.wrapped_keys.clear();
        }
        out
    }

    pub fn addresses(&self, device: &DeviceRef) -> bool {
        self.wrapped_keys
            .iter()
            .any(|w| w.user_id == device.user_id && w.device_id == device.device_id)
    }

    pub fn sent_from(&self, device: &DeviceRef) -> bool {
        self.sender_user_id == device.user_id && self.sender_device_id == device.device_id
    }

    /// Part of `device`'s history: it holds a wrapped key, or it sent the
    /// envelope (and sees it without one).
    pub fn visible_to(&self, device: &DeviceRef) -> bool {
        self.addresses(device) || self.sent_from(device)
    }
}

/// Persisted renewal credential. Only the hash of the token is ever stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshRecord {
    pub token_hash: String,
    pub user_id: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation_accepts_opaque_ids_and_rejects_separators() {
        assert!(is_valid_id("u_alice-01"));
        assert!(is_valid_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id(&"x".repeat(65)));
    }

    #[test]
    fn view_for_keeps_only_the_addressed_wrapped_key() {
        let env = StoredEnvelope {
            id: "e1".to_string(),
            seq: 1,
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            sender_user_id: "a".to_string(),
            sender_device_id: "a1".to_string(),
            ephemeral_key: vec![1; EPHEMERAL_KEY_LEN],
            iv: vec![2; IV_LEN],
            ciphertext: vec![3; 10],
            wrapped_keys: vec![
                WrappedKey {
                    user_id: "b".to_string(),
                    device_id: "b1".to_string(),
                    wrapped_key: vec![4; 48],
                    nonce: vec![5; WRAP_NONCE_LEN],
                },
                WrappedKey {
                    user_id: "c".to_string(),
                    device_id: "c1".to_string(),
                    wrapped_key: vec![6; 48],
                    nonce: vec![7; WRAP_NONCE_LEN],
                },
            ],
            signature: vec![8; SIGNATURE_LEN],
            sent_at: Utc::now(),
            deleted_at: None,
        };
        let view = env.view_for(&DeviceRef::new("b", "b1"));
        assert_eq!(view.wrapped_keys.len(), 1);
        assert_eq!(view.wrapped_keys[0].device_id, "b1");

        let mut deleted = env.clone();
        deleted.deleted_at = Some(Utc::now());
        let tomb = deleted.view_for(&DeviceRef::new("b", "b1"));
        assert!(tomb.ciphertext.is_empty());
        assert!(tomb.wrapped_keys.is_empty());

        let own = env.view_for(&DeviceRef::new("a", "a1"));
        assert!(env.visible_to(&DeviceRef::new("a", "a1")));
        assert!(own.wrapped_keys.is_empty());
        assert_eq!(own.ciphertext.len(), 10);
        assert!(!env.visible_to(&DeviceRef::new("a", "a2")));
    }

    #[test]
    fn role_and_kind_parsing_default_to_least_privilege() {
        assert_eq!(GroupRole::parse("ADMIN"), GroupRole::Admin);
        assert_eq!(GroupRole::parse("owner"), GroupRole::Member);
        assert_eq!(ConversationKind::parse("private"), ConversationKind::Private);
        assert_eq!(ConversationKind::parse("subset"), ConversationKind::Subset);
        assert_eq!(KeyStatus::parse("revoked"), Some(KeyStatus::Revoked));
        assert_eq!(KeyStatus::parse("gone"), None);
    }
}
