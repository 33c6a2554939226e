//! Envelope shape checks, fan-out completeness, and anti-replay persistence.

use crate::error::{RelayError, RelayResult};
use crate::gate::{authorize_read, authorize_send, Decision, DenyReason};
use crate::model::{
    is_valid_id, ConversationKind, DeviceRef, EnvelopeDraft, StoredEnvelope, EPHEMERAL_KEY_LEN,
    IV_LEN, MAX_WRAPPED_KEY_LEN, SIGNATURE_LEN, WRAP_NONCE_LEN,
};
use crate::store::{EnvelopeStore, HistoryWindow, InsertOutcome, MembershipStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug)]
pub struct EnvelopeLimits {
    pub max_ciphertext_bytes: usize,
    pub max_recipients: usize,
}

impl Default for EnvelopeLimits {
    fn default() -> Self {
        Self {
            max_ciphertext_bytes: 256 * 1024,
            max_recipients: 1024,
        }
    }
}

/// Length and identifier checks. Never looks at key material beyond its size.
pub fn validate_shape(draft: &EnvelopeDraft, limits: &EnvelopeLimits) -> RelayResult<()> {
    for (name, value) in [
        ("message_id", draft.message_id.as_str()),
        ("group_id", draft.group_id.as_str()),
        ("conversation_id", draft.conversation_id.as_str()),
    ] {
        if !is_valid_id(value) {
            return Err(RelayError::malformed(format!("invalid {name}")));
        }
    }
    if draft.ephemeral_key.len() != EPHEMERAL_KEY_LEN {
        return Err(RelayError::malformed("invalid ephemeral key length"));
    }
    if draft.iv.len() != IV_LEN {
        return Err(RelayError::malformed("invalid iv length"));
    }
    if draft.signature.len() != SIGNATURE_LEN {
        return Err(RelayError::malformed("invalid signature length"));
    }
    if draft.ciphertext.is_empty() || draft.ciphertext.len() > limits.max_ciphertext_bytes {
        return Err(RelayError::malformed("invalid ciphertext size"));
    }
    if draft.wrapped_keys.is_empty() {
        return Err(RelayError::malformed("wrapped keys required"));
    }
    if draft.wrapped_keys.len() > limits.max_recipients {
        return Err(RelayError::malformed("too many recipients"));
    }
    for w in &draft.wrapped_keys {
        if w.wrapped_key.is_empty() || w.wrapped_key.len() > MAX_WRAPPED_KEY_LEN {
            return Err(RelayError::malformed("invalid wrapped key size"));
        }
        if w.nonce.len() != WRAP_NONCE_LEN {
            return Err(RelayError::malformed("invalid wrapped key nonce length"));
        }
    }
    Ok(())
}

/// The recipient list must reach every active device of every member other
/// than the sending device, and the wrapped keys must address exactly the
/// recipient list, once each.
pub fn check_fan_out(
    draft: &EnvelopeDraft,
    recipients: &[DeviceRef],
    active_devices: &[DeviceRef],
) -> RelayResult<()> {
    let mut recipient_set = BTreeSet::new();
    for r in recipients {
        if !recipient_set.insert(r) {
            return Err(RelayError::malformed(format!("duplicate recipient {r}")));
        }
    }

    let mut wrapped_set = BTreeSet::new();
    for w in &draft.wrapped_keys {
        if !wrapped_set.insert(w.device()) {
            return Err(RelayError::malformed("duplicate wrapped key"));
        }
    }
    if wrapped_set.len() != recipient_set.len()
        || wrapped_set.iter().any(|d| !recipient_set.contains(d))
    {
        return Err(RelayError::malformed("wrapped keys do not match recipients"));
    }

    if let Some(missing) = active_devices
        .iter()
        .filter(|d| **d != draft.sender)
        .find(|d| !recipient_set.contains(d))
    {
        return Err(RelayError::malformed(format!(
            "missing wrapped key for active device {missing}"
        )));
    }
    Ok(())
}

/// Gate, validate, then insert-if-absent. Nothing is written unless every
/// check has passed.
pub async fn submit<S>(
    store: &S,
    draft: &EnvelopeDraft,
    recipients: &[DeviceRef],
    limits: &EnvelopeLimits,
) -> RelayResult<StoredEnvelope>
where
    S: MembershipStore + EnvelopeStore + ?Sized,
{
    if recipients.len() > limits.max_recipients {
        return Err(RelayError::malformed("too many recipients"));
    }

    let decision = authorize_send(
        store,
        &draft.sender,
        &draft.group_id,
        &draft.conversation_id,
        recipients,
    )
    .await?;
    if let Decision::Deny(reason) = &decision {
        tracing::warn!(
            security_event = "send_gate",
            outcome = "denied",
            reason = reason.as_str(),
            conversation_id = %draft.conversation_id,
            user_id = %draft.sender.user_id,
            device_id = %draft.sender.device_id,
            "send denied"
        );
    }
    decision.into_result()?;

    validate_shape(draft, limits)?;
    let active = store
        .active_conversation_devices(&draft.conversation_id, &draft.group_id)
        .await?;
    check_fan_out(draft, recipients, &active)?;

    match store.insert_envelope(draft, Utc::now()).await? {
        InsertOutcome::Inserted(stored) => {
            tracing::debug!(
                message_id = %stored.message_id,
                conversation_id = %stored.conversation_id,
                fan_out = stored.wrapped_keys.len(),
                "envelope stored"
            );
            Ok(stored)
        }
        InsertOutcome::Duplicate => Err(RelayError::Conflict),
    }
}

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 200;

/// One page of a device's history.
#[derive(Clone, Debug)]
pub struct HistoryPage {
    pub kind: ConversationKind,
    pub envelopes: Vec<StoredEnvelope>,
    /// `seq` of the last envelope when the page is full; pass it back as
    /// `after_seq` to continue.
    pub next_after_seq: Option<i64>,
}

/// Envelopes of a conversation addressed to or sent from `device`, ordered by
/// `(sent_at, seq)`, each reduced to that device's own wrapped key.
pub async fn history<S>(
    store: &S,
    device: &DeviceRef,
    conversation_id: &str,
    since: Option<DateTime<Utc>>,
    after_seq: Option<i64>,
    limit: Option<usize>,
) -> RelayResult<HistoryPage>
where
    S: MembershipStore + EnvelopeStore + ?Sized,
{
    let conversation = authorize_read(store, device, conversation_id)
        .await?
        .map_err(DenyReason::into_error)?;
    let limit = limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let window = HistoryWindow {
        since,
        after_seq,
        limit,
    };
    let envelopes = store.history(conversation_id, device, window).await?;
    let next_after_seq = match envelopes.last() {
        Some(last) if envelopes.len() == limit => Some(last.seq),
        _ => None,
    };
    Ok(HistoryPage {
        kind: conversation.kind,
        envelopes,
        next_after_seq,
    })
}

/// Mark an envelope deleted. Only the original sender user may do so; the
/// first marker wins.
pub async fn delete_message<S>(
    store: &S,
    actor_user_id: &str,
    message_id: &str,
) -> RelayResult<StoredEnvelope>
where
    S: EnvelopeStore + ?Sized,
{
    if !is_valid_id(message_id) {
        return Err(RelayError::malformed("invalid message_id"));
    }
    let mut envelope = store
        .envelope_by_message_id(message_id)
        .await?
        .ok_or(RelayError::NotFound("message"))?;
    if envelope.sender_user_id != actor_user_id {
        return Err(RelayError::Unauthorized(DenyReason::NotPermitted));
    }
    let deleted_at = store
        .soft_delete(message_id, Utc::now())
        .await?
        .ok_or(RelayError::NotFound("message"))?;
    envelope.deleted_at = Some(deleted_at);
    envelope.ciphertext.clear();
    envelope.wrapped_keys.clear();
    tracing::info!(message_id, user_id = actor_user_id, "envelope soft-deleted");
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WrappedKey;

    fn wrapped(user: &str, device: &str) -> WrappedKey {
        WrappedKey {
            user_id: user.to_string(),
            device_id: device.to_string(),
            wrapped_key: vec![7; 48],
            nonce: vec![0; WRAP_NONCE_LEN],
        }
    }

    fn draft() -> EnvelopeDraft {
        EnvelopeDraft {
            message_id: "msg-1".to_string(),
            group_id: "g1".to_string(),
            conversation_id: "c1".to_string(),
            sender: DeviceRef::new("a", "a1"),
            ephemeral_key: vec![1; EPHEMERAL_KEY_LEN],
            iv: vec![2; IV_LEN],
            ciphertext: vec![3; 64],
            wrapped_keys: vec![wrapped("b", "b1")],
            signature: vec![4; SIGNATURE_LEN],
        }
    }

    #[test]
    fn shape_accepts_exact_lengths() {
        validate_shape(&draft(), &EnvelopeLimits::default()).expect("valid shape");
    }

    #[test]
    fn shape_rejects_each_fixed_length_field() {
        let limits = EnvelopeLimits::default();

        let mut d = draft();
        d.ephemeral_key.push(0);
        assert!(matches!(validate_shape(&d, &limits), Err(RelayError::Malformed(_))));

        let mut d = draft();
        d.iv.truncate(11);
        assert!(matches!(validate_shape(&d, &limits), Err(RelayError::Malformed(_))));

        let mut d = draft();
        d.signature = vec![0; 63];
        assert!(matches!(validate_shape(&d, &limits), Err(RelayError::Malformed(_))));

        let mut d = draft();
        d.wrapped_keys[0].nonce = vec![0; 24];
        assert!(matches!(validate_shape(&d, &limits), Err(RelayError::Malformed(_))));
    }

    #[test]
    fn shape_enforces_ciphertext_bounds_and_ids() {
        let limits = EnvelopeLimits {
            max_ciphertext_bytes: 16,
            max_recipients: 4,
        };
        let mut d = draft();
        d.ciphertext = vec![0; 17];
        assert!(validate_shape(&d, &limits).is_err());

        let mut d = draft();
        d.ciphertext.clear();
        assert!(validate_shape(&d, &limits).is_err());

        let mut d = draft();
        d.ciphertext = vec![0; 8];
        d.message_id = "bad id".to_string();
        let err = validate_shape(&d, &limits).expect_err("bad id");
        assert_eq!(err.to_string(), "malformed envelope: invalid message_id");
    }

    #[test]
    fn fan_out_requires_every_active_device_except_the_sender() {
        let mut d = draft();
        d.wrapped_keys = vec![wrapped("b", "b1")];
        let active = vec![
            DeviceRef::new("a", "a1"),
            DeviceRef::new("a", "a2"),
            DeviceRef::new("b", "b1"),
        ];
        let err = check_fan_out(&d, &[DeviceRef::new("b", "b1")], &active)
            .expect_err("a2 missing");
        assert!(err.to_string().contains("a/a2"));

        d.wrapped_keys.push(wrapped("a", "a2"));
        check_fan_out(
            &d,
            &[DeviceRef::new("b", "b1"), DeviceRef::new("a", "a2")],
            &active,
        )
        .expect("complete fan-out");
    }

    #[test]
    fn fan_out_rejects_mismatched_or_duplicate_wrapped_keys() {
        let active = vec![DeviceRef::new("b", "b1")];
        let recipients = vec![DeviceRef::new("b", "b1")];

        let mut d = draft();
        d.wrapped_keys.push(wrapped("b", "b1"));
        assert!(check_fan_out(&d, &recipients, &active).is_err());

        let mut d = draft();
        d.wrapped_keys = vec![wrapped("c", "c1")];
        assert!(check_fan_out(&d, &recipients, &active).is_err());

        let d = draft();
        let doubled = vec![DeviceRef::new("b", "b1"), DeviceRef::new("b", "b1")];
        assert!(check_fan_out(&d, &doubled, &active).is_err());
    }
}
