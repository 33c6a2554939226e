use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use relay_core::broadcast::group_snapshot;
use relay_core::envelope;
use relay_core::gate::{self, DenyReason};
use relay_core::keys;
use relay_core::model::{is_valid_id, DeviceRef, EnvelopeDraft, WrappedKey};
use relay_core::session::{hash_prefix, Identity};
use relay_core::store::MembershipStore;
use relay_core::RelayError;
use serde_json::json;
use std::time::Duration as StdDuration;
use subtle::ConstantTimeEq;

#[derive(Debug, serde::Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub env: String,
    pub service: &'static str,
    pub version: &'static str,
    pub connections: usize,
    pub online_users: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    Json(HealthOut {
        status: "ok",
        env: state.env_name.clone(),
        service: "Relay API",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.connection_count(),
        online_users: state.tracker.online_user_count(),
    })
}

#[derive(Debug, serde::Deserialize)]
pub struct EventsParams {
    pub access_token: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_str(headers, "authorization");
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn require_identity(state: &AppState, headers: &HeaderMap) -> ApiResult<Identity> {
    let token = bearer_token(headers).ok_or_else(|| ApiError::unauthorized("bearer token required"))?;
    Ok(state.sessions.verify_access(&token)?)
}

fn require_internal(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.internal_secret.as_deref() else {
        return Err(ApiError::forbidden("internal session issuance disabled"));
    };
    let provided = header_str(headers, "x-internal-secret");
    if provided.is_empty() || provided.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        tracing::warn!(
            security_event = "internal_auth",
            outcome = "denied",
            "internal secret mismatch"
        );
        return Err(ApiError::unauthorized("internal auth required"));
    }
    Ok(())
}

fn decode_b64(field: &str, raw: &str) -> ApiResult<Vec<u8>> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ApiError::bad_request(format!("{field} required")));
    }
    STANDARD
        .decode(s)
        .or_else(|_| URL_SAFE.decode(s))
        .or_else(|_| URL_SAFE_NO_PAD.decode(s))
        .map_err(|_| ApiError::bad_request(format!("invalid {field}")))
}

fn parse_iso8601(raw: &str) -> ApiResult<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ApiError::bad_request("invalid since"));
    }
    let parsed =
        DateTime::parse_from_rfc3339(s).map_err(|_| ApiError::bad_request("invalid since"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn path_id(raw: &str, what: &str) -> ApiResult<String> {
    let id = raw.trim();
    if !is_valid_id(id) {
        return Err(ApiError::not_found(format!("{what} not found")));
    }
    Ok(id.to_string())
}

pub async fn issue_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IssueSessionReq>,
) -> ApiResult<Json<SessionOut>> {
    require_internal(&state, &headers)?;
    let user_id = body.user_id.trim();
    let device_id = body.device_id.trim();
    if !is_valid_id(user_id) || !is_valid_id(device_id) {
        return Err(ApiError::bad_request("invalid user_id or device_id"));
    }
    let device = DeviceRef::new(user_id, device_id);
    let issued = state.sessions.issue(state.store.as_ref(), &device).await?;
    tracing::info!(user_id, device_id, "session issued");
    Ok(Json(issued.into()))
}

pub async fn refresh_session(
    State(state): State<AppState>,
    Json(body): Json<RefreshReq>,
) -> ApiResult<Json<SessionOut>> {
    let token = body.refresh_token.trim();
    if token.is_empty() {
        return Err(ApiError::unauthorized("refresh token required"));
    }
    match state.sessions.refresh(state.store.as_ref(), token).await {
        Ok(issued) => {
            tracing::info!(
                security_event = "session_refresh",
                outcome = "renewed",
                token_prefix = %hash_prefix(token),
                rotated = issued.refresh_token.is_some(),
                "session renewed"
            );
            Ok(Json(issued.into()))
        }
        Err(e) => {
            tracing::warn!(
                security_event = "session_refresh",
                outcome = "denied",
                reason = %e,
                token_prefix = %hash_prefix(token),
                "session renewal denied"
            );
            Err(e.into())
        }
    }
}

pub async fn logout(
    State(state): State<AppState>,
    Json(body): Json<RefreshReq>,
) -> ApiResult<Json<serde_json::Value>> {
    let token = body.refresh_token.trim();
    if token.is_empty() {
        return Err(ApiError::bad_request("refresh token required"));
    }
    let revoked = state.sessions.logout(state.store.as_ref(), token).await?;
    tracing::info!(token_prefix = %hash_prefix(token), revoked, "session logout");
    Ok(Json(json!({ "status": "ok", "revoked": revoked })))
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<MeOut>> {
    let identity = require_identity(&state, &headers)?;
    Ok(Json(MeOut {
        user_id: identity.user_id().to_string(),
        device_id: identity.device_id().to_string(),
        expires_at: iso(identity.expires_at),
    }))
}

pub async fn register_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
    Json(body): Json<RegisterKeyReq>,
) -> ApiResult<Json<KeyRecordOut>> {
    let identity = require_identity(&state, &headers)?;
    let group_id = path_id(&group_id, "group")?;
    let signing_key = decode_b64("signing_key_b64", &body.signing_key_b64)?;
    let exchange_key = decode_b64("exchange_key_b64", &body.exchange_key_b64)?;
    let rec = keys::register_device_key(
        state.store.as_ref(),
        &group_id,
        &identity.device,
        signing_key,
        exchange_key,
    )
    .await?;
    Ok(Json(rec.into()))
}

pub async fn reenroll_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
    Json(body): Json<ReenrollKeyReq>,
) -> ApiResult<Json<KeyRecordOut>> {
    let identity = require_identity(&state, &headers)?;
    let group_id = path_id(&group_id, "group")?;
    let user_id = body.user_id.trim();
    let device_id = body.device_id.trim();
    if !is_valid_id(user_id) || !is_valid_id(device_id) {
        return Err(ApiError::bad_request("invalid user_id or device_id"));
    }
    let signing_key = decode_b64("signing_key_b64", &body.signing_key_b64)?;
    let exchange_key = decode_b64("exchange_key_b64", &body.exchange_key_b64)?;
    let rec = keys::reenroll_device_key(
        state.store.as_ref(),
        &group_id,
        identity.user_id(),
        &DeviceRef::new(user_id, device_id),
        signing_key,
        exchange_key,
    )
    .await?;
    Ok(Json(rec.into()))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
    Json(body): Json<RevokeKeyReq>,
) -> ApiResult<Json<KeyRecordOut>> {
    let identity = require_identity(&state, &headers)?;
    let group_id = path_id(&group_id, "group")?;
    let user_id = body
        .user_id
        .as_deref()
        .map(str::trim)
        .unwrap_or(identity.user_id())
        .to_string();
    let device_id = body.device_id.trim().to_string();
    if !is_valid_id(&user_id) || !is_valid_id(&device_id) {
        return Err(ApiError::bad_request("invalid user_id or device_id"));
    }
    let rec = keys::revoke_device_key(
        state.store.as_ref(),
        &group_id,
        identity.user_id(),
        &DeviceRef::new(user_id, device_id),
    )
    .await?;
    Ok(Json(rec.into()))
}

pub async fn group_presence(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(group_id): Path<String>,
) -> ApiResult<Json<GroupPresenceOut>> {
    let identity = require_identity(&state, &headers)?;
    let group_id = path_id(&group_id, "group")?;
    let online = group_snapshot(
        state.store.as_ref(),
        &state.tracker,
        identity.user_id(),
        &group_id,
    )
    .await?;
    Ok(Json(GroupPresenceOut { group_id, online }))
}

fn draft_from_request(
    sender: &DeviceRef,
    conversation_id: &str,
    body: SendReq,
) -> ApiResult<(EnvelopeDraft, Vec<DeviceRef>)> {
    let mut wrapped_keys = Vec::with_capacity(body.wrapped_keys.len());
    for w in &body.wrapped_keys {
        wrapped_keys.push(WrappedKey {
            user_id: w.user_id.trim().to_string(),
            device_id: w.device_id.trim().to_string(),
            wrapped_key: decode_b64("wrapped_key_b64", &w.wrapped_key_b64)?,
            nonce: decode_b64("nonce_b64", &w.nonce_b64)?,
        });
    }
    let recipients: Vec<DeviceRef> = match body.recipients {
        Some(list) => list
            .into_iter()
            .map(|r| DeviceRef::new(r.user_id.trim(), r.device_id.trim()))
            .collect(),
        None => wrapped_keys.iter().map(WrappedKey::device).collect(),
    };
    let draft = EnvelopeDraft {
        message_id: body.message_id.trim().to_string(),
        group_id: body.group_id.trim().to_string(),
        conversation_id: conversation_id.to_string(),
        sender: sender.clone(),
        ephemeral_key: decode_b64("ephemeral_key_b64", &body.ephemeral_key_b64)?,
        iv: decode_b64("iv_b64", &body.iv_b64)?,
        ciphertext: decode_b64("ciphertext_b64", &body.ciphertext_b64)?,
        wrapped_keys,
        signature: decode_b64("signature_b64", &body.signature_b64)?,
    };
    Ok((draft, recipients))
}

pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendReq>,
) -> ApiResult<Json<SendOut>> {
    let identity = require_identity(&state, &headers)?;
    let conversation_id = path_id(&conversation_id, "conversation")?;
    let (draft, recipients) = draft_from_request(&identity.device, &conversation_id, body)?;
    let stored =
        envelope::submit(state.store.as_ref(), &draft, &recipients, &state.limits).await?;
    let delivered = state.hub.deliver_envelope(&stored);
    tracing::info!(
        message_id = %stored.message_id,
        conversation_id = %stored.conversation_id,
        user_id = identity.user_id(),
        device_id = identity.device_id(),
        recipients = stored.wrapped_keys.len(),
        delivered,
        "envelope accepted"
    );
    Ok(Json(SendOut {
        id: stored.id,
        message_id: stored.message_id,
        sent_at: iso(stored.sent_at),
    }))
}

pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<HistoryOut>> {
    let identity = require_identity(&state, &headers)?;
    let conversation_id = path_id(&conversation_id, "conversation")?;
    let since = match params.since.as_deref() {
        Some(raw) => Some(parse_iso8601(raw)?),
        None => None,
    };
    let page = envelope::history(
        state.store.as_ref(),
        &identity.device,
        &conversation_id,
        since,
        params.after_seq,
        params.limit,
    )
    .await?;
    Ok(Json(HistoryOut {
        conversation_id,
        kind: page.kind,
        messages: page.envelopes.iter().map(EnvelopeOut::from).collect(),
        next_after_seq: page.next_after_seq,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ReadOut>> {
    let identity = require_identity(&state, &headers)?;
    let conversation_id = path_id(&conversation_id, "conversation")?;
    let last_read_at =
        gate::mark_conversation_read(state.store.as_ref(), &conversation_id, identity.user_id())
            .await?;
    Ok(Json(ReadOut {
        conversation_id,
        last_read_at: iso(last_read_at),
    }))
}

pub async fn readers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Vec<ReaderOut>>> {
    let identity = require_identity(&state, &headers)?;
    let conversation_id = path_id(&conversation_id, "conversation")?;
    let store = state.store.as_ref();
    if store.conversation(&conversation_id).await.map_err(RelayError::from)?.is_none() {
        return Err(RelayError::NotFound("conversation").into());
    }
    if !store
        .is_conversation_member(&conversation_id, identity.user_id())
        .await
        .map_err(RelayError::from)?
    {
        return Err(RelayError::Unauthorized(DenyReason::SenderNotMember).into());
    }
    let rows = gate::list_readers(store, &conversation_id).await?;
    Ok(Json(rows.into_iter().map(ReaderOut::from).collect()))
}

pub async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> ApiResult<Json<DeleteOut>> {
    let identity = require_identity(&state, &headers)?;
    let message_id = path_id(&message_id, "message")?;
    let deleted =
        envelope::delete_message(state.store.as_ref(), identity.user_id(), &message_id).await?;
    Ok(Json(DeleteOut {
        message_id: deleted.message_id,
        conversation_id: deleted.conversation_id,
        deleted_at: deleted.deleted_at.map(iso),
    }))
}

/// Real-time channel. Browsers' EventSource cannot set headers, so the
/// access token may also arrive as a query parameter; the trace layer never
/// records query strings.
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<EventsParams>,
) -> ApiResult<impl IntoResponse> {
    let identity = match params.access_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() && bearer_token(&headers).is_none() => {
            state.sessions.verify_access(token)?
        }
        _ => require_identity(&state, &headers)?,
    };

    let (guard, rx) = state.hub.connect(&state.tracker, identity.device);
    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((event, (rx, guard)))
    })
    .map(|event| Event::default().event(event.name()).json_data(&event));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(StdDuration::from_secs(15))
            .text("keep-alive"),
    ))
}
