//! Session identity: short-lived bearer access tokens and long-lived renewal
//! credentials stored only as SHA-256 hashes.

use crate::error::StoreError;
use crate::model::{DeviceRef, RefreshRecord};
use crate::store::CredentialStore;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Delete the presented renewal credential and hand out a new one on
    /// every renewal.
    pub rotate_refresh: bool,
}

impl SessionConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: "relay".to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(30),
            rotate_refresh: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid credential")]
    Invalid,

    #[error("credential expired")]
    Expired,

    #[error("token signing failed")]
    Signing,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The identity a verified access token resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub device: DeviceRef,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    pub fn user_id(&self) -> &str {
        &self.device.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct IssuedSession {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    /// `None` when renewal does not rotate; the presented credential stays valid.
    pub refresh_token: Option<String>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    did: String,
    typ: String,
    iss: String,
    iat: i64,
    exp: i64,
}

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

pub fn hash_prefix(value: &str) -> String {
    sha256_hex(value).chars().take(12).collect()
}

fn generate_token_hex_32() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SessionIssuer {
    cfg: SessionConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl SessionIssuer {
    pub fn new(cfg: SessionConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[cfg.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation,
            cfg,
        }
    }

    /// Mint an access token and a fresh renewal credential for an identity
    /// that an upstream authority has already verified.
    pub async fn issue<S>(&self, store: &S, device: &DeviceRef) -> Result<IssuedSession, SessionError>
    where
        S: CredentialStore + ?Sized,
    {
        let now = Utc::now();
        let (refresh_token, refresh_expires_at) =
            self.store_refresh(store, device, now + self.cfg.refresh_ttl, now).await?;
        let (access_token, access_expires_at) = self.sign_access(device, now)?;
        Ok(IssuedSession {
            access_token,
            access_expires_at,
            refresh_token: Some(refresh_token),
            refresh_expires_at,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<Identity, SessionError> {
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SessionError::Expired,
                _ => SessionError::Invalid,
            })?;
        let claims = data.claims;
        if claims.typ != ACCESS_TOKEN_TYPE {
            return Err(SessionError::Invalid);
        }
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(SessionError::Invalid)?;
        Ok(Identity {
            device: DeviceRef::new(claims.sub, claims.did),
            expires_at,
        })
    }

    /// Exchange a renewal credential for a new access token. With rotation
    /// on, the presented credential is consumed and a replacement carrying
    /// the original expiry is returned; a second use of the old one fails.
    pub async fn refresh<S>(&self, store: &S, refresh_token: &str) -> Result<IssuedSession, SessionError>
    where
        S: CredentialStore + ?Sized,
    {
        let token_hash = sha256_hex(refresh_token.trim());
        let record = store
            .find_refresh(&token_hash)
            .await?
            .ok_or(SessionError::Invalid)?;
        let now = Utc::now();
        if record.expires_at <= now {
            let _ = store.delete_refresh(&token_hash).await?;
            return Err(SessionError::Expired);
        }
        let device = DeviceRef::new(record.user_id.clone(), record.device_id.clone());

        let refresh_token = if self.cfg.rotate_refresh {
            if !store.delete_refresh(&token_hash).await? {
                return Err(SessionError::Invalid);
            }
            let (next, _) = self
                .store_refresh(store, &device, record.expires_at, now)
                .await?;
            Some(next)
        } else {
            None
        };

        let (access_token, access_expires_at) = self.sign_access(&device, now)?;
        Ok(IssuedSession {
            access_token,
            access_expires_at,
            refresh_token,
            refresh_expires_at: record.expires_at,
        })
    }

    /// Revoke by hash match. `false` when nothing matched.
    pub async fn logout<S>(&self, store: &S, refresh_token: &str) -> Result<bool, SessionError>
    where
        S: CredentialStore + ?Sized,
    {
        Ok(store.delete_refresh(&sha256_hex(refresh_token.trim())).await?)
    }

    fn sign_access(
        &self,
        device: &DeviceRef,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), SessionError> {
        let expires_at = now + self.cfg.access_ttl;
        let claims = AccessClaims {
            sub: device.user_id.clone(),
            did: device.device_id.clone(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
            iss: self.cfg.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| SessionError::Signing)?;
        Ok((token, expires_at))
    }

    async fn store_refresh<S>(
        &self,
        store: &S,
        device: &DeviceRef,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), SessionError>
    where
        S: CredentialStore + ?Sized,
    {
        let token = generate_token_hex_32();
        let record = RefreshRecord {
            token_hash: sha256_hex(&token),
            user_id: device.user_id.clone(),
            device_id: device.device_id.clone(),
            expires_at,
            created_at: now,
        };
        store.insert_refresh(&record).await?;
        Ok((token, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn issuer(rotate: bool) -> SessionIssuer {
        let mut cfg = SessionConfig::new("test-secret-test-secret-test-secret");
        cfg.rotate_refresh = rotate;
        SessionIssuer::new(cfg)
    }

    #[tokio::test]
    async fn issued_access_token_resolves_to_the_device() {
        let store = MemoryStore::new();
        let iss = issuer(true);
        let dev = DeviceRef::new("alice", "phone");
        let s = iss.issue(&store, &dev).await.expect("issue");
        let id = iss.verify_access(&s.access_token).expect("verify");
        assert_eq!(id.device, dev);
        assert!(id.expires_at <= Utc::now() + Duration::minutes(15));

        let refresh = s.refresh_token.expect("refresh token");
        let stored = store
            .find_refresh(&sha256_hex(&refresh))
            .await
            .expect("lookup")
            .expect("stored by hash");
        assert_eq!(stored.user_id, "alice");
        assert!(store.find_refresh(&refresh).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn expired_and_foreign_tokens_are_rejected() {
        let iss = issuer(true);
        let past = Utc::now() - Duration::minutes(1);
        let claims = AccessClaims {
            sub: "alice".to_string(),
            did: "phone".to_string(),
            typ: ACCESS_TOKEN_TYPE.to_string(),
            iss: "relay".to_string(),
            iat: (past - Duration::minutes(15)).timestamp(),
            exp: past.timestamp(),
        };
        let stale = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &iss.encoding)
            .expect("encode");
        assert!(matches!(iss.verify_access(&stale), Err(SessionError::Expired)));

        let other = SessionIssuer::new(SessionConfig::new("another-secret-another-secret-xx"));
        let store = MemoryStore::new();
        let s = other
            .issue(&store, &DeviceRef::new("alice", "phone"))
            .await
            .expect("issue");
        assert!(matches!(
            iss.verify_access(&s.access_token),
            Err(SessionError::Invalid)
        ));
        assert!(matches!(iss.verify_access("garbage"), Err(SessionError::Invalid)));
    }

    #[tokio::test]
    async fn rotating_refresh_consumes_the_old_credential() {
        let store = MemoryStore::new();
        let iss = issuer(true);
        let s = iss
            .issue(&store, &DeviceRef::new("alice", "phone"))
            .await
            .expect("issue");
        let first = s.refresh_token.expect("refresh");

        let renewed = iss.refresh(&store, &first).await.expect("renew");
        let second = renewed.refresh_token.expect("rotated");
        assert_ne!(first, second);
        assert_eq!(renewed.refresh_expires_at, s.refresh_expires_at);

        assert!(matches!(
            iss.refresh(&store, &first).await,
            Err(SessionError::Invalid)
        ));
        iss.refresh(&store, &second).await.expect("new credential works");
    }

    #[tokio::test]
    async fn non_rotating_refresh_keeps_the_credential_until_logout() {
        let store = MemoryStore::new();
        let iss = issuer(false);
        let s = iss
            .issue(&store, &DeviceRef::new("alice", "phone"))
            .await
            .expect("issue");
        let token = s.refresh_token.expect("refresh");

        let renewed = iss.refresh(&store, &token).await.expect("renew");
        assert!(renewed.refresh_token.is_none());
        iss.refresh(&store, &token).await.expect("still valid");

        assert!(iss.logout(&store, &token).await.expect("logout"));
        assert!(!iss.logout(&store, &token).await.expect("second logout"));
        assert!(matches!(
            iss.refresh(&store, &token).await,
            Err(SessionError::Invalid)
        ));
    }

    #[tokio::test]
    async fn expired_refresh_is_rejected_and_purged() {
        let store = MemoryStore::new();
        let iss = issuer(true);
        let token = "expired-refresh-token";
        let now = Utc::now();
        store
            .insert_refresh(&RefreshRecord {
                token_hash: sha256_hex(token),
                user_id: "alice".to_string(),
                device_id: "phone".to_string(),
                expires_at: now - Duration::seconds(1),
                created_at: now - Duration::days(30),
            })
            .await
            .expect("seed");
        assert!(matches!(
            iss.refresh(&store, token).await,
            Err(SessionError::Expired)
        ));
        assert!(store
            .find_refresh(&sha256_hex(token))
            .await
            .expect("lookup")
            .is_none());
    }
}
