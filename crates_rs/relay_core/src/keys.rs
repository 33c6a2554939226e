//! Device key record lifecycle: register, rotate, revoke, admin re-enrollment.

use crate::error::{RelayError, RelayResult};
use crate::gate::DenyReason;
use crate::model::{
    DeviceKeyRecord, DeviceKeyStatus, DeviceRef, GroupRole, NewDeviceKey, EXCHANGE_KEY_LEN,
    SIGNING_KEY_LEN,
};
use crate::store::{MembershipStore, RevokedKey};
use chrono::Utc;

fn check_key_lengths(signing_key: &[u8], exchange_key: &[u8]) -> RelayResult<()> {
    if signing_key.len() != SIGNING_KEY_LEN {
        return Err(RelayError::malformed("invalid signing key length"));
    }
    if exchange_key.len() != EXCHANGE_KEY_LEN {
        return Err(RelayError::malformed("invalid exchange key length"));
    }
    Ok(())
}

/// Register or rotate the caller's own device in a group. Every write of an
/// existing tuple gets a fresh `key_version`. A revoked tuple stays revoked:
/// only [`reenroll_device_key`] brings it back.
pub async fn register_device_key<S>(
    store: &S,
    group_id: &str,
    device: &DeviceRef,
    signing_key: Vec<u8>,
    exchange_key: Vec<u8>,
) -> RelayResult<DeviceKeyRecord>
where
    S: MembershipStore + ?Sized,
{
    check_key_lengths(&signing_key, &exchange_key)?;
    if !store.is_group_member(group_id, &device.user_id).await? {
        return Err(RelayError::Unauthorized(DenyReason::NotGroupMember));
    }
    let key = NewDeviceKey {
        group_id: group_id.to_string(),
        device: device.clone(),
        signing_key,
        exchange_key,
    };
    let Some(rec) = store
        .upsert_device_key(&key, RevokedKey::Keep, Utc::now())
        .await?
    else {
        tracing::warn!(
            security_event = "key_register",
            outcome = "denied",
            reason = DenyReason::DeviceRevoked.as_str(),
            group_id,
            user_id = %device.user_id,
            device_id = %device.device_id,
            "revoked device tried to re-register"
        );
        return Err(RelayError::Unauthorized(DenyReason::DeviceRevoked));
    };
    tracing::info!(
        group_id,
        user_id = %device.user_id,
        device_id = %device.device_id,
        key_version = rec.key_version,
        "device key registered"
    );
    Ok(rec)
}

/// Admin path for bringing a revoked device back with fresh keys. The target
/// must already have a record and still be a group member; the result always
/// carries a new `key_version`.
pub async fn reenroll_device_key<S>(
    store: &S,
    group_id: &str,
    actor_user_id: &str,
    target: &DeviceRef,
    signing_key: Vec<u8>,
    exchange_key: Vec<u8>,
) -> RelayResult<DeviceKeyRecord>
where
    S: MembershipStore + ?Sized,
{
    check_key_lengths(&signing_key, &exchange_key)?;
    match store.group_role(group_id, actor_user_id).await? {
        None => return Err(RelayError::Unauthorized(DenyReason::NotGroupMember)),
        Some(GroupRole::Member) => {
            return Err(RelayError::Unauthorized(DenyReason::NotPermitted))
        }
        Some(GroupRole::Admin) => {}
    }
    if !store.is_group_member(group_id, &target.user_id).await? {
        return Err(RelayError::Unauthorized(DenyReason::NotGroupMember));
    }
    let status = store
        .device_key_status(group_id, &target.user_id, &target.device_id)
        .await?;
    if status == DeviceKeyStatus::Absent {
        return Err(RelayError::NotFound("device key"));
    }
    let key = NewDeviceKey {
        group_id: group_id.to_string(),
        device: target.clone(),
        signing_key,
        exchange_key,
    };
    let rec = store
        .upsert_device_key(&key, RevokedKey::Reactivate, Utc::now())
        .await?
        .ok_or(RelayError::NotFound("device key"))?;
    tracing::warn!(
        security_event = "key_reenroll",
        outcome = "reactivated",
        group_id,
        actor_user_id,
        user_id = %target.user_id,
        device_id = %target.device_id,
        key_version = rec.key_version,
        "device key re-enrolled"
    );
    Ok(rec)
}

/// Revoke `target` in a group. Allowed for the target's own user or a group
/// admin. Revoking an already revoked record returns it unchanged.
pub async fn revoke_device_key<S>(
    store: &S,
    group_id: &str,
    actor_user_id: &str,
    target: &DeviceRef,
) -> RelayResult<DeviceKeyRecord>
where
    S: MembershipStore + ?Sized,
{
    let Some(role) = store.group_role(group_id, actor_user_id).await? else {
        return Err(RelayError::Unauthorized(DenyReason::NotGroupMember));
    };
    if target.user_id != actor_user_id && role != GroupRole::Admin {
        return Err(RelayError::Unauthorized(DenyReason::NotPermitted));
    }
    let rec = store
        .revoke_device_key(group_id, target, Utc::now())
        .await?
        .ok_or(RelayError::NotFound("device key"))?;
    tracing::warn!(
        security_event = "key_revoke",
        outcome = "revoked",
        group_id,
        actor_user_id,
        user_id = %target.user_id,
        device_id = %target.device_id,
        key_version = rec.key_version,
        "device key revoked"
    );
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeyStatus;
    use crate::store::memory::MemoryStore;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_group("g1", "team").expect("group");
        store.add_group_member("g1", "admin", GroupRole::Admin).expect("admin");
        store.add_group_member("g1", "alice", GroupRole::Member).expect("alice");
        store.add_group_member("g1", "bob", GroupRole::Member).expect("bob");
        store
    }

    #[tokio::test]
    async fn register_rejects_wrong_key_lengths_and_non_members() {
        let store = seeded();
        let dev = DeviceRef::new("alice", "phone");
        let err = register_device_key(&store, "g1", &dev, vec![0; 31], vec![0; 32])
            .await
            .expect_err("short signing key");
        assert!(matches!(err, RelayError::Malformed(_)));

        let outsider = DeviceRef::new("mallory", "laptop");
        let err = register_device_key(&store, "g1", &outsider, vec![0; 32], vec![0; 32])
            .await
            .expect_err("non member");
        assert!(matches!(
            err,
            RelayError::Unauthorized(DenyReason::NotGroupMember)
        ));
    }

    #[tokio::test]
    async fn members_cannot_revoke_each_other_but_admins_can() {
        let store = seeded();
        let bob = DeviceRef::new("bob", "tablet");
        register_device_key(&store, "g1", &bob, vec![1; 32], vec![2; 32])
            .await
            .expect("register");

        let err = revoke_device_key(&store, "g1", "alice", &bob)
            .await
            .expect_err("peer revoke");
        assert!(matches!(
            err,
            RelayError::Unauthorized(DenyReason::NotPermitted)
        ));

        let rec = revoke_device_key(&store, "g1", "admin", &bob)
            .await
            .expect("admin revoke");
        assert_eq!(rec.status, KeyStatus::Revoked);

        let again = revoke_device_key(&store, "g1", "bob", &bob)
            .await
            .expect("self revoke is idempotent");
        assert_eq!(again.key_version, rec.key_version);
    }

    #[tokio::test]
    async fn revoking_unknown_device_is_not_found() {
        let store = seeded();
        let err = revoke_device_key(&store, "g1", "alice", &DeviceRef::new("alice", "ghost"))
            .await
            .expect_err("absent");
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn rotation_mints_a_new_version() {
        let store = seeded();
        let dev = DeviceRef::new("alice", "phone");
        let v1 = register_device_key(&store, "g1", &dev, vec![1; 32], vec![2; 32])
            .await
            .expect("v1");
        let v2 = register_device_key(&store, "g1", &dev, vec![3; 32], vec![4; 32])
            .await
            .expect("v2");
        assert!(v2.key_version > v1.key_version);
        assert_eq!(v2.status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn revoked_device_cannot_reactivate_itself() {
        let store = seeded();
        let bob = DeviceRef::new("bob", "b1");
        register_device_key(&store, "g1", &bob, vec![1; 32], vec![2; 32])
            .await
            .expect("register");
        revoke_device_key(&store, "g1", "admin", &bob)
            .await
            .expect("admin revoke");

        let err = register_device_key(&store, "g1", &bob, vec![5; 32], vec![6; 32])
            .await
            .expect_err("self re-register");
        assert!(matches!(
            err,
            RelayError::Unauthorized(DenyReason::DeviceRevoked)
        ));
        assert_eq!(
            store
                .device_key_status("g1", "bob", "b1")
                .await
                .expect("status"),
            DeviceKeyStatus::Revoked
        );
    }

    #[tokio::test]
    async fn only_admins_reenroll_and_it_bumps_the_version() {
        let store = seeded();
        let bob = DeviceRef::new("bob", "b1");
        let v1 = register_device_key(&store, "g1", &bob, vec![1; 32], vec![2; 32])
            .await
            .expect("register");
        revoke_device_key(&store, "g1", "bob", &bob)
            .await
            .expect("self revoke");

        let err = reenroll_device_key(&store, "g1", "alice", &bob, vec![3; 32], vec![4; 32])
            .await
            .expect_err("member");
        assert!(matches!(
            err,
            RelayError::Unauthorized(DenyReason::NotPermitted)
        ));
        let err = reenroll_device_key(&store, "g1", "bob", &bob, vec![3; 32], vec![4; 32])
            .await
            .expect_err("device owner");
        assert!(matches!(
            err,
            RelayError::Unauthorized(DenyReason::NotPermitted)
        ));

        let missing = DeviceRef::new("bob", "never-registered");
        let err = reenroll_device_key(&store, "g1", "admin", &missing, vec![3; 32], vec![4; 32])
            .await
            .expect_err("absent");
        assert!(matches!(err, RelayError::NotFound(_)));

        let v2 = reenroll_device_key(&store, "g1", "admin", &bob, vec![3; 32], vec![4; 32])
            .await
            .expect("admin re-enroll");
        assert_eq!(v2.status, KeyStatus::Active);
        assert_eq!(v2.key_version, v1.key_version + 1);
        assert_eq!(v2.signing_key, vec![3; 32]);
    }
}
