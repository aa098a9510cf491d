use std::sync::Arc;

use delivery_engine::{
    ByosConfig, CreateSecretOptions, DestinationId, EncryptedSecret, InMemorySecretStore,
    SecretCipher, SecretManager, SecretStrength,
};

const KEY: [u8; 32] = [7u8; 32];

fn manager() -> SecretManager {
    SecretManager::new(KEY, Arc::new(InMemorySecretStore::new()))
}

fn dest(id: &str) -> DestinationId {
    DestinationId(id.to_string())
}

#[test]
fn cipher_round_trip_with_aad() {
    let cipher = SecretCipher::new(KEY);
    let encrypted = cipher.encrypt(b"super-secret", b"dest_1").unwrap();
    let plaintext = cipher.decrypt(&encrypted, b"dest_1").unwrap();
    assert_eq!(plaintext.as_slice(), b"super-secret");

    // A ciphertext bound to one destination must not decrypt for another.
    assert!(cipher.decrypt(&encrypted, b"dest_2").is_err());
}

#[test]
fn encrypted_secret_hex_round_trip() {
    let cipher = SecretCipher::new(KEY);
    let encrypted = cipher.encrypt(b"material", b"aad").unwrap();
    let parsed = EncryptedSecret::from_hex(&encrypted.to_hex()).unwrap();
    assert_eq!(parsed, encrypted);

    assert!(EncryptedSecret::from_hex("not hex").is_err());
    assert!(EncryptedSecret::from_hex("00").is_err());
}

#[tokio::test]
async fn create_secret_generates_material_when_absent() {
    let manager = manager();
    let created = manager
        .create_secret(
            &dest("dest_1"),
            CreateSecretOptions {
                is_primary: true,
                created_by: "test".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(created.record.id.starts_with("whsec_"));
    assert_eq!(created.plaintext.len(), 64);
    assert!(created.record.is_primary);
    assert!(created.record.is_active);

    let primary = manager.get_primary_secret(&dest("dest_1")).await.unwrap();
    assert_eq!(primary.unwrap().secret, created.plaintext);
}

#[tokio::test]
async fn creating_a_new_primary_demotes_the_old_one() {
    let manager = manager();
    let first = manager
        .create_secret(
            &dest("dest_1"),
            CreateSecretOptions {
                is_primary: true,
                created_by: "test".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let second = manager
        .create_secret(
            &dest("dest_1"),
            CreateSecretOptions {
                is_primary: true,
                created_by: "test".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let primary = manager
        .get_primary_secret(&dest("dest_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(primary.id, second.record.id);
    assert_ne!(primary.id, first.record.id);

    // Exactly one active secret remains; the old primary was deactivated,
    // not deleted.
    let active = manager.get_active_secrets(&dest("dest_1")).await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn rotation_requires_an_existing_primary() {
    let manager = manager();
    let err = manager.rotate_secret(&dest("dest_1"), "test").await;
    assert!(err.is_err());

    manager
        .create_secret(
            &dest("dest_1"),
            CreateSecretOptions {
                is_primary: true,
                created_by: "test".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let rotated = manager.rotate_secret(&dest("dest_1"), "test").await.unwrap();
    assert!(rotated.record.is_primary);

    let primary = manager
        .get_primary_secret(&dest("dest_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(primary.id, rotated.record.id);
}

#[tokio::test]
async fn byos_deactivates_every_existing_secret() {
    let manager = manager();
    for is_primary in [true, false] {
        manager
            .create_secret(
                &dest("dest_1"),
                CreateSecretOptions {
                    is_primary,
                    created_by: "test".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let customer_secret = "Customer-Provided-Key-0123456789abcdef";
    let created = manager
        .configure_byos(
            &dest("dest_1"),
            ByosConfig {
                secret: customer_secret.to_string(),
                customer_managed_rotation: false,
            },
            "admin",
        )
        .await
        .unwrap();

    assert!(created.record.is_primary);
    // Rotation is ours, so a validity window is imposed.
    assert!(created.record.expires_at.is_some());

    let active = manager.get_active_secrets(&dest("dest_1")).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].secret, customer_secret);
}

#[tokio::test]
async fn byos_with_customer_rotation_has_no_forced_expiry() {
    let manager = manager();
    let created = manager
        .configure_byos(
            &dest("dest_1"),
            ByosConfig {
                secret: "Customer-Provided-Key-0123456789abcdef".to_string(),
                customer_managed_rotation: true,
            },
            "admin",
        )
        .await
        .unwrap();
    assert!(created.record.expires_at.is_none());
}

#[tokio::test]
async fn byos_rejects_malformed_material() {
    let manager = manager();
    let err = manager
        .configure_byos(
            &dest("dest_1"),
            ByosConfig {
                secret: "too short".to_string(),
                customer_managed_rotation: true,
            },
            "admin",
        )
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn weak_material_is_flagged_but_accepted() {
    let manager = manager();
    let created = manager
        .create_secret(
            &dest("dest_1"),
            CreateSecretOptions {
                secret: Some("a".repeat(40)),
                is_primary: true,
                created_by: "test".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.strength, SecretStrength::Weak);
}

#[tokio::test]
async fn expired_secrets_are_swept() {
    let manager = manager();
    manager
        .create_secret(
            &dest("dest_1"),
            CreateSecretOptions {
                is_primary: true,
                expires_in_days: Some(-1),
                created_by: "test".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    manager
        .create_secret(
            &dest("dest_2"),
            CreateSecretOptions {
                is_primary: true,
                created_by: "test".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let summary = manager.cleanup_expired_secrets().await;
    assert_eq!(summary.removed, 1);
    assert!(summary.errors.is_empty());

    // The unexpired secret survives.
    let remaining = manager.get_active_secrets(&dest("dest_2")).await.unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn lookups_on_unknown_destinations_are_empty() {
    let manager = manager();
    assert!(manager
        .get_active_secrets(&dest("nowhere"))
        .await
        .unwrap()
        .is_empty());
    assert!(manager
        .get_primary_secret(&dest("nowhere"))
        .await
        .unwrap()
        .is_none());
}
