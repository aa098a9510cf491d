use std::time::Duration;

use delivery_engine::{
    canonical_json, classify_secret_strength, generate_secret, idempotency_key, now_rfc3339,
    sign_payload, validate_secret_format, verify_signature, DeliveryId, SecretStrength,
    SignatureRejection, DEFAULT_TOLERANCE,
};
use serde_json::json;
use time::OffsetDateTime;

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

#[test]
fn canonical_json_is_stable_across_key_order() {
    let a = json!({ "b": 1, "a": { "d": [3, 1], "c": true } });
    let b = json!({ "a": { "c": true, "d": [3, 1] }, "b": 1 });
    assert_eq!(canonical_json(&a), canonical_json(&b));

    // Array order is semantic and must survive.
    let c = json!({ "a": { "c": true, "d": [1, 3] }, "b": 1 });
    assert_ne!(canonical_json(&a), canonical_json(&c));
}

#[test]
fn signature_round_trip_verifies() {
    let payload = json!({ "hello": "world", "n": 42 });
    let timestamp = now_rfc3339();
    let signature = sign_payload(SECRET, &payload, &timestamp);
    assert!(signature.starts_with("sha256="));

    // The same payload with reordered keys still verifies.
    let reordered = json!({ "n": 42, "hello": "world" });
    let check = verify_signature(
        SECRET,
        &reordered,
        &timestamp,
        &signature,
        DEFAULT_TOLERANCE,
        OffsetDateTime::now_utc(),
    );
    assert!(check.is_valid, "reason: {:?}", check.reason);
}

#[test]
fn tampered_payload_is_rejected() {
    let payload = json!({ "amount": 100 });
    let timestamp = now_rfc3339();
    let signature = sign_payload(SECRET, &payload, &timestamp);

    let tampered = json!({ "amount": 101 });
    let check = verify_signature(
        SECRET,
        &tampered,
        &timestamp,
        &signature,
        DEFAULT_TOLERANCE,
        OffsetDateTime::now_utc(),
    );
    assert!(!check.is_valid);
    assert_eq!(check.reason, Some(SignatureRejection::Mismatch));
}

#[test]
fn stale_and_future_timestamps_are_rejected() {
    let payload = json!({ "k": "v" });
    let now = OffsetDateTime::now_utc();
    let tolerance = Duration::from_secs(300);

    let old = now - time::Duration::seconds(301);
    let old_ts = old.format(&time::format_description::well_known::Rfc3339).unwrap();
    let signature = sign_payload(SECRET, &payload, &old_ts);
    let check = verify_signature(SECRET, &payload, &old_ts, &signature, tolerance, now);
    assert_eq!(check.reason, Some(SignatureRejection::TooOld));

    let future = now + time::Duration::seconds(301);
    let future_ts = future
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap();
    let signature = sign_payload(SECRET, &payload, &future_ts);
    let check = verify_signature(SECRET, &payload, &future_ts, &signature, tolerance, now);
    assert_eq!(check.reason, Some(SignatureRejection::TooFarInFuture));
}

#[test]
fn timestamps_inside_the_window_are_accepted() {
    let payload = json!({ "k": "v" });
    let now = OffsetDateTime::now_utc();
    let tolerance = Duration::from_secs(300);

    // One second shy of the window, and the window edge itself.
    for age in [299, 300] {
        let ts = (now - time::Duration::seconds(age))
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap();
        let signature = sign_payload(SECRET, &payload, &ts);
        let check = verify_signature(SECRET, &payload, &ts, &signature, tolerance, now);
        assert!(check.is_valid, "age {age}s rejected: {:?}", check.reason);
    }
}

#[test]
fn malformed_inputs_are_rejected_before_comparison() {
    let payload = json!({});
    let now = OffsetDateTime::now_utc();
    let timestamp = now_rfc3339();

    let check = verify_signature(
        SECRET,
        &payload,
        "not-a-timestamp",
        "sha256=00",
        DEFAULT_TOLERANCE,
        now,
    );
    assert_eq!(check.reason, Some(SignatureRejection::MalformedTimestamp));

    let check = verify_signature(
        SECRET,
        &payload,
        &timestamp,
        "md5=abcdef",
        DEFAULT_TOLERANCE,
        now,
    );
    assert_eq!(check.reason, Some(SignatureRejection::MalformedSignature));

    let check = verify_signature(
        SECRET,
        &payload,
        &timestamp,
        "sha256=zzzz",
        DEFAULT_TOLERANCE,
        now,
    );
    assert_eq!(check.reason, Some(SignatureRejection::MalformedSignature));
}

#[test]
fn idempotency_key_is_deterministic_and_short() {
    let id = DeliveryId("dlv_1".to_string());
    let key1 = idempotency_key(&id, "2026-01-01T00:00:00Z");
    let key2 = idempotency_key(&id, "2026-01-01T00:00:00Z");
    assert_eq!(key1, key2);
    assert_eq!(key1.len(), 32);
    assert!(key1.chars().all(|c| c.is_ascii_hexdigit()));

    // A different timestamp yields a different key.
    let key3 = idempotency_key(&id, "2026-01-01T00:00:01Z");
    assert_ne!(key1, key3);
}

#[test]
fn generated_secrets_pass_format_validation() {
    let secret = generate_secret(32);
    assert_eq!(secret.len(), 64);
    assert!(validate_secret_format(&secret).is_ok());

    assert!(validate_secret_format("short").is_err());
    assert!(validate_secret_format(&"a".repeat(300)).is_err());
    assert!(validate_secret_format("white space padded to thirty two!").is_err());
}

#[test]
fn secret_strength_classification() {
    assert_eq!(
        classify_secret_strength(&"a".repeat(40)),
        SecretStrength::Weak
    );
    assert_eq!(
        classify_secret_strength("aB3dE5gH7jK9mN1pQr2sT4uV6wX8yZ0a"),
        SecretStrength::Medium
    );
    let strong = format!("Ab1-{}", generate_secret(32));
    assert_eq!(classify_secret_strength(&strong), SecretStrength::Strong);
}
