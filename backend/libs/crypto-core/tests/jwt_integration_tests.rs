/// Integration tests for crypto-core JWT functionality
///
/// This test module covers:
/// - Per-kind key and audience isolation
/// - Expiry handling with fractional-day lifetimes
/// - Error handling for invalid tokens
use chrono::Duration;
use crypto_core::jwt::{JwtSigner, SigningKey};

fn signer_with(issuer: &str, default_secret: &[u8], refresh_secret: &[u8]) -> JwtSigner {
    JwtSigner::new(
        issuer,
        SigningKey::from_secret(default_secret, "storefront-web").expect("default key"),
        SigningKey::from_secret(refresh_secret, "storefront-refresh").expect("refresh key"),
    )
}

fn test_signer() -> JwtSigner {
    signer_with("storefront-test", b"default-integration-secret", b"refresh-integration-secret")
}

// ============================================================================
// Token Generation Tests
// ============================================================================

#[test]
fn test_each_token_gets_unique_identifier() {
    let signer = test_signer();

    let first = signer.claims_for("access", "1", None, Duration::days(1)).unwrap();
    let second = signer.claims_for("access", "1", None, Duration::days(1)).unwrap();

    assert_ne!(first.jti, second.jti, "jti must be unique per issuance");
}

#[test]
fn test_fractional_day_lifetime() {
    let signer = test_signer();

    // 0.25 day = 6 hours
    let claims = signer.claims_for("restore", "1", None, Duration::minutes(6 * 60)).unwrap();
    assert_eq!(claims.exp - claims.iat, 6 * 3600);
}

// ============================================================================
// Token Validation Tests
// ============================================================================

#[test]
fn test_access_round_trip() {
    let signer = test_signer();
    let claims = signer.claims_for("access", "42", None, Duration::days(1)).unwrap();
    let token = signer.sign("access", &claims).expect("Failed to sign token");

    let data = signer.validate(&token, "ACCESS").expect("Should validate");
    assert_eq!(data.claims.sub, "42");
    assert_eq!(data.claims.iss, "storefront-test");
    assert_eq!(data.claims.aud, "storefront-web");
}

#[test]
fn test_kinds_sharing_default_key_cross_validate() {
    let signer = test_signer();
    let claims = signer.claims_for("access", "42", None, Duration::days(1)).unwrap();
    let token = signer.sign("access", &claims).expect("Failed to sign token");

    // Every non-refresh kind resolves to the default key material
    assert!(signer.validate(&token, "restore").is_ok());
}

#[test]
fn test_access_token_rejected_as_refresh() {
    let signer = test_signer();
    let claims = signer.claims_for("access", "42", None, Duration::days(1)).unwrap();
    let token = signer.sign("access", &claims).expect("Failed to sign token");

    assert!(signer.validate(&token, "refresh").is_err());
}

#[test]
fn test_token_from_other_secret_rejected() {
    let signer = test_signer();
    let foreign = signer_with("storefront-test", b"some-other-secret", b"refresh-integration-secret");

    let claims = foreign.claims_for("access", "42", None, Duration::days(1)).unwrap();
    let token = foreign.sign("access", &claims).expect("Failed to sign token");

    assert!(signer.validate(&token, "access").is_err());
}

#[test]
fn test_validate_malformed_token() {
    let signer = test_signer();

    let malformed_tokens = vec!["invalid", "two.parts", "", "...", "invalid!@#$.token"];

    for malformed in malformed_tokens {
        let result = signer.validate(malformed, "access");
        assert!(
            result.is_err(),
            "Should reject malformed token: {}",
            malformed
        );
    }
}

// ============================================================================
// Token Expiration Tests
// ============================================================================

#[test]
fn test_expired_token_rejected_without_leeway() {
    let signer = test_signer();
    let claims = signer.claims_for("access", "42", None, -Duration::seconds(5)).unwrap();
    let token = signer.sign("access", &claims).expect("Failed to sign token");

    assert!(
        signer.validate(&token, "access").is_err(),
        "Token expired five seconds ago must fail"
    );
}
