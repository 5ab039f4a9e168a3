//! Device token minting against the fixture key pairs


use chrono::{TimeZone, Utc};
use cloud_iot_agent::auth::{Claims, CredentialError, CredentialMinter};
use cloud_iot_agent::config::SigningAlgorithm;
use cloud_iot_agent::protocol::DeviceIdentity;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use proptest::prelude::*;
use std::time::Duration;

const RSA_PRIVATE: &[u8] = include_bytes!("fixtures/rsa_private.pem");
const RSA_PUBLIC: &[u8] = include_bytes!("fixtures/rsa_public.pem");
const EC_PRIVATE: &[u8] = include_bytes!("fixtures/ec_private.pem");
const EC_PUBLIC: &[u8] = include_bytes!("fixtures/ec_public.pem");

fn validation(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.set_audience(&["proj-a"]);
    validation
}

#[test]
fn test_rs256_token_verifies_with_public_key() {
    let minter =
        CredentialMinter::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256, Duration::from_secs(3600), "proj-a")
            .unwrap();
    let token = minter.mint_now().unwrap();

    assert_eq!(decode_header(&token.token).unwrap().alg, Algorithm::RS256);

    let key = DecodingKey::from_rsa_pem(RSA_PUBLIC).unwrap();
    let data = decode::<Claims>(&token.token, &key, &validation(Algorithm::RS256)).unwrap();

    assert_eq!(data.claims.aud, "proj-a");
    assert_eq!(data.claims.exp - data.claims.iat, 3600);
    assert_eq!(data.claims.iat, token.issued_at.timestamp());
}

#[test]
fn test_es256_token_verifies_with_public_key() {
    let minter =
        CredentialMinter::from_pem(EC_PRIVATE, SigningAlgorithm::ES256, Duration::from_secs(600), "proj-a")
            .unwrap();
    let token = minter.mint_now().unwrap();

    let key = DecodingKey::from_ec_pem(EC_PUBLIC).unwrap();
    let data = decode::<Claims>(&token.token, &key, &validation(Algorithm::ES256)).unwrap();

    assert_eq!(data.claims.exp - data.claims.iat, 600);
}

#[test]
fn test_from_config_uses_identity_audience() {
    let config = test_helpers::test_config();
    let identity = config.identity().unwrap();
    let minter = CredentialMinter::from_config(&config.auth, &identity).unwrap();

    let token = minter.mint_now().unwrap();
    assert_eq!(token.audience, "proj-a");
    assert_eq!(token.lifetime(), chrono::Duration::seconds(3600));
}

#[test]
fn test_missing_key_file_is_key_read_error() {
    let mut config = test_helpers::test_config();
    config.auth.private_key_path = test_helpers::fixture_path("does_not_exist.pem");
    let identity = DeviceIdentity::new("proj-a", "us-central1", "reg-1", "dev-1").unwrap();

    assert!(matches!(
        CredentialMinter::from_config(&config.auth, &identity),
        Err(CredentialError::KeyRead { .. })
    ));
}

#[test]
fn test_wrong_key_type_is_invalid_key() {
    assert!(matches!(
        CredentialMinter::from_pem(RSA_PRIVATE, SigningAlgorithm::ES256, Duration::from_secs(60), "p"),
        Err(CredentialError::InvalidKey { .. })
    ));
    assert!(matches!(
        CredentialMinter::from_pem(b"not a key", SigningAlgorithm::RS256, Duration::from_secs(60), "p"),
        Err(CredentialError::InvalidKey { .. })
    ));
}

#[test]
fn test_each_mint_is_fresh() {
    let minter =
        CredentialMinter::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256, Duration::from_secs(60), "proj-a")
            .unwrap();
    let first = minter.mint(Utc.timestamp_opt(1_700_000_000, 0).unwrap()).unwrap();
    let second = minter.mint(Utc.timestamp_opt(1_700_000_030, 0).unwrap()).unwrap();

    assert_ne!(first.token, second.token);
    assert_eq!(second.issued_at - first.issued_at, chrono::Duration::seconds(30));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn minted_lifetime_matches_configuration(secs in 1u64..=86_400, at in 1_600_000_000i64..1_900_000_000) {
        let minter = CredentialMinter::from_pem(
            RSA_PRIVATE,
            SigningAlgorithm::RS256,
            Duration::from_secs(secs),
            "proj-a",
        ).unwrap();
        let token = minter.mint(Utc.timestamp_opt(at, 0).unwrap()).unwrap();

        prop_assert_eq!(token.lifetime(), chrono::Duration::seconds(secs as i64));
        prop_assert_eq!(token.audience.as_str(), "proj-a");
    }
}
