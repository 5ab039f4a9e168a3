//! Bounded-lifetime device token minting

use crate::config::{AuthSection, SigningAlgorithm, MAX_TOKEN_LIFETIME_SECS};
use crate::error::AgentError;
use crate::protocol::DeviceIdentity;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// One hour, the lifetime used when nothing else is configured
pub const DEFAULT_TOKEN_LIFETIME: std::time::Duration = std::time::Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to read private key '{path}': {source}")]
    KeyRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Private key is not a valid {algorithm:?} PEM key: {source}")]
    InvalidKey {
        algorithm: SigningAlgorithm,
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    #[error("Token signing failed: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
    #[error("Token lifetime must be between 1 and {max} seconds, got {got}")]
    InvalidLifetime { got: u64, max: u64 },
}

impl From<CredentialError> for AgentError {
    fn from(error: CredentialError) -> Self {
        AgentError::credential(error.to_string())
    }
}

/// Registered claims the broker checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// A signed device token and the claims it was minted with
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub audience: String,
    pub token: String,
}

impl AuthToken {
    pub fn lifetime(&self) -> Duration {
        self.expires_at - self.issued_at
    }
}

// The signed token is a bearer credential and never reaches the logs.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("audience", &self.audience)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Signs device tokens with a key loaded once at startup
#[derive(Clone)]
pub struct CredentialMinter {
    key: EncodingKey,
    algorithm: SigningAlgorithm,
    lifetime: Duration,
    audience: String,
}

impl fmt::Debug for CredentialMinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMinter")
            .field("algorithm", &self.algorithm)
            .field("lifetime", &self.lifetime)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl CredentialMinter {
    /// Build a minter from PEM key material held in memory
    pub fn from_pem(
        pem: &[u8],
        algorithm: SigningAlgorithm,
        lifetime: std::time::Duration,
        audience: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let secs = lifetime.as_secs();
        if secs == 0 || secs > MAX_TOKEN_LIFETIME_SECS {
            return Err(CredentialError::InvalidLifetime {
                got: secs,
                max: MAX_TOKEN_LIFETIME_SECS,
            });
        }

        let key = match algorithm {
            SigningAlgorithm::RS256 => EncodingKey::from_rsa_pem(pem),
            SigningAlgorithm::ES256 => EncodingKey::from_ec_pem(pem),
        }
        .map_err(|source| CredentialError::InvalidKey { algorithm, source })?;

        Ok(Self {
            key,
            algorithm,
            lifetime: Duration::seconds(secs as i64),
            audience: audience.into(),
        })
    }

    /// Read the configured key file once; later mints reuse the parsed key.
    pub fn from_config(
        auth: &AuthSection,
        identity: &DeviceIdentity,
    ) -> Result<Self, CredentialError> {
        let pem = read_key_file(&auth.private_key_path)?;
        let minter = Self::from_pem(
            &pem,
            auth.algorithm,
            std::time::Duration::from_secs(auth.token_lifetime_secs),
            identity.audience(),
        )?;

        info!(
            algorithm = ?auth.algorithm,
            lifetime_secs = auth.token_lifetime_secs,
            audience = identity.audience(),
            "Loaded device signing key"
        );

        Ok(minter)
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Mint a token issued at `now`
    pub fn mint(&self, now: DateTime<Utc>) -> Result<AuthToken, CredentialError> {
        let expires_at = now + self.lifetime;
        let claims = Claims {
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            aud: self.audience.clone(),
        };

        let header = Header::new(match self.algorithm {
            SigningAlgorithm::RS256 => Algorithm::RS256,
            SigningAlgorithm::ES256 => Algorithm::ES256,
        });
        let token = encode(&header, &claims, &self.key).map_err(CredentialError::Signing)?;

        debug!(
            audience = %self.audience,
            expires_at = %expires_at,
            "Minted device token"
        );

        Ok(AuthToken {
            issued_at: now,
            expires_at,
            audience: self.audience.clone(),
            token,
        })
    }

    pub fn mint_now(&self) -> Result<AuthToken, CredentialError> {
        self.mint(Utc::now())
    }
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, CredentialError> {
    std::fs::read(path).map_err(|source| CredentialError::KeyRead {
        path: path.display().to_string(),
        source,
    })
}
