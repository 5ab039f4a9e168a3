//! Device credentials
//!
//! The broker authenticates a device by a short-lived signed token presented
//! as the MQTT password. Tokens are minted fresh for every connection attempt.

pub mod token;

pub use token::{AuthToken, Claims, CredentialError, CredentialMinter, DEFAULT_TOKEN_LIFETIME};
