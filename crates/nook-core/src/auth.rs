//! Shared-secret authentication
//!
//! One token for the whole process, loaded at startup. No users, no
//! expiry, no rotation. Comparison is constant-time.

use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Header carrying the token on HTTP requests
pub const TOKEN_HEADER: &str = "x-auth-token";

/// Query parameter carrying the token (downloads, WebSocket handshake)
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Bytes of entropy in a generated token
const GENERATED_TOKEN_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Auth token must not be empty")]
    Empty,
    #[error("System RNG failure")]
    Rng,
}

/// The process-wide shared secret
#[derive(Debug)]
pub struct AuthToken {
    secret: SecretString,
}

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Result<Self, AuthError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(AuthError::Empty);
        }
        Ok(Self {
            secret: SecretString::new(token),
        })
    }

    /// Random hex token for deployments that didn't configure one
    pub fn generate() -> Result<Self, AuthError> {
        let mut bytes = [0u8; GENERATED_TOKEN_BYTES];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| AuthError::Rng)?;

        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self::new(hex)
    }

    /// Check a caller-presented token. Missing counts as wrong.
    pub fn verify(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(candidate) => ring::constant_time::verify_slices_are_equal(
                self.secret.expose_secret().as_bytes(),
                candidate.as_bytes(),
            )
            .is_ok(),
            None => false,
        }
    }

    /// The raw token, for the one-time startup banner only
    pub fn reveal(&self) -> &str {
        self.secret.expose_secret()
    }
}
