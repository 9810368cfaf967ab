//! HTTP Basic credentials backed by Argon2id password hashes.

use std::collections::HashMap;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Invalid password hash for user '{user}': {reason}")]
    InvalidHash { user: String, reason: String },

    #[error("Password hashing failed: {0}")]
    Hashing(String),
}

/// Username/password pair decoded from an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Parse the raw header value. Returns `None` for anything that is not well-formed Basic auth.
    pub fn parse(header: &str) -> Option<Self> {
        let encoded = header.strip_prefix("Basic ")?.trim();
        let decoded = match BASE64.decode(encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Invalid base64 in Authorization header");
                return None;
            }
        };
        let text = String::from_utf8(decoded).ok()?;
        let (username, password) = text.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", self.username, self.password))
        )
    }
}

/// Users and their PHC-formatted Argon2 hashes.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// Build from `user -> hash`. Every hash is parsed up front so a bad entry fails at startup.
    pub fn from_hashes(users: HashMap<String, String>) -> Result<Self, CredentialError> {
        for (user, hash) in &users {
            PasswordHash::new(hash).map_err(|e| CredentialError::InvalidHash {
                user: user.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(Self { users })
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    /// CPU-bound; call from `spawn_blocking` on request paths.
    pub fn verify(&self, credentials: &BasicCredentials) -> bool {
        let Some(stored) = self.users.get(&credentials.username) else {
            debug!(username = %credentials.username, "Unknown user");
            return false;
        };

        let parsed = match PasswordHash::new(stored) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(username = %credentials.username, error = %e, "Stored hash is unreadable");
                return false;
            }
        };

        Argon2::default()
            .verify_password(credentials.password.as_bytes(), &parsed)
            .is_ok()
    }
}

/// Hash a password for inclusion in the `[credentials]` config section.
pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hashing(e.to_string()))
}
