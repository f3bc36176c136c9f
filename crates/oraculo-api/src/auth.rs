//! Password accounts and opaque bearer sessions.
//!
//! Passwords are stored as Argon2id digests with a per-user random salt.
//! Session tokens are 32 random bytes handed to the caller in hex; only the
//! SHA-256 of a token is persisted.

use anyhow::{anyhow, Context};
use argon2::{Algorithm, Argon2, Params, Version};
use oraculo_core::{Profile, Role, SessionUser};
use oraculo_store_sqlite::NewProfile;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::OraculoApi;

pub const MIN_PASSWORD_CHARS: usize = 8;

const HASH_SCHEME: &str = "argon2id-v19";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const TOKEN_LEN: usize = 32;
const ARGON2_MEMORY_COST: u32 = 19 * 1024;
const ARGON2_TIME_COST: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("not authenticated")]
    Unauthenticated,
    #[error("email already registered: {0}")]
    EmailTaken(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A freshly issued bearer token and the user it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user: SessionUser,
}

impl OraculoApi {
    /// Register a regular user.
    ///
    /// # Errors
    /// Returns [`AuthError::Validation`] for a malformed email, blank name, or short
    /// password, [`AuthError::EmailTaken`] for a duplicate email, and
    /// [`AuthError::Backend`] when hashing or persistence fails.
    pub fn sign_up(&self, email: &str, password: &str, full_name: &str) -> Result<Profile, AuthError> {
        let email = normalize_email(email)?;
        let full_name = full_name.trim();
        if full_name.is_empty() {
            return Err(AuthError::Validation("full_name MUST be provided".to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(AuthError::Validation(format!(
                "password MUST have at least {MIN_PASSWORD_CHARS} characters"
            )));
        }

        let mut store = self.store()?;
        if store.profile_credentials(&email)?.is_some() {
            return Err(AuthError::EmailTaken(email));
        }
        let profile = store.insert_profile(&NewProfile {
            email,
            full_name: full_name.to_string(),
            role: Role::User,
            password_hash: hash_password(password)?,
        })?;
        tracing::info!(user = %profile.email, "account created");
        Ok(profile)
    }

    /// Verify credentials and open a new session.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidCredentials`] for an unknown email or wrong password.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = normalize_email(email)?;
        let mut store = self.store()?;
        let Some((profile, stored_hash)) = store.profile_credentials(&email)? else {
            tracing::warn!(user = %email, "sign-in rejected: unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &stored_hash)? {
            tracing::warn!(user = %email, "sign-in rejected: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let token = new_token();
        store.insert_session(&token_hash(&token), profile.id)?;
        tracing::info!(user = %profile.email, "session opened");
        Ok(Session { token, user: SessionUser::from(profile) })
    }

    /// Resolve the caller behind a bearer token.
    ///
    /// # Errors
    /// Returns [`AuthError::Unauthenticated`] when the token is unknown or revoked.
    pub fn current_user(&self, token: &str) -> Result<SessionUser, AuthError> {
        let store = self.store()?;
        store
            .session_profile(&token_hash(token))?
            .map(SessionUser::from)
            .ok_or(AuthError::Unauthenticated)
    }

    /// Revoke a session token.
    ///
    /// # Errors
    /// Returns [`AuthError::Unauthenticated`] when the token was not an open session.
    pub fn logout(&self, token: &str) -> Result<(), AuthError> {
        let mut store = self.store()?;
        if store.delete_session(&token_hash(token))? {
            Ok(())
        } else {
            Err(AuthError::Unauthenticated)
        }
    }
}

fn normalize_email(raw: &str) -> Result<String, AuthError> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(AuthError::Validation(format!("invalid email: {raw}"))),
    }
}

fn new_token() -> String {
    let mut bytes = [0_u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn derive_key(password: &str, salt: &[u8]) -> anyhow::Result<[u8; HASH_LEN]> {
    let params = Params::new(ARGON2_MEMORY_COST, ARGON2_TIME_COST, ARGON2_PARALLELISM, Some(HASH_LEN))
        .map_err(|err| anyhow!("invalid argon2 parameters: {err}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0_u8; HASH_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(key)
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    let mut salt = [0_u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_key(password, &salt)?;
    Ok(format!("{HASH_SCHEME}${}${}", hex::encode(salt), hex::encode(key)))
}

fn verify_password(password: &str, stored: &str) -> anyhow::Result<bool> {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(salt_hex), Some(key_hex), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(anyhow!("malformed stored password hash"));
    };
    if scheme != HASH_SCHEME {
        return Err(anyhow!("unsupported password hash scheme: {scheme}"));
    }
    let salt = hex::decode(salt_hex).context("stored password salt is not hex")?;
    let expected = hex::decode(key_hex).context("stored password digest is not hex")?;
    let actual = derive_key(password, &salt)?;

    // Compare every byte so timing does not reveal the first mismatch.
    let diff = actual
        .iter()
        .zip(expected.iter())
        .fold(u8::from(actual.len() != expected.len()), |acc, (lhs, rhs)| acc | (lhs ^ rhs));
    Ok(diff == 0)
}
