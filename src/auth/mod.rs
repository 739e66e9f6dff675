//! User identity: password verification, bearer sessions, lockout.
//!
//! Tokens are 32 random bytes, URL-safe base64 on the wire and SHA-256
//! hashed at rest. Passwords use PBKDF2-HMAC-SHA256 with a per-user salt.
//! After `MAX_FAILED_ATTEMPTS` consecutive failures the account locks for
//! a cooldown window; both the failures and the lockout are audited by
//! the caller.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use pbkdf2::pbkdf2_hmac;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::canonical::hex_encode;
use crate::db::repository;
use crate::db::DatabaseError;
use crate::models::Role;

const PBKDF2_ROUNDS: u32 = 100_000;
const MAX_FAILED_ATTEMPTS: i64 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_HOURS: i64 = 12;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account locked until {0}")]
    Locked(String),
    #[error("session expired")]
    SessionExpired,
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

/// Result of a successful login.
#[derive(Debug)]
pub struct IssuedSession {
    pub token: String,
    pub role: Role,
    pub expires_at: String,
}

/// Generate a random bearer token (URL-safe base64, 32 bytes of entropy).
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a bearer token for storage and lookup.
pub fn hash_token(token: &str) -> String {
    hex_encode(&Sha256::digest(token.as_bytes()))
}

/// Derive the stored password hash from a password and hex salt.
pub fn hash_password(password: &str, salt_hex: &str) -> String {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt_hex.as_bytes(),
        PBKDF2_ROUNDS,
        &mut out,
    );
    hex_encode(&out)
}

/// Create a user with a fresh salt. Used by the admin CLI and tests.
pub fn create_user(
    conn: &Connection,
    username: &str,
    password: &str,
    role: Role,
) -> Result<Uuid, AuthError> {
    let salt: [u8; 16] = rand::random();
    let salt_hex = hex_encode(&salt);
    let password_hash = hash_password(password, &salt_hex);
    let id = repository::insert_user(conn, username, &password_hash, &salt_hex, role)?;
    Ok(id)
}

/// Verify credentials and issue a session token.
///
/// Counts consecutive failures and locks the account after the limit.
/// A successful login clears the failure counter.
pub fn login(
    conn: &Connection,
    username: &str,
    password: &str,
    now: DateTime<Utc>,
) -> Result<IssuedSession, AuthError> {
    let user = repository::get_user_by_username(conn, username)?
        .ok_or(AuthError::InvalidCredentials)?;

    if let Some(until) = &user.locked_until {
        if let Ok(until_ts) = DateTime::parse_from_rfc3339(until) {
            if now < until_ts.with_timezone(&Utc) {
                return Err(AuthError::Locked(until.clone()));
            }
        }
    }

    if hash_password(password, &user.salt) != user.password_hash {
        let lock = if user.failed_attempts + 1 >= MAX_FAILED_ATTEMPTS {
            Some((now + Duration::minutes(LOCKOUT_MINUTES)).to_rfc3339())
        } else {
            None
        };
        repository::record_failed_attempt(conn, &user.id, lock.as_deref())?;
        if let Some(until) = lock {
            tracing::warn!(username, "Account locked after repeated failures");
            return Err(AuthError::Locked(until));
        }
        return Err(AuthError::InvalidCredentials);
    }

    repository::reset_failures(conn, &user.id)?;

    let token = generate_token();
    let expires_at = (now + Duration::hours(SESSION_HOURS)).to_rfc3339();
    repository::insert_session(conn, &hash_token(&token), &user.id, user.role, &expires_at)?;

    Ok(IssuedSession {
        token,
        role: user.role,
        expires_at,
    })
}

/// Resolve a bearer token to its user, rejecting expired sessions.
pub fn validate(
    conn: &Connection,
    token: &str,
    now: DateTime<Utc>,
) -> Result<AuthedUser, AuthError> {
    let session = repository::get_session(conn, &hash_token(token))?
        .ok_or(AuthError::InvalidCredentials)?;

    let expires = DateTime::parse_from_rfc3339(&session.expires_at)
        .map_err(|_| AuthError::SessionExpired)?;
    if now >= expires.with_timezone(&Utc) {
        repository::delete_session(conn, &hash_token(token))?;
        return Err(AuthError::SessionExpired);
    }

    Ok(AuthedUser {
        user_id: session.user_id,
        username: session.username,
        role: session.role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    #[test]
    fn login_round_trip() {
        let conn = open_memory_database().unwrap();
        create_user(&conn, "ana", "lozinka-123", Role::Accountant).unwrap();

        let session = login(&conn, "ana", "lozinka-123", Utc::now()).unwrap();
        assert_eq!(session.role, Role::Accountant);

        let user = validate(&conn, &session.token, Utc::now()).unwrap();
        assert_eq!(user.username, "ana");
        assert_eq!(user.role, Role::Accountant);
    }

    #[test]
    fn wrong_password_rejected() {
        let conn = open_memory_database().unwrap();
        create_user(&conn, "ana", "lozinka-123", Role::Accountant).unwrap();

        let err = login(&conn, "ana", "kriva-lozinka", Utc::now()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn unknown_user_rejected_without_detail() {
        let conn = open_memory_database().unwrap();
        let err = login(&conn, "nobody", "x", Utc::now()).unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[test]
    fn account_locks_after_repeated_failures() {
        let conn = open_memory_database().unwrap();
        create_user(&conn, "ana", "lozinka-123", Role::Accountant).unwrap();

        let now = Utc::now();
        for _ in 0..4 {
            let err = login(&conn, "ana", "wrong", now).unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }
        // Fifth failure trips the lock.
        let err = login(&conn, "ana", "wrong", now).unwrap_err();
        assert!(matches!(err, AuthError::Locked(_)));

        // Even the correct password is refused while locked.
        let err = login(&conn, "ana", "lozinka-123", now).unwrap_err();
        assert!(matches!(err, AuthError::Locked(_)));
    }

    #[test]
    fn lock_expires_after_cooldown() {
        let conn = open_memory_database().unwrap();
        create_user(&conn, "ana", "lozinka-123", Role::Accountant).unwrap();

        let now = Utc::now();
        for _ in 0..5 {
            let _ = login(&conn, "ana", "wrong", now);
        }

        let later = now + Duration::minutes(LOCKOUT_MINUTES + 1);
        let session = login(&conn, "ana", "lozinka-123", later).unwrap();
        assert!(!session.token.is_empty());
    }

    #[test]
    fn success_resets_failure_counter() {
        let conn = open_memory_database().unwrap();
        create_user(&conn, "ana", "lozinka-123", Role::Accountant).unwrap();

        let now = Utc::now();
        for _ in 0..4 {
            let _ = login(&conn, "ana", "wrong", now);
        }
        login(&conn, "ana", "lozinka-123", now).unwrap();

        // Counter reset: four more failures do not lock.
        for _ in 0..4 {
            let err = login(&conn, "ana", "wrong", now).unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }
    }

    #[test]
    fn expired_session_rejected() {
        let conn = open_memory_database().unwrap();
        create_user(&conn, "ana", "lozinka-123", Role::Admin).unwrap();

        let session = login(&conn, "ana", "lozinka-123", Utc::now()).unwrap();
        let far_future = Utc::now() + Duration::hours(SESSION_HOURS + 1);
        let err = validate(&conn, &session.token, far_future).unwrap_err();
        assert!(matches!(err, AuthError::SessionExpired));
    }

    #[test]
    fn token_hash_is_stable_and_distinct() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }

    #[test]
    fn generated_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }
}
