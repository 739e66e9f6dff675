use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::Role;

/// A user account row.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub role: Role,
    pub failed_attempts: i64,
    pub locked_until: Option<String>,
}

pub fn insert_user(
    conn: &Connection,
    username: &str,
    password_hash: &str,
    salt: &str,
    role: Role,
) -> Result<Uuid, DatabaseError> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO users (id, username, password_hash, salt, role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.to_string(),
            username,
            password_hash,
            salt,
            role.as_str(),
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(id)
}

pub fn get_user_by_username(
    conn: &Connection,
    username: &str,
) -> Result<Option<UserRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, username, password_hash, salt, role, failed_attempts, locked_until
             FROM users WHERE username = ?1",
            params![username],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((id, username, password_hash, salt, role, failed_attempts, locked_until)) => {
            let id = Uuid::parse_str(&id).map_err(|_| DatabaseError::InvalidEnum {
                field: "users.id".into(),
                value: id,
            })?;
            let role = Role::parse(&role).ok_or(DatabaseError::InvalidEnum {
                field: "users.role".into(),
                value: role,
            })?;
            Ok(Some(UserRow {
                id,
                username,
                password_hash,
                salt,
                role,
                failed_attempts,
                locked_until,
            }))
        }
    }
}

pub fn record_failed_attempt(
    conn: &Connection,
    user_id: &Uuid,
    locked_until: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE users SET failed_attempts = failed_attempts + 1, locked_until = ?2
         WHERE id = ?1",
        params![user_id.to_string(), locked_until],
    )?;
    Ok(())
}

pub fn reset_failures(conn: &Connection, user_id: &Uuid) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE users SET failed_attempts = 0, locked_until = NULL WHERE id = ?1",
        params![user_id.to_string()],
    )?;
    Ok(())
}

pub fn insert_session(
    conn: &Connection,
    token_hash: &str,
    user_id: &Uuid,
    role: Role,
    expires_at: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO sessions (token_hash, user_id, role, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            token_hash,
            user_id.to_string(),
            role.as_str(),
            chrono::Utc::now().to_rfc3339(),
            expires_at
        ],
    )?;
    Ok(())
}

/// An authenticated session, resolved from a bearer token hash.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub expires_at: String,
}

pub fn get_session(
    conn: &Connection,
    token_hash: &str,
) -> Result<Option<SessionRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT s.user_id, u.username, s.role, s.expires_at
             FROM sessions s JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ?1",
            params![token_hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((user_id, username, role, expires_at)) => {
            let user_id = Uuid::parse_str(&user_id).map_err(|_| DatabaseError::InvalidEnum {
                field: "sessions.user_id".into(),
                value: user_id,
            })?;
            let role = Role::parse(&role).ok_or(DatabaseError::InvalidEnum {
                field: "sessions.role".into(),
                value: role,
            })?;
            Ok(Some(SessionRow {
                user_id,
                username,
                role,
                expires_at,
            }))
        }
    }
}

pub fn delete_session(conn: &Connection, token_hash: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?1",
        params![token_hash],
    )?;
    Ok(())
}

pub fn prune_expired_sessions(conn: &Connection, now: &str) -> Result<usize, DatabaseError> {
    let n = conn.execute(
        "DELETE FROM sessions WHERE expires_at < ?1",
        params![now],
    )?;
    Ok(n)
}
