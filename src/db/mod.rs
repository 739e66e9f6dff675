pub mod repository;
pub mod sqlite;

pub use self::sqlite::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),
}

/// Handle to the relational store. Connections are opened per operation
/// (SQLite serializes writers itself; long-lived shared connections would
/// force a process-wide lock around every read).
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Create the database file if needed and run migrations.
    pub fn initialize(path: PathBuf) -> Result<Self, DatabaseError> {
        let conn = sqlite::open_database(&path)?;
        drop(conn);
        Ok(Self { path })
    }

    /// Open a connection. Migrations already ran in `initialize`.
    pub fn open(&self) -> Result<rusqlite::Connection, DatabaseError> {
        sqlite::open_database(&self.path)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}
