//! SurrealDB schema migrations and initialization
//!
//! Safe to call multiple times (every statement is `IF NOT EXISTS`).

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all masher tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing masher SurrealDB schema");

    init_pushes_table(db).await?;
    init_repo_locks_table(db).await?;

    info!("masher schema initialization complete");
    Ok(())
}

/// Initialize `pushes` table
///
/// Schema:
/// ```text
/// TABLE pushes {
///   push_id:     STRING (unique)
///   repo_key:    STRING (indexed, e.g. "f17-updates")
///   active:      BOOL   (false once terminal)
///   cancel_requested: BOOL (set in place, never cleared)
///   history_len: INT    (phase records in `document`; write guard)
///   created_at:  DATETIME
///   document:    STRING (serialized PushRecord)
/// }
/// ```
///
/// Append-only phase history and terminal immutability are checked by the
/// store before every write, and the write itself only applies while the row
/// is still active at the `history_len` that was checked. Deletes are not
/// permitted.
async fn init_pushes_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing pushes table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS pushes AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_push_id ON TABLE pushes COLUMNS push_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_push_repo ON TABLE pushes COLUMNS repo_key;
        DEFINE INDEX IF NOT EXISTS idx_push_active ON TABLE pushes COLUMNS active;
    "#;

    db.query(sql).await?.check()?;
    info!("pushes table initialized");
    Ok(())
}

/// Initialize `repo_locks` table
///
/// Schema:
/// ```text
/// TABLE repo_locks {
///   repo_key:     STRING (unique: one holder per repository)
///   release:      STRING
///   request:      STRING
///   push_id:      STRING
///   acquired_at:  DATETIME
/// }
/// ```
///
/// The UNIQUE index on `repo_key` is what makes acquisition exclusive: a
/// second `CREATE` for the same key fails inside the database.
async fn init_repo_locks_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing repo_locks table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS repo_locks SCHEMAFULL;
        DEFINE FIELD IF NOT EXISTS repo_key ON repo_locks TYPE string;
        DEFINE FIELD IF NOT EXISTS release ON repo_locks TYPE string;
        DEFINE FIELD IF NOT EXISTS request ON repo_locks TYPE string;
        DEFINE FIELD IF NOT EXISTS push_id ON repo_locks TYPE string;
        DEFINE FIELD IF NOT EXISTS acquired_at ON repo_locks TYPE datetime;
        DEFINE INDEX IF NOT EXISTS idx_lock_repo ON TABLE repo_locks COLUMNS repo_key UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    info!("repo_locks table initialized");
    Ok(())
}
