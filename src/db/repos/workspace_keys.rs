use rusqlite::{params, OptionalExtension};

use crate::db::models::EncryptedState;
use crate::db::DbPool;
use crate::error::AppError;

pub fn get(pool: &DbPool, workspace_id: &str) -> Result<Option<EncryptedState>, AppError> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            "SELECT encrypted_key, iv, tag, algorithm, key_encoding
             FROM workspace_keys WHERE workspace_id = ?1",
            params![workspace_id],
            |row| {
                Ok(EncryptedState {
                    ciphertext: row.get(0)?,
                    iv: row.get(1)?,
                    tag: row.get(2)?,
                    algorithm: row.get(3)?,
                    key_encoding: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Store a wrapped key unless one already exists, then return whichever is stored.
/// Concurrent first use converges on a single key.
pub fn insert_if_absent(
    pool: &DbPool,
    workspace_id: &str,
    wrapped: &EncryptedState,
) -> Result<EncryptedState, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    {
        let conn = pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO workspace_keys
             (workspace_id, encrypted_key, iv, tag, algorithm, key_encoding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                workspace_id,
                wrapped.ciphertext,
                wrapped.iv,
                wrapped.tag,
                wrapped.algorithm,
                wrapped.key_encoding,
                now
            ],
        )?;
    }
    get(pool, workspace_id)?
        .ok_or_else(|| AppError::NotFound(format!("WorkspaceKey {workspace_id}")))
}
