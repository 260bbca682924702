use rusqlite::{params, Connection, Row};

use super::secrets as secret_repo;
use crate::db::models::{
    EncryptedState, NewSecretRotation, RotationHistoryEntry, RotationOutput, RotationStatus,
    SecretRecord, SecretRotation, SecretValueUpdate,
};
use crate::db::DbPool;
use crate::error::AppError;

// ============================================================================
// Row Mappers
// ============================================================================

fn row_to_policy(row: &Row) -> rusqlite::Result<SecretRotation> {
    let status: Option<String> = row.get("status")?;
    Ok(SecretRotation {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        environment: row.get("environment")?,
        secret_path: row.get("secret_path")?,
        provider: row.get("provider")?,
        custom_provider_id: row.get("custom_provider_id")?,
        interval: row.get("interval_days")?,
        outputs: Vec::new(),
        status: status.as_deref().and_then(RotationStatus::parse),
        status_message: row.get("status_message")?,
        last_rotated_at: row.get("last_rotated_at")?,
        encrypted_data: row.get("encrypted_data")?,
        encrypted_data_iv: row.get("encrypted_data_iv")?,
        encrypted_data_tag: row.get("encrypted_data_tag")?,
        algorithm: row.get("algorithm")?,
        key_encoding: row.get("key_encoding")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_history(row: &Row) -> rusqlite::Result<RotationHistoryEntry> {
    Ok(RotationHistoryEntry {
        id: row.get("id")?,
        rotation_id: row.get("rotation_id")?,
        status: row.get("status")?,
        detail: row.get("detail")?,
        created_at: row.get("created_at")?,
    })
}

fn load_outputs(conn: &Connection, rotation_id: &str) -> Result<Vec<RotationOutput>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT key, secret_id FROM secret_rotation_outputs
         WHERE rotation_id = ?1
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![rotation_id], |row| {
        Ok(RotationOutput {
            key: row.get(0)?,
            secret_id: row.get(1)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(AppError::Database)
}

fn with_outputs(
    conn: &Connection,
    policies: Vec<SecretRotation>,
) -> Result<Vec<SecretRotation>, AppError> {
    policies
        .into_iter()
        .map(|mut p| {
            p.outputs = load_outputs(conn, &p.id)?;
            Ok(p)
        })
        .collect()
}

// ============================================================================
// Rotation Policy CRUD
// ============================================================================

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<SecretRotation, AppError> {
    let conn = pool.get()?;
    let mut policy = conn
        .query_row(
            "SELECT * FROM secret_rotations WHERE id = ?1",
            params![id],
            row_to_policy,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                AppError::NotFound(format!("SecretRotation {id}"))
            }
            other => AppError::Database(other),
        })?;
    policy.outputs = load_outputs(&conn, id)?;
    Ok(policy)
}

pub fn get_by_workspace(pool: &DbPool, workspace_id: &str) -> Result<Vec<SecretRotation>, AppError> {
    let conn = pool.get()?;
    let policies = {
        let mut stmt = conn.prepare(
            "SELECT * FROM secret_rotations WHERE workspace_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![workspace_id], row_to_policy)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    with_outputs(&conn, policies)
}

pub fn get_all(pool: &DbPool) -> Result<Vec<SecretRotation>, AppError> {
    let conn = pool.get()?;
    let policies = {
        let mut stmt = conn.prepare("SELECT * FROM secret_rotations ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], row_to_policy)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    with_outputs(&conn, policies)
}

/// Insert the policy and its output mapping in one transaction.
pub fn create(pool: &DbPool, input: NewSecretRotation) -> Result<SecretRotation, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO secret_rotations
         (id, workspace_id, environment, secret_path, provider, interval_days,
          encrypted_data, encrypted_data_iv, encrypted_data_tag, algorithm, key_encoding,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            id,
            input.workspace_id,
            input.environment,
            input.secret_path,
            input.provider,
            input.interval,
            input.state.ciphertext,
            input.state.iv,
            input.state.tag,
            input.state.algorithm,
            input.state.key_encoding,
            now,
        ],
    )?;
    for (position, output) in input.outputs.iter().enumerate() {
        tx.execute(
            "INSERT INTO secret_rotation_outputs (rotation_id, position, key, secret_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, position as i64, output.key, output.secret_id],
        )?;
    }
    tx.commit()?;
    drop(conn);

    get_by_id(pool, &id)
}

pub fn update_interval(pool: &DbPool, id: &str, interval: i64) -> Result<SecretRotation, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE secret_rotations SET interval_days = ?1, updated_at = ?2 WHERE id = ?3",
        params![interval, now, id],
    )?;
    drop(conn);
    if rows == 0 {
        return Err(AppError::NotFound(format!("SecretRotation {id}")));
    }
    get_by_id(pool, id)
}

/// Commit a successful run in one transaction: new secret values and their
/// versions, then the policy's encrypted state, status and rotation time.
/// Any failure (including the policy having been deleted) leaves all three
/// untouched.
pub fn commit_run(
    pool: &DbPool,
    policy: &SecretRotation,
    updates: &[SecretValueUpdate],
    state: &EncryptedState,
    message: &str,
) -> Result<Vec<SecretRecord>, AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let updated = secret_repo::bulk_update(&tx, &policy.workspace_id, &policy.environment, updates)?;
    secret_repo::insert_versions(&tx, &updated)?;
    mark_success(&tx, &policy.id, state, message)?;
    tx.commit()?;
    Ok(updated)
}

fn mark_success(
    conn: &Connection,
    id: &str,
    state: &EncryptedState,
    message: &str,
) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let rows = conn.execute(
        "UPDATE secret_rotations
         SET encrypted_data = ?1, encrypted_data_iv = ?2, encrypted_data_tag = ?3,
             algorithm = ?4, key_encoding = ?5,
             status = 'success', status_message = ?6, last_rotated_at = ?7, updated_at = ?7
         WHERE id = ?8",
        params![
            state.ciphertext,
            state.iv,
            state.tag,
            state.algorithm,
            state.key_encoding,
            message,
            now,
            id
        ],
    )?;
    if rows == 0 {
        return Err(AppError::NotFound(format!("SecretRotation {id}")));
    }
    Ok(())
}

/// Persist a failed run. The encrypted state columns are left untouched.
pub fn mark_failed(pool: &DbPool, id: &str, message: &str) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "UPDATE secret_rotations
         SET status = 'failed', status_message = ?1, last_rotated_at = ?2, updated_at = ?2
         WHERE id = ?3",
        params![message, now, id],
    )?;
    Ok(())
}

pub fn delete(pool: &DbPool, id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let rows = conn.execute("DELETE FROM secret_rotations WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

// ============================================================================
// Rotation History
// ============================================================================

pub fn get_history(
    pool: &DbPool,
    rotation_id: &str,
    limit: Option<i64>,
) -> Result<Vec<RotationHistoryEntry>, AppError> {
    let lim = limit.unwrap_or(50);
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM secret_rotation_history
         WHERE rotation_id = ?1
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![rotation_id, lim], row_to_history)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(AppError::Database)
}

pub fn record_run(
    pool: &DbPool,
    rotation_id: &str,
    status: &str,
    detail: Option<&str>,
) -> Result<RotationHistoryEntry, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO secret_rotation_history
         (id, rotation_id, status, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, rotation_id, status, detail, now],
    )?;

    conn.query_row(
        "SELECT * FROM secret_rotation_history WHERE id = ?1",
        params![id],
        row_to_history,
    )
    .map_err(AppError::Database)
}
