use rusqlite::{params, Connection, Row};

use crate::db::models::{CreateSecretInput, SecretRecord, SecretValueUpdate, SecretVersion};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_secret(row: &Row) -> rusqlite::Result<SecretRecord> {
    Ok(SecretRecord {
        id: row.get("id")?,
        workspace_id: row.get("workspace_id")?,
        environment: row.get("environment")?,
        secret_path: row.get("secret_path")?,
        key_name: row.get("key_name")?,
        ciphertext: row.get("ciphertext")?,
        iv: row.get("iv")?,
        tag: row.get("tag")?,
        algorithm: row.get("algorithm")?,
        key_encoding: row.get("key_encoding")?,
        version: row.get("version")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_version(row: &Row) -> rusqlite::Result<SecretVersion> {
    Ok(SecretVersion {
        id: row.get("id")?,
        secret_id: row.get("secret_id")?,
        version: row.get("version")?,
        ciphertext: row.get("ciphertext")?,
        iv: row.get("iv")?,
        tag: row.get("tag")?,
        created_at: row.get("created_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<SecretRecord, AppError> {
    let conn = pool.get()?;
    conn.query_row("SELECT * FROM secrets WHERE id = ?1", params![id], row_to_secret)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Secret {id}")),
            other => AppError::Database(other),
        })
}

pub fn create(pool: &DbPool, input: CreateSecretInput) -> Result<SecretRecord, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO secrets
         (id, workspace_id, environment, secret_path, key_name, ciphertext, iv, tag,
          algorithm, key_encoding, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11)",
        params![
            id,
            input.workspace_id,
            input.environment,
            input.secret_path,
            input.key_name,
            input.ciphertext,
            input.iv,
            input.tag,
            input.algorithm,
            input.key_encoding,
            now,
        ],
    )?;
    drop(conn);

    get_by_id(pool, &id)
}

/// Secrets among `ids` that live in the given workspace and environment.
/// Ids outside that scope are silently absent from the result.
pub fn find_by_ids(
    pool: &DbPool,
    workspace_id: &str,
    environment: &str,
    ids: &[String],
) -> Result<Vec<SecretRecord>, AppError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = pool.get()?;
    let placeholders = (0..ids.len())
        .map(|i| format!("?{}", i + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT * FROM secrets
         WHERE workspace_id = ?1 AND environment = ?2 AND id IN ({placeholders})"
    );
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&workspace_id, &environment];
    for id in ids {
        values.push(id);
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(values.as_slice(), row_to_secret)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(AppError::Database)
}

/// Replace the ciphertext of every listed secret and bump its version.
/// Returns the updated records in input order. Runs on the caller's
/// transaction: a secret outside the scope returns `NotFound` and the caller
/// rolls back.
pub fn bulk_update(
    conn: &Connection,
    workspace_id: &str,
    environment: &str,
    updates: &[SecretValueUpdate],
) -> Result<Vec<SecretRecord>, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut updated = Vec::with_capacity(updates.len());
    for u in updates {
        let rows = conn.execute(
            "UPDATE secrets
             SET ciphertext = ?1, iv = ?2, tag = ?3, algorithm = ?4, key_encoding = ?5,
                 version = version + 1, updated_at = ?6
             WHERE id = ?7 AND workspace_id = ?8 AND environment = ?9",
            params![
                u.ciphertext,
                u.iv,
                u.tag,
                u.algorithm,
                u.key_encoding,
                now,
                u.secret_id,
                workspace_id,
                environment
            ],
        )?;
        if rows == 0 {
            return Err(AppError::NotFound(format!("Secret {}", u.secret_id)));
        }
        let record = conn.query_row(
            "SELECT * FROM secrets WHERE id = ?1",
            params![u.secret_id],
            row_to_secret,
        )?;
        updated.push(record);
    }
    Ok(updated)
}

/// Append one version row per secret, capturing its current ciphertext and version.
pub fn insert_versions(conn: &Connection, secrets: &[SecretRecord]) -> Result<(), AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    for s in secrets {
        conn.execute(
            "INSERT INTO secret_versions
             (id, secret_id, workspace_id, environment, key_name, ciphertext, iv, tag,
              algorithm, key_encoding, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                uuid::Uuid::new_v4().to_string(),
                s.id,
                s.workspace_id,
                s.environment,
                s.key_name,
                s.ciphertext,
                s.iv,
                s.tag,
                s.algorithm,
                s.key_encoding,
                s.version,
                now,
            ],
        )?;
    }
    Ok(())
}

pub fn get_versions(pool: &DbPool, secret_id: &str) -> Result<Vec<SecretVersion>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM secret_versions WHERE secret_id = ?1 ORDER BY version DESC",
    )?;
    let rows = stmt.query_map(params![secret_id], row_to_version)?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(AppError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    fn input(workspace: &str, env: &str, key: &str) -> CreateSecretInput {
        CreateSecretInput {
            workspace_id: workspace.into(),
            environment: env.into(),
            secret_path: "/".into(),
            key_name: key.into(),
            ciphertext: "ct".into(),
            iv: "iv".into(),
            tag: "tag".into(),
            algorithm: "aes-256-gcm".into(),
            key_encoding: "utf8".into(),
        }
    }

    fn update(id: &str, ct: &str) -> SecretValueUpdate {
        SecretValueUpdate {
            secret_id: id.into(),
            ciphertext: ct.into(),
            iv: "iv2".into(),
            tag: "tag2".into(),
            algorithm: "aes-256-gcm".into(),
            key_encoding: "base64".into(),
        }
    }

    #[test]
    fn test_find_by_ids_is_scoped() {
        let pool = init_test_db().unwrap();
        let a = create(&pool, input("ws-1", "prod", "DB_USER")).unwrap();
        let b = create(&pool, input("ws-1", "dev", "DB_USER")).unwrap();
        let c = create(&pool, input("ws-2", "prod", "DB_USER")).unwrap();

        let found = find_by_ids(&pool, "ws-1", "prod", &[a.id.clone(), b.id, c.id]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
        assert!(find_by_ids(&pool, "ws-1", "prod", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_bulk_update_bumps_version_and_records_history() {
        let pool = init_test_db().unwrap();
        let a = create(&pool, input("ws-1", "prod", "DB_USER")).unwrap();
        let b = create(&pool, input("ws-1", "prod", "DB_PASSWORD")).unwrap();

        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        let updated = bulk_update(
            &tx,
            "ws-1",
            "prod",
            &[update(&b.id, "new-b"), update(&a.id, "new-a")],
        )
        .unwrap();
        assert_eq!(updated[0].id, b.id);
        assert_eq!(updated[0].version, 2);
        assert_eq!(updated[1].ciphertext, "new-a");
        assert_eq!(updated[1].key_encoding, "base64");

        insert_versions(&tx, &updated).unwrap();
        tx.commit().unwrap();
        drop(conn);
        let versions = get_versions(&pool, &a.id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 2);
    }

    #[test]
    fn test_bulk_update_rolls_back_on_foreign_secret() {
        let pool = init_test_db().unwrap();
        let a = create(&pool, input("ws-1", "prod", "DB_USER")).unwrap();
        let other = create(&pool, input("ws-2", "prod", "DB_USER")).unwrap();

        let mut conn = pool.get().unwrap();
        let tx = conn.transaction().unwrap();
        let result = bulk_update(
            &tx,
            "ws-1",
            "prod",
            &[update(&a.id, "new-a"), update(&other.id, "new-other")],
        );
        assert!(matches!(result, Err(AppError::NotFound(_))));
        drop(tx);
        drop(conn);

        let unchanged = get_by_id(&pool, &a.id).unwrap();
        assert_eq!(unchanged.version, 1);
        assert_eq!(unchanged.ciphertext, "ct");
    }
}
