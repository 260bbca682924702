use rusqlite::Connection;

use crate::error::AppError;

/// Run the consolidated schema migration. Idempotent.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Secrets (the store rotation writes into)
-- ============================================================================

CREATE TABLE IF NOT EXISTS secrets (
    id              TEXT PRIMARY KEY,
    workspace_id    TEXT NOT NULL,
    environment     TEXT NOT NULL,
    secret_path     TEXT NOT NULL DEFAULT '/',
    key_name        TEXT NOT NULL,
    ciphertext      TEXT NOT NULL,
    iv              TEXT NOT NULL,
    tag             TEXT NOT NULL,
    algorithm       TEXT NOT NULL DEFAULT 'aes-256-gcm',
    key_encoding    TEXT NOT NULL DEFAULT 'utf8',
    version         INTEGER NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE(workspace_id, environment, secret_path, key_name)
);
CREATE INDEX IF NOT EXISTS idx_secrets_scope ON secrets(workspace_id, environment);

-- ============================================================================
-- Secret Versions (append-only history)
-- ============================================================================

CREATE TABLE IF NOT EXISTS secret_versions (
    id              TEXT PRIMARY KEY,
    secret_id       TEXT NOT NULL REFERENCES secrets(id) ON DELETE CASCADE,
    workspace_id    TEXT NOT NULL,
    environment     TEXT NOT NULL,
    key_name        TEXT NOT NULL,
    ciphertext      TEXT NOT NULL,
    iv              TEXT NOT NULL,
    tag             TEXT NOT NULL,
    algorithm       TEXT NOT NULL,
    key_encoding    TEXT NOT NULL,
    version         INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE(secret_id, version)
);
CREATE INDEX IF NOT EXISTS idx_secret_versions_secret ON secret_versions(secret_id);

-- ============================================================================
-- Workspace Keys (per-workspace data key, wrapped by the root codec)
-- ============================================================================

CREATE TABLE IF NOT EXISTS workspace_keys (
    workspace_id    TEXT PRIMARY KEY,
    encrypted_key   TEXT NOT NULL,
    iv              TEXT NOT NULL,
    tag             TEXT NOT NULL,
    algorithm       TEXT NOT NULL,
    key_encoding    TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

-- ============================================================================
-- Secret Rotations (policies + encrypted working state)
-- ============================================================================

CREATE TABLE IF NOT EXISTS secret_rotations (
    id                  TEXT PRIMARY KEY,
    workspace_id        TEXT NOT NULL,
    environment         TEXT NOT NULL,
    secret_path         TEXT NOT NULL,
    provider            TEXT NOT NULL,
    interval_days       INTEGER NOT NULL CHECK(interval_days >= 1),
    status              TEXT CHECK(status IS NULL OR status IN ('success','failed')),
    status_message      TEXT,
    last_rotated_at     TEXT,
    encrypted_data      TEXT NOT NULL,
    encrypted_data_iv   TEXT NOT NULL,
    encrypted_data_tag  TEXT NOT NULL,
    algorithm           TEXT NOT NULL,
    key_encoding        TEXT NOT NULL CHECK(key_encoding IN ('utf8','base64')),
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sr_workspace ON secret_rotations(workspace_id);

CREATE TABLE IF NOT EXISTS secret_rotation_outputs (
    rotation_id     TEXT NOT NULL REFERENCES secret_rotations(id) ON DELETE CASCADE,
    position        INTEGER NOT NULL,
    key             TEXT NOT NULL,
    secret_id       TEXT NOT NULL,
    PRIMARY KEY (rotation_id, key)
);
CREATE INDEX IF NOT EXISTS idx_sro_secret ON secret_rotation_outputs(secret_id);

-- ============================================================================
-- Secret Rotation History (append-only timeline)
-- ============================================================================

CREATE TABLE IF NOT EXISTS secret_rotation_history (
    id              TEXT PRIMARY KEY,
    rotation_id     TEXT NOT NULL REFERENCES secret_rotations(id) ON DELETE CASCADE,
    status          TEXT NOT NULL
                    CHECK(status IN ('success','failed','skipped')),
    detail          TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_srh_rotation ON secret_rotation_history(rotation_id);
CREATE INDEX IF NOT EXISTS idx_srh_created  ON secret_rotation_history(created_at DESC);
"#;

/// Incremental migrations for databases created by earlier builds.
pub fn run_incremental(conn: &Connection) -> Result<(), AppError> {
    // Reserved reference to a user-defined provider template
    let has_custom_provider: bool = conn
        .prepare("SELECT COUNT(*) FROM pragma_table_info('secret_rotations') WHERE name = 'custom_provider_id'")?
        .query_row([], |row| row.get::<_, i64>(0))
        .map(|c| c > 0)
        .unwrap_or(false);

    if !has_custom_provider {
        conn.execute_batch("ALTER TABLE secret_rotations ADD COLUMN custom_provider_id TEXT;")?;
        tracing::info!("Added custom_provider_id column to secret_rotations");
    }

    Ok(())
}
