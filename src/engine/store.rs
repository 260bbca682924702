//! Collaborators the rotation engine writes through: the secret store and
//! the per-workspace data keys. SQLite implementations share the policy
//! store's pool.

use std::sync::Arc;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use async_trait::async_trait;
use zeroize::Zeroizing;

use super::crypto::StateCodec;
use crate::db::models::{EncryptedState, SecretRecord, SecretRotation, SecretValueUpdate};
use crate::db::repos::{rotation as rotation_repo, secrets as secret_repo, workspace_keys as key_repo};
use crate::db::DbPool;
use crate::error::AppError;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Secrets among `ids` inside the workspace/environment scope.
    async fn find_by_ids(
        &self,
        workspace_id: &str,
        environment: &str,
        ids: &[String],
    ) -> Result<Vec<SecretRecord>, AppError>;

    /// Replace ciphertexts, bump versions, append version rows and store the
    /// policy's new state as one unit. Returns the updated secrets.
    async fn commit_rotation(
        &self,
        policy: &SecretRotation,
        updates: &[SecretValueUpdate],
        state: &EncryptedState,
        message: &str,
    ) -> Result<Vec<SecretRecord>, AppError>;
}

#[async_trait]
pub trait WorkspaceKeyProvider: Send + Sync {
    async fn workspace_key(&self, workspace_id: &str) -> Result<Zeroizing<[u8; 32]>, AppError>;
}

// ── SQLite secret store ────────────────────────────────────────────

pub struct SqliteSecretStore {
    pool: DbPool,
}

impl SqliteSecretStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn find_by_ids(
        &self,
        workspace_id: &str,
        environment: &str,
        ids: &[String],
    ) -> Result<Vec<SecretRecord>, AppError> {
        secret_repo::find_by_ids(&self.pool, workspace_id, environment, ids)
    }

    async fn commit_rotation(
        &self,
        policy: &SecretRotation,
        updates: &[SecretValueUpdate],
        state: &EncryptedState,
        message: &str,
    ) -> Result<Vec<SecretRecord>, AppError> {
        rotation_repo::commit_run(&self.pool, policy, updates, state, message)
    }
}

// ── SQLite workspace keys ──────────────────────────────────────────

/// Random 32-byte key per workspace, created on first use and stored
/// wrapped by the state codec.
pub struct SqliteWorkspaceKeys {
    pool: DbPool,
    codec: Arc<StateCodec>,
}

impl SqliteWorkspaceKeys {
    pub fn new(pool: DbPool, codec: Arc<StateCodec>) -> Self {
        Self { pool, codec }
    }

    fn unwrap_key(&self, wrapped: &EncryptedState) -> Result<Zeroizing<[u8; 32]>, AppError> {
        let bytes = Zeroizing::new(self.codec.decrypt(wrapped)?);
        if bytes.len() != 32 {
            return Err(AppError::Internal(format!(
                "Workspace key has wrong length: {} (expected 32)",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

#[async_trait]
impl WorkspaceKeyProvider for SqliteWorkspaceKeys {
    async fn workspace_key(&self, workspace_id: &str) -> Result<Zeroizing<[u8; 32]>, AppError> {
        if let Some(wrapped) = key_repo::get(&self.pool, workspace_id)? {
            return self.unwrap_key(&wrapped);
        }

        let mut fresh = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut fresh[..]);
        let wrapped = self.codec.encrypt(&fresh[..])?;
        let stored = key_repo::insert_if_absent(&self.pool, workspace_id, &wrapped)?;
        tracing::info!(workspace_id = %workspace_id, "Created workspace data key");
        self.unwrap_key(&stored)
    }
}
