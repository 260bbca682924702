use serde::{Deserialize, Serialize};

// ============================================================================
// Secret
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub workspace_id: String,
    pub environment: String,
    pub secret_path: String,
    pub key_name: String,
    #[serde(skip_serializing)]
    pub ciphertext: String,
    #[serde(skip_serializing)]
    pub iv: String,
    #[serde(skip_serializing)]
    pub tag: String,
    pub algorithm: String,
    pub key_encoding: String,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSecretInput {
    pub workspace_id: String,
    pub environment: String,
    pub secret_path: String,
    pub key_name: String,
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub algorithm: String,
    pub key_encoding: String,
}

/// New ciphertext for one secret. The store bumps the version itself.
#[derive(Debug, Clone)]
pub struct SecretValueUpdate {
    pub secret_id: String,
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub algorithm: String,
    pub key_encoding: String,
}

// ============================================================================
// Secret Version (append-only)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretVersion {
    pub id: String,
    pub secret_id: String,
    pub version: i64,
    #[serde(skip_serializing)]
    pub ciphertext: String,
    #[serde(skip_serializing)]
    pub iv: String,
    #[serde(skip_serializing)]
    pub tag: String,
    pub created_at: String,
}
