use serde::{Deserialize, Serialize};

// ============================================================================
// Secret Rotation Policy
// ============================================================================

/// Outcome of the last completed run. `None` on the policy until the first run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStatus {
    Success,
    Failed,
}

impl RotationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RotationStatus::Success => "success",
            RotationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RotationStatus::Success),
            "failed" => Some(RotationStatus::Failed),
            _ => None,
        }
    }
}

/// Maps a template output key to the secret that receives its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationOutput {
    pub key: String,
    pub secret_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRotation {
    pub id: String,
    pub workspace_id: String,
    pub environment: String,
    pub secret_path: String,
    pub provider: String,
    pub custom_provider_id: Option<String>,
    /// Whole days between runs.
    pub interval: i64,
    /// Ordered as supplied at creation.
    pub outputs: Vec<RotationOutput>,
    pub status: Option<RotationStatus>,
    pub status_message: Option<String>,
    pub last_rotated_at: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_data: String,
    #[serde(skip_serializing)]
    pub encrypted_data_iv: String,
    #[serde(skip_serializing)]
    pub encrypted_data_tag: String,
    pub algorithm: String,
    pub key_encoding: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Request accepted by `RotationService::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRotationInput {
    pub workspace_id: String,
    pub environment: String,
    pub secret_path: String,
    pub provider: String,
    pub interval: i64,
    /// Raw user inputs; string values are coerced per the template schema.
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub outputs: Vec<RotationOutput>,
}

/// Encrypted state columns as written by the policy store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedState {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
    pub algorithm: String,
    pub key_encoding: String,
}

/// Fully validated row handed to the policy store.
#[derive(Debug, Clone)]
pub struct NewSecretRotation {
    pub workspace_id: String,
    pub environment: String,
    pub secret_path: String,
    pub provider: String,
    pub interval: i64,
    pub outputs: Vec<RotationOutput>,
    pub state: EncryptedState,
}

// ============================================================================
// Secret Rotation History
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationHistoryEntry {
    pub id: String,
    pub rotation_id: String,
    pub status: String,
    pub detail: Option<String>,
    pub created_at: String,
}
