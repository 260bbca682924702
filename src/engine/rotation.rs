//! Rotation executor.
//!
//! One run walks a policy through load, pre-set, set, test, retire, persist
//! and effects. Persisted state only changes when every step up to persist
//! succeeds; a failure records `failed` with the error message and leaves the
//! credential generations untouched for the next tick.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::crypto::{encrypt_with_key, KeyEncoding, StateCodec, ALGORITHM};
use super::effects::{RotationEffects, RotationRecorded, SecretsChanged};
use super::interpolate::RunContext;
use super::provider::{apply_pre, FunctionExecutor};
use super::scheduler::{JobHandler, JobOutcome};
use super::store::{SecretStore, WorkspaceKeyProvider};
use super::template::{ProviderFunction, RotationTemplate, TemplateRegistry};
use crate::background_job::JobStore;
use crate::db::models::{EncryptedState, SecretRecord, SecretRotation, SecretValueUpdate};
use crate::db::repos::rotation as rotation_repo;
use crate::db::DbPool;
use crate::error::AppError;

/// Generations kept per policy: the live one and the one it superseded.
pub const MAX_GENERATIONS: usize = 2;
pub const SUCCESS_MESSAGE: &str = "Rotated successfully";
const STATUS_MESSAGE_LIMIT: usize = 500;

pub const HISTORY_SUCCESS: &str = "success";
pub const HISTORY_FAILED: &str = "failed";
pub const HISTORY_SKIPPED: &str = "skipped";

// ── Persisted working state ────────────────────────────────────────

/// What a rotation left behind for the target system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialGeneration {
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub internal: Map<String, Value>,
}

/// Decrypted policy state. `creds` is most-recent-first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub creds: Vec<CredentialGeneration>,
}

impl RotationState {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            creds: Vec::new(),
        }
    }
}

/// Read a policy's encrypted state with the scheme it was written with.
pub fn open_state(codec: &StateCodec, policy: &SecretRotation) -> Result<RotationState, AppError> {
    let sealed = EncryptedState {
        ciphertext: policy.encrypted_data.clone(),
        iv: policy.encrypted_data_iv.clone(),
        tag: policy.encrypted_data_tag.clone(),
        algorithm: policy.algorithm.clone(),
        key_encoding: policy.key_encoding.clone(),
    };
    Ok(codec.open_json(&sealed)?)
}

/// Username the next database generation rotates.
///
/// With one prior generation the other declared user is picked so the
/// previous credentials stay valid; with two, the oldest one is reused since
/// it is being retired.
pub fn next_database_username(inputs: &Map<String, Value>, creds: &[CredentialGeneration]) -> Option<Value> {
    let username1 = inputs.get("username1").cloned();
    let username2 = inputs.get("username2").cloned();
    let previous = |generation: &CredentialGeneration| generation.internal.get("username").cloned();

    match creds {
        [only] => {
            if previous(only) == username1 {
                username2
            } else {
                username1
            }
        }
        [.., oldest] => previous(oldest).or(username1),
        [] => username1,
    }
}

/// Secret text for an output value: strings raw, anything else as compact JSON.
pub fn output_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_message(message: &str) -> String {
    message.chars().take(STATUS_MESSAGE_LIMIT).collect()
}

// ── Run outcome ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Rotated { secrets: usize },
    /// `retry` is false when the policy can never succeed as configured.
    Failed { message: String, retry: bool },
    /// Another run of the same policy was in flight.
    Skipped,
    /// The policy no longer exists.
    Missing,
}

/// Why a run stopped short.
enum Failure {
    /// Transient or target-side; the next tick tries again.
    Retry(AppError),
    /// The policy is misconfigured; retrying cannot help.
    Disable(AppError),
}

impl From<AppError> for Failure {
    fn from(e: AppError) -> Self {
        Failure::Retry(e)
    }
}

/// Values carried from a finished run into persist and effects.
struct Rotated {
    state: RotationState,
    outputs: Vec<(String, String)>,
}

// ── Engine ─────────────────────────────────────────────────────────

pub struct RotationEngine {
    pool: DbPool,
    codec: Arc<StateCodec>,
    templates: Arc<TemplateRegistry>,
    secrets: Arc<dyn SecretStore>,
    keys: Arc<dyn WorkspaceKeyProvider>,
    effects: Arc<dyn RotationEffects>,
    executor: FunctionExecutor,
    runs: JobStore,
}

impl RotationEngine {
    pub fn new(
        pool: DbPool,
        codec: Arc<StateCodec>,
        templates: Arc<TemplateRegistry>,
        secrets: Arc<dyn SecretStore>,
        keys: Arc<dyn WorkspaceKeyProvider>,
        effects: Arc<dyn RotationEffects>,
        executor: FunctionExecutor,
    ) -> Self {
        Self {
            pool,
            codec,
            templates,
            secrets,
            keys,
            effects,
            executor,
            runs: JobStore::new("Rotation run guard lock poisoned"),
        }
    }

    pub fn is_running(&self, rotation_id: &str) -> bool {
        self.runs.is_running(rotation_id)
    }

    /// Execute one rotation of `rotation_id` and record the outcome.
    #[tracing::instrument(skip(self), fields(provider))]
    pub async fn run_once(&self, rotation_id: &str) -> RunOutcome {
        let mut guard = match self.runs.start(rotation_id) {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!("Rotation already in progress, skipping");
                self.record(rotation_id, HISTORY_SKIPPED, Some("A run for this policy is already in progress"));
                return RunOutcome::Skipped;
            }
        };

        let policy = match rotation_repo::get_by_id(&self.pool, rotation_id) {
            Ok(policy) => policy,
            Err(AppError::NotFound(_)) => {
                tracing::warn!("Rotation policy no longer exists");
                guard.fail("Rotation policy not found");
                return RunOutcome::Missing;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load rotation policy");
                guard.fail(e.to_string());
                return RunOutcome::Failed {
                    message: truncate_message(&e.to_string()),
                    retry: true,
                };
            }
        };
        tracing::Span::current().record("provider", policy.provider.as_str());
        tracing::info!("Rotation started");

        let (error, retry) = match self.rotate(&policy).await {
            Ok(done) => match self.persist(&policy, done).await {
                Ok(count) => {
                    self.record(rotation_id, HISTORY_SUCCESS, Some(SUCCESS_MESSAGE));
                    tracing::info!(secrets = count, "Rotation succeeded");
                    return RunOutcome::Rotated { secrets: count };
                }
                Err(e) => (e, true),
            },
            Err(Failure::Retry(e)) => (e, true),
            Err(Failure::Disable(e)) => (e, false),
        };

        let message = truncate_message(&error.to_string());
        tracing::warn!(error = %message, retry, "Rotation failed");
        if let Err(e) = rotation_repo::mark_failed(&self.pool, rotation_id, &message) {
            tracing::error!(error = %e, "Failed to persist rotation failure");
        }
        self.record(rotation_id, HISTORY_FAILED, Some(&message));
        guard.fail(message.clone());
        RunOutcome::Failed { message, retry }
    }

    /// Load through retire. Nothing here touches persisted state.
    async fn rotate(&self, policy: &SecretRotation) -> Result<Rotated, Failure> {
        let template = self.templates.get(&policy.provider).map_err(|_| {
            Failure::Disable(AppError::NotFound(format!(
                "Provider '{}' not found",
                policy.provider
            )))
        })?;
        if policy.outputs.is_empty() {
            return Err(Failure::Disable(AppError::Validation(
                "No outputs configured for rotation".into(),
            )));
        }
        let mut secret_ids: Vec<String> = policy.outputs.iter().map(|o| o.secret_id.clone()).collect();
        secret_ids.sort();
        secret_ids.dedup();
        let found = self
            .secrets
            .find_by_ids(&policy.workspace_id, &policy.environment, &secret_ids)
            .await?;
        if found.len() != secret_ids.len() {
            return Err(Failure::Disable(AppError::NotFound(
                "Secrets not found for rotation outputs".into(),
            )));
        }

        let mut state = open_state(&self.codec, policy).map_err(|e| {
            Failure::Disable(AppError::Internal(format!("Rotation state unreadable: {e}")))
        })?;
        if state.inputs.is_empty() {
            return Err(Failure::Disable(AppError::Validation("No inputs found".into())));
        }

        let ctx = self.run_functions(&template, &mut state).await?;

        let mut outputs = Vec::with_capacity(policy.outputs.len());
        for output in &policy.outputs {
            let value = ctx.outputs.get(&output.key).ok_or_else(|| {
                AppError::Execution(format!(
                    "Output '{}' was not produced by provider '{}'",
                    output.key, policy.provider
                ))
            })?;
            outputs.push((output.secret_id.clone(), output_text(value)));
        }
        Ok(Rotated { state, outputs })
    }

    /// Pre-set, set, test and retire against the target system. On success
    /// `state.creds` holds the new generation first.
    async fn run_functions(
        &self,
        template: &RotationTemplate,
        state: &mut RotationState,
    ) -> Result<RunContext, AppError> {
        let functions = &template.functions;
        let mut ctx = RunContext::new(state.inputs.clone());

        if matches!(functions.set, ProviderFunction::Database(_)) {
            if let Some(username) = next_database_username(&state.inputs, &state.creds) {
                ctx.internal.insert("username".into(), username);
            }
        }

        apply_pre(&functions.set, &mut ctx)?;
        self.executor.set(&functions.set, &mut ctx).await?;
        self.executor.test(&functions.test, &ctx).await?;

        if state.creds.len() >= MAX_GENERATIONS {
            if let Some(retired) = state.creds.pop() {
                if matches!(functions.set, ProviderFunction::Http(_)) {
                    let retired_ctx = RunContext {
                        inputs: state.inputs.clone(),
                        outputs: retired.outputs,
                        internal: retired.internal,
                    };
                    self.executor
                        .remove(functions.remove.as_ref(), &retired_ctx)
                        .await?;
                    tracing::debug!("Retired previous credential generation");
                }
            }
        }

        state.creds.insert(
            0,
            CredentialGeneration {
                outputs: ctx.outputs.clone(),
                internal: ctx.internal.clone(),
            },
        );
        state.creds.truncate(MAX_GENERATIONS);
        Ok(ctx)
    }

    /// Write outputs into their secrets together with the new state, then
    /// raise effects.
    async fn persist(&self, policy: &SecretRotation, done: Rotated) -> Result<usize, AppError> {
        let key = self.keys.workspace_key(&policy.workspace_id).await?;
        let mut updates = Vec::with_capacity(done.outputs.len());
        for (secret_id, text) in &done.outputs {
            let sealed = encrypt_with_key(text.as_bytes(), &key)?;
            updates.push(SecretValueUpdate {
                secret_id: secret_id.clone(),
                ciphertext: sealed.ciphertext,
                iv: sealed.iv,
                tag: sealed.tag,
                algorithm: ALGORITHM.to_string(),
                key_encoding: KeyEncoding::Base64.as_str().to_string(),
            });
        }

        let sealed = self.codec.seal_json(&done.state)?;
        let updated = self
            .secrets
            .commit_rotation(policy, &updates, &sealed, SUCCESS_MESSAGE)
            .await?;

        self.raise_effects(policy, &updated).await;
        Ok(updated.len())
    }

    async fn raise_effects(&self, policy: &SecretRotation, updated: &[SecretRecord]) {
        if let Err(e) = self
            .effects
            .snapshot_requested(&policy.workspace_id, &policy.environment, &policy.secret_path)
            .await
        {
            tracing::warn!(error = %e, "Snapshot request failed");
        }

        let changed = SecretsChanged {
            event: "secrets.changed",
            rotation_id: policy.id.clone(),
            workspace_id: policy.workspace_id.clone(),
            environment: policy.environment.clone(),
            secret_path: policy.secret_path.clone(),
            secret_ids: updated.iter().map(|s| s.id.clone()).collect(),
        };
        if let Err(e) = self.effects.secrets_changed(&changed).await {
            tracing::warn!(error = %e, "Secrets-changed notification failed");
        }

        let recorded = RotationRecorded {
            workspace_id: policy.workspace_id.clone(),
            environment: policy.environment.clone(),
            secret_path: policy.secret_path.clone(),
            provider: policy.provider.clone(),
            number_of_secrets: updated.len(),
        };
        if let Err(e) = self.effects.rotation_recorded(&recorded).await {
            tracing::warn!(error = %e, "Rotation telemetry failed");
        }
    }

    fn record(&self, rotation_id: &str, status: &str, detail: Option<&str>) {
        if let Err(e) = rotation_repo::record_run(&self.pool, rotation_id, status, detail) {
            tracing::warn!(rotation_id = %rotation_id, error = %e, "Failed to record rotation history");
        }
    }
}

#[async_trait]
impl JobHandler for RotationEngine {
    async fn run_job(&self, job_id: &str) -> JobOutcome {
        match self.run_once(job_id).await {
            RunOutcome::Missing | RunOutcome::Failed { retry: false, .. } => JobOutcome::Stop,
            _ => JobOutcome::Continue,
        }
    }
}
