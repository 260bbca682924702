//! Policy lifecycle: the operations the API layer calls.

use std::collections::HashSet;
use std::sync::Arc;

use super::crypto::StateCodec;
use super::rotation::RotationState;
use super::scheduler::JobScheduler;
use super::store::SecretStore;
use super::template::TemplateRegistry;
use crate::config::IntervalUnit;
use crate::db::models::{
    CreateRotationInput, NewSecretRotation, RotationHistoryEntry, RotationOutput, SecretRotation,
};
use crate::db::repos::rotation as rotation_repo;
use crate::db::DbPool;
use crate::error::AppError;
use crate::validation::{require_interval, require_non_empty, require_secret_path, require_valid_id};

pub struct RotationService {
    pool: DbPool,
    codec: Arc<StateCodec>,
    templates: Arc<TemplateRegistry>,
    secrets: Arc<dyn SecretStore>,
    scheduler: Arc<dyn JobScheduler>,
    interval_unit: IntervalUnit,
}

impl RotationService {
    pub fn new(
        pool: DbPool,
        codec: Arc<StateCodec>,
        templates: Arc<TemplateRegistry>,
        secrets: Arc<dyn SecretStore>,
        scheduler: Arc<dyn JobScheduler>,
        interval_unit: IntervalUnit,
    ) -> Self {
        Self {
            pool,
            codec,
            templates,
            secrets,
            scheduler,
            interval_unit,
        }
    }

    /// Validate, persist and schedule a new policy. The first run is immediate.
    pub async fn create(&self, input: CreateRotationInput) -> Result<SecretRotation, AppError> {
        require_valid_id("workspaceId", &input.workspace_id)?;
        require_non_empty("environment", &input.environment)?;
        require_secret_path("secretPath", &input.secret_path)?;
        require_non_empty("provider", &input.provider)?;
        require_interval("interval", input.interval)?;

        let template = self
            .templates
            .get(&input.provider)
            .map_err(|_| AppError::Validation(format!("Provider '{}' not found", input.provider)))?;
        let inputs = template.prepare_inputs(&input.inputs)?;
        self.check_outputs(&input, |key| template.declares_output(key)).await?;

        let state = self.codec.seal_json(&RotationState::new(inputs))?;
        let policy = rotation_repo::create(
            &self.pool,
            NewSecretRotation {
                workspace_id: input.workspace_id,
                environment: input.environment,
                secret_path: input.secret_path,
                provider: input.provider,
                interval: input.interval,
                outputs: input.outputs,
                state,
            },
        )?;

        if let Err(e) = self.schedule(&policy, true) {
            // An unschedulable policy is not kept
            rotation_repo::delete(&self.pool, &policy.id)?;
            return Err(e);
        }
        tracing::info!(
            rotation_id = %policy.id,
            provider = %policy.provider,
            workspace_id = %policy.workspace_id,
            outputs = policy.outputs.len(),
            "Created secret rotation"
        );
        Ok(policy)
    }

    async fn check_outputs(
        &self,
        input: &CreateRotationInput,
        declared: impl Fn(&str) -> bool,
    ) -> Result<(), AppError> {
        if input.outputs.is_empty() {
            return Err(AppError::Validation("At least one output mapping is required".into()));
        }

        let mut keys = HashSet::new();
        let mut secret_ids = Vec::with_capacity(input.outputs.len());
        for RotationOutput { key, secret_id } in &input.outputs {
            if !declared(key) {
                return Err(AppError::Validation(format!(
                    "Provider '{}' has no output '{key}'",
                    input.provider
                )));
            }
            if !keys.insert(key.as_str()) {
                return Err(AppError::Validation(format!("Output '{key}' is mapped twice")));
            }
            require_valid_id("secretId", secret_id)?;
            if secret_ids.contains(secret_id) {
                return Err(AppError::Validation(format!(
                    "Secret '{secret_id}' is mapped to more than one output"
                )));
            }
            secret_ids.push(secret_id.clone());
        }

        let found = self
            .secrets
            .find_by_ids(&input.workspace_id, &input.environment, &secret_ids)
            .await?;
        if found.len() != secret_ids.len() {
            return Err(AppError::Validation(
                "Secrets not found in the given workspace and environment".into(),
            ));
        }
        Ok(())
    }

    /// Cancel and re-register the job, running immediately.
    pub fn restart(&self, rotation_id: &str) -> Result<SecretRotation, AppError> {
        let policy = rotation_repo::get_by_id(&self.pool, rotation_id)?;
        self.scheduler.cancel(&policy.id)?;
        self.schedule(&policy, true)?;
        tracing::info!(rotation_id = %policy.id, "Restarted secret rotation");
        Ok(policy)
    }

    /// Delete the policy and cancel its job. Returns the removed policy.
    pub fn delete(&self, rotation_id: &str) -> Result<SecretRotation, AppError> {
        let policy = rotation_repo::get_by_id(&self.pool, rotation_id)?;
        rotation_repo::delete(&self.pool, &policy.id)?;
        self.scheduler.cancel(&policy.id)?;
        tracing::info!(rotation_id = %policy.id, "Deleted secret rotation");
        Ok(policy)
    }

    pub fn get(&self, rotation_id: &str) -> Result<SecretRotation, AppError> {
        rotation_repo::get_by_id(&self.pool, rotation_id)
    }

    pub fn list(&self, workspace_id: &str) -> Result<Vec<SecretRotation>, AppError> {
        require_valid_id("workspaceId", workspace_id)?;
        rotation_repo::get_by_workspace(&self.pool, workspace_id)
    }

    /// Change the interval and re-register the job on the new cadence.
    pub fn update_interval(&self, rotation_id: &str, interval: i64) -> Result<SecretRotation, AppError> {
        require_interval("interval", interval)?;
        let policy = rotation_repo::update_interval(&self.pool, rotation_id, interval)?;
        self.schedule(&policy, false)?;
        Ok(policy)
    }

    pub fn history(
        &self,
        rotation_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<RotationHistoryEntry>, AppError> {
        let policy = rotation_repo::get_by_id(&self.pool, rotation_id)?;
        rotation_repo::get_history(&self.pool, &policy.id, limit)
    }

    /// Re-register every stored policy. Policies that never ran or are overdue
    /// run immediately. Returns how many were scheduled.
    pub fn restore_schedules(&self) -> Result<usize, AppError> {
        let now = chrono::Utc::now();
        let mut restored = 0;
        for policy in rotation_repo::get_all(&self.pool)? {
            let run_now = self.is_due(&policy, now);
            match self.schedule(&policy, run_now) {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::error!(rotation_id = %policy.id, error = %e, "Failed to restore rotation schedule");
                }
            }
        }
        tracing::info!(count = restored, "Restored rotation schedules");
        Ok(restored)
    }

    fn is_due(&self, policy: &SecretRotation, now: chrono::DateTime<chrono::Utc>) -> bool {
        let Some(last) = policy.last_rotated_at.as_deref() else {
            return true;
        };
        let Ok(last) = chrono::DateTime::parse_from_rfc3339(last) else {
            return true;
        };
        let every = chrono::Duration::seconds(self.interval_unit.every(policy.interval).as_secs() as i64);
        last.with_timezone(&chrono::Utc) + every <= now
    }

    fn schedule(&self, policy: &SecretRotation, run_now: bool) -> Result<(), AppError> {
        self.scheduler
            .schedule(&policy.id, run_now, self.interval_unit.every(policy.interval))
    }
}
