pub mod crypto;
pub mod effects;
pub mod interpolate;
pub mod policy;
pub mod provider;
pub mod rotation;
pub mod scheduler;
pub mod store;
pub mod template;

pub use policy::RotationService;
pub use rotation::{RotationEngine, RunOutcome};
pub use scheduler::{JobScheduler, TokioScheduler};

/// Shared fixtures for engine tests: a file-backed pool, stub collaborators
/// and policy seeding helpers.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::Engine as _;
    use serde_json::{json, Map, Value};
    use zeroize::Zeroizing;

    use super::crypto::{KeyEncoding, StateCodec};
    use super::effects::{RotationEffects, RotationRecorded, SecretsChanged};
    use super::provider::{DbTarget, FunctionExecutor, SqlClient};
    use super::rotation::{RotationEngine, RotationState};
    use super::scheduler::JobScheduler;
    use super::store::{SqliteSecretStore, SqliteWorkspaceKeys};
    use super::template::{RotationTemplate, TemplateRegistry};
    use crate::db::models::{CreateSecretInput, NewSecretRotation, RotationOutput, SecretRecord, SecretRotation};
    use crate::db::repos::{rotation as rotation_repo, secrets as secret_repo, workspace_keys as key_repo};
    use crate::db::{init_test_db, DbPool};
    use crate::error::AppError;

    pub const WORKSPACE: &str = "ws-1";
    pub const ENVIRONMENT: &str = "prod";
    pub const LEGACY_KEY: &str = "00112233445566778899aabbccddeeff";

    pub fn codec() -> Arc<StateCodec> {
        let root = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        Arc::new(StateCodec::new(Some(&root), Some(LEGACY_KEY)).unwrap())
    }

    /// The built-in SendGrid template pointed at a local stub server.
    pub fn sendgrid_template(base_url: &str) -> RotationTemplate {
        let raw = include_str!("templates/sendgrid.json").replace("https://api.sendgrid.com", base_url);
        RotationTemplate::from_json(&raw).unwrap()
    }

    /// Built-in templates, with `overrides` replacing same-named ones.
    pub fn registry(overrides: Vec<RotationTemplate>) -> Arc<TemplateRegistry> {
        let builtin = TemplateRegistry::builtin();
        let mut templates: Vec<RotationTemplate> = builtin
            .names()
            .into_iter()
            .filter_map(|name| builtin.get(name).ok())
            .map(|t| (*t).clone())
            .collect();
        templates.extend(overrides);
        Arc::new(TemplateRegistry::from_templates(templates))
    }

    // ── SQL stub ───────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    pub struct SqlCall {
        pub host: String,
        pub username: String,
        pub password: String,
        pub query: String,
    }

    /// Records every query; fails those matching a configured fragment.
    #[derive(Default)]
    pub struct RecordingSql {
        calls: Mutex<Vec<SqlCall>>,
        fail_on: Mutex<Option<String>>,
    }

    impl RecordingSql {
        pub fn calls(&self) -> Vec<SqlCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn fail_queries_containing(&self, fragment: &str) {
            *self.fail_on.lock().unwrap() = Some(fragment.to_string());
        }
    }

    #[async_trait]
    impl SqlClient for RecordingSql {
        async fn query_first_row(
            &self,
            target: &DbTarget,
            query: &str,
            _params: &[Value],
        ) -> Result<Option<Map<String, Value>>, AppError> {
            self.calls.lock().unwrap().push(SqlCall {
                host: target.host.clone(),
                username: target.username.clone(),
                password: target.password.clone(),
                query: query.to_string(),
            });
            if let Some(fragment) = self.fail_on.lock().unwrap().as_deref() {
                if query.contains(fragment) {
                    return Err(AppError::Transport("database call failed: connection refused".into()));
                }
            }
            Ok(json!({"now": "2026-01-01T00:00:00Z"}).as_object().cloned())
        }
    }

    // ── Effects stub ───────────────────────────────────────────────

    #[derive(Default)]
    pub struct RecordingEffects {
        snapshots: AtomicUsize,
        changed: Mutex<Vec<SecretsChanged>>,
        recorded: Mutex<Vec<RotationRecorded>>,
        fail: bool,
    }

    impl RecordingEffects {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn snapshots(&self) -> usize {
            self.snapshots.load(Ordering::SeqCst)
        }

        pub fn changed(&self) -> Vec<SecretsChanged> {
            self.changed.lock().unwrap().clone()
        }

        pub fn recorded(&self) -> Vec<RotationRecorded> {
            self.recorded.lock().unwrap().clone()
        }

        fn outcome(&self) -> Result<(), AppError> {
            if self.fail {
                Err(AppError::Transport("effect sink unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RotationEffects for RecordingEffects {
        async fn snapshot_requested(&self, _: &str, _: &str, _: &str) -> Result<(), AppError> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            self.outcome()
        }

        async fn secrets_changed(&self, event: &SecretsChanged) -> Result<(), AppError> {
            self.changed.lock().unwrap().push(event.clone());
            self.outcome()
        }

        async fn rotation_recorded(&self, event: &RotationRecorded) -> Result<(), AppError> {
            self.recorded.lock().unwrap().push(event.clone());
            self.outcome()
        }
    }

    // ── Scheduler stub ─────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SchedulerCall {
        Schedule { job_id: String, run_now: bool, every: Duration },
        Cancel { job_id: String },
    }

    #[derive(Default)]
    pub struct RecordingScheduler {
        calls: Mutex<Vec<SchedulerCall>>,
    }

    impl RecordingScheduler {
        pub fn calls(&self) -> Vec<SchedulerCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl JobScheduler for RecordingScheduler {
        fn schedule(&self, job_id: &str, run_now: bool, every: Duration) -> Result<(), AppError> {
            self.calls.lock().unwrap().push(SchedulerCall::Schedule {
                job_id: job_id.to_string(),
                run_now,
                every,
            });
            Ok(())
        }

        fn cancel(&self, job_id: &str) -> Result<(), AppError> {
            self.calls.lock().unwrap().push(SchedulerCall::Cancel {
                job_id: job_id.to_string(),
            });
            Ok(())
        }
    }

    // ── Harness ────────────────────────────────────────────────────

    pub struct Harness {
        pub pool: DbPool,
        pub codec: Arc<StateCodec>,
        pub templates: Arc<TemplateRegistry>,
        pub sql: Arc<RecordingSql>,
        pub effects: Arc<RecordingEffects>,
        pub engine: Arc<RotationEngine>,
    }

    pub fn harness(templates: Vec<RotationTemplate>) -> Harness {
        build(templates, RecordingEffects::default())
    }

    pub fn harness_with_failing_effects(templates: Vec<RotationTemplate>) -> Harness {
        build(templates, RecordingEffects::failing())
    }

    fn build(templates: Vec<RotationTemplate>, effects: RecordingEffects) -> Harness {
        let pool = init_test_db().unwrap();
        let codec = codec();
        let templates = registry(templates);
        let sql = Arc::new(RecordingSql::default());
        let effects = Arc::new(effects);
        let executor = FunctionExecutor::new(Duration::from_secs(5), sql.clone()).unwrap();
        let engine = Arc::new(RotationEngine::new(
            pool.clone(),
            codec.clone(),
            templates.clone(),
            Arc::new(SqliteSecretStore::new(pool.clone())),
            Arc::new(SqliteWorkspaceKeys::new(pool.clone(), codec.clone())),
            effects.clone(),
            executor,
        ));
        Harness {
            pool,
            codec,
            templates,
            sql,
            effects,
            engine,
        }
    }

    impl Harness {
        pub fn seed_secret(&self, key_name: &str) -> SecretRecord {
            secret_repo::create(
                &self.pool,
                CreateSecretInput {
                    workspace_id: WORKSPACE.into(),
                    environment: ENVIRONMENT.into(),
                    secret_path: "/".into(),
                    key_name: key_name.into(),
                    ciphertext: "c2VlZA==".into(),
                    iv: "AAAAAAAAAAAAAAAA".into(),
                    tag: "AAAAAAAAAAAAAAAAAAAAAA==".into(),
                    algorithm: "aes-256-gcm".into(),
                    key_encoding: "base64".into(),
                },
            )
            .unwrap()
        }

        pub fn insert_policy(
            &self,
            provider: &str,
            inputs: Map<String, Value>,
            outputs: &[(&str, &str)],
        ) -> SecretRotation {
            let state = self.codec.seal_json(&RotationState::new(inputs)).unwrap();
            self.insert_with_state(provider, outputs, state)
        }

        /// Same as `insert_policy`, sealed with the legacy key.
        pub fn insert_legacy_policy(
            &self,
            provider: &str,
            inputs: Map<String, Value>,
            outputs: &[(&str, &str)],
        ) -> SecretRotation {
            let bytes = serde_json::to_vec(&RotationState::new(inputs)).unwrap();
            let state = self.codec.encrypt_with(KeyEncoding::Utf8, &bytes).unwrap();
            self.insert_with_state(provider, outputs, state)
        }

        fn insert_with_state(
            &self,
            provider: &str,
            outputs: &[(&str, &str)],
            state: crate::db::models::EncryptedState,
        ) -> SecretRotation {
            rotation_repo::create(
                &self.pool,
                NewSecretRotation {
                    workspace_id: WORKSPACE.into(),
                    environment: ENVIRONMENT.into(),
                    secret_path: "/".into(),
                    provider: provider.into(),
                    interval: 1,
                    outputs: outputs
                        .iter()
                        .map(|(key, secret_id)| RotationOutput {
                            key: key.to_string(),
                            secret_id: secret_id.to_string(),
                        })
                        .collect(),
                    state,
                },
            )
            .unwrap()
        }

        /// The workspace data key as stored, unwrapped with the test codec.
        pub fn workspace_key(&self, workspace_id: &str) -> Zeroizing<[u8; 32]> {
            let wrapped = key_repo::get(&self.pool, workspace_id).unwrap().unwrap();
            let bytes = self.codec.decrypt(&wrapped).unwrap();
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&bytes);
            key
        }
    }
}
