pub mod database;
pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::interpolate::{interpolate, RunContext};
use super::template::{Assignment, ProviderFunction};
use crate::error::AppError;

pub use database::{DbTarget, SqlClient, SqlxClient};

// =============================================================================
// FunctionExecutor
// =============================================================================

/// Runs template functions against their targets.
///
/// One instance is shared by every rotation run. HTTP calls go through a single
/// pooled client; database calls go through the `SqlClient` seam behind the
/// loopback guard.
#[derive(Clone)]
pub struct FunctionExecutor {
    http: reqwest::Client,
    sql: Arc<dyn SqlClient>,
}

impl FunctionExecutor {
    pub fn new(http_timeout: Duration, sql: Arc<dyn SqlClient>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("HTTP client error: {e}")))?;
        Ok(Self { http, sql })
    }

    async fn call(&self, func: &ProviderFunction, ctx: &RunContext) -> Result<Value, AppError> {
        match func {
            ProviderFunction::Http(f) => http::call(&self.http, f, ctx).await,
            ProviderFunction::Database(f) => database::call(self.sql.as_ref(), f, ctx).await,
        }
    }

    /// Call `func`, then write its setter results into the context.
    pub async fn set(&self, func: &ProviderFunction, ctx: &mut RunContext) -> Result<(), AppError> {
        let result = self.call(func, ctx).await?;
        apply_setter(func.setter(), &result, ctx)
    }

    /// Call `func` for its success only.
    pub async fn test(&self, func: &ProviderFunction, ctx: &RunContext) -> Result<(), AppError> {
        self.call(func, ctx).await.map(|_| ())
    }

    /// Deactivate a retired generation. A template without `remove` is a no-op.
    pub async fn remove(
        &self,
        func: Option<&ProviderFunction>,
        ctx: &RunContext,
    ) -> Result<(), AppError> {
        match func {
            Some(f) => self.call(f, ctx).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Apply `pre` assignments in key order. Later entries see earlier ones.
pub fn apply_pre(func: &ProviderFunction, ctx: &mut RunContext) -> Result<(), AppError> {
    for (target, template) in func.pre() {
        let value = interpolate(template, ctx)?;
        ctx.assign(target, value)?;
    }
    Ok(())
}

/// Resolve every setter entry against `result`, then assign them.
pub fn apply_setter(
    setter: &BTreeMap<String, Assignment>,
    result: &Value,
    ctx: &mut RunContext,
) -> Result<(), AppError> {
    let mut resolved = Vec::with_capacity(setter.len());
    for (target, assignment) in setter {
        let value = match assignment {
            Assignment::Direct { value } => interpolate(value, ctx)?,
            Assignment::Path { path } => extract_path(result, path).cloned().ok_or_else(|| {
                AppError::Execution(format!("Response has no value at '{path}' for '{target}'"))
            })?,
        };
        resolved.push((target, value));
    }
    for (target, value) in resolved {
        ctx.assign(target, value)?;
    }
    Ok(())
}

/// Dotted path lookup (`data.items.0.id`) through objects and arrays.
fn extract_path<'a>(result: &'a Value, path: &str) -> Option<&'a Value> {
    let pointer: String = path
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
        .collect();
    result.pointer(&pointer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and answers with a fixed row.
    struct CountingSql {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SqlClient for CountingSql {
        async fn query_first_row(
            &self,
            _target: &DbTarget,
            _query: &str,
            _params: &[Value],
        ) -> Result<Option<Map<String, Value>>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"now": "2026-01-01T00:00:00Z"}).as_object().cloned())
        }
    }

    fn db_function(host: &str) -> ProviderFunction {
        serde_json::from_value(json!({
            "type": "database",
            "client": "postgres",
            "connection": {
                "host": host,
                "port": 5432,
                "database": "app",
                "username": "admin",
                "password": "pw"
            },
            "query": "ALTER USER \"${internal.username}\" WITH PASSWORD '${internal.rotated_password}'",
            "pre": {"internal.rotated_password": "${random|32}"},
            "setter": {
                "outputs.db_username": {"assign": "direct", "value": "${internal.username}"},
                "outputs.db_password": {"assign": "direct", "value": "${internal.rotated_password}"}
            }
        }))
        .unwrap()
    }

    fn executor(sql: Arc<CountingSql>) -> FunctionExecutor {
        FunctionExecutor::new(Duration::from_secs(5), sql).unwrap()
    }

    #[test]
    fn test_extract_path() {
        let body = json!({"api_key": "SG.x", "data": {"items": [{"id": 7}]}});
        assert_eq!(extract_path(&body, "api_key"), Some(&json!("SG.x")));
        assert_eq!(extract_path(&body, "data.items.0.id"), Some(&json!(7)));
        assert_eq!(extract_path(&body, "data.missing"), None);
    }

    #[test]
    fn test_setter_path_missing_fails() {
        let mut setter = BTreeMap::new();
        setter.insert("outputs.api_key".to_string(), Assignment::Path { path: "api_key".into() });
        let mut ctx = RunContext::default();
        let err = apply_setter(&setter, &json!({"other": 1}), &mut ctx).unwrap_err();
        assert!(matches!(err, AppError::Execution(_)));
        assert!(ctx.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_database_set_applies_pre_and_setter() {
        let sql = Arc::new(CountingSql { calls: AtomicUsize::new(0) });
        let exec = executor(sql.clone());
        let func = db_function("203.0.113.10");

        let mut ctx = RunContext::default();
        ctx.internal.insert("username".into(), json!("svc_a"));
        apply_pre(&func, &mut ctx).unwrap();
        exec.set(&func, &mut ctx).await.unwrap();

        assert_eq!(sql.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.outputs["db_username"], json!("svc_a"));
        let password = ctx.outputs["db_password"].as_str().unwrap();
        assert_eq!(password.len(), 32);
        assert_eq!(ctx.internal["rotated_password"], json!(password));
    }

    #[tokio::test]
    async fn test_loopback_rejected_before_sql_call() {
        let sql = Arc::new(CountingSql { calls: AtomicUsize::new(0) });
        let exec = executor(sql.clone());

        let mut ctx = RunContext::default();
        ctx.internal.insert("username".into(), json!("svc_a"));
        ctx.internal.insert("rotated_password".into(), json!("pw"));
        for host in ["127.0.0.1", "localhost"] {
            let err = exec.set(&db_function(host), &mut ctx).await.unwrap_err();
            assert!(matches!(err, AppError::Transport(_)));
        }
        assert_eq!(sql.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_remove_is_noop() {
        let sql = Arc::new(CountingSql { calls: AtomicUsize::new(0) });
        let exec = executor(sql.clone());
        exec.remove(None, &RunContext::default()).await.unwrap();
        assert_eq!(sql.calls.load(Ordering::SeqCst), 0);
    }
}
