//! Side effects raised after a successful rotation.
//!
//! Every method is best-effort: the executor logs failures at `warn` and the
//! run outcome is unaffected.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-rotation-signature";

/// Which secrets a rotation just rewrote.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsChanged {
    pub event: &'static str,
    pub rotation_id: String,
    pub workspace_id: String,
    pub environment: String,
    pub secret_path: String,
    pub secret_ids: Vec<String>,
}

/// Counter event for a completed rotation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationRecorded {
    pub workspace_id: String,
    pub environment: String,
    pub secret_path: String,
    pub provider: String,
    pub number_of_secrets: usize,
}

#[async_trait]
pub trait RotationEffects: Send + Sync {
    async fn snapshot_requested(
        &self,
        workspace_id: &str,
        environment: &str,
        secret_path: &str,
    ) -> Result<(), AppError> {
        tracing::info!(
            workspace_id = %workspace_id,
            environment = %environment,
            secret_path = %secret_path,
            "Workspace snapshot requested"
        );
        Ok(())
    }

    async fn secrets_changed(&self, event: &SecretsChanged) -> Result<(), AppError> {
        tracing::info!(
            rotation_id = %event.rotation_id,
            workspace_id = %event.workspace_id,
            secrets = event.secret_ids.len(),
            "Secrets changed"
        );
        Ok(())
    }

    async fn rotation_recorded(&self, event: &RotationRecorded) -> Result<(), AppError> {
        tracing::info!(
            provider = %event.provider,
            workspace_id = %event.workspace_id,
            number_of_secrets = event.number_of_secrets,
            "Secret rotated"
        );
        Ok(())
    }
}

/// Emits every effect as a structured tracing event.
pub struct LogEffects;

#[async_trait]
impl RotationEffects for LogEffects {}

/// Delivers `secrets_changed` to an HTTP endpoint; other effects are logged.
pub struct WebhookEffects {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookEffects {
    pub fn new(url: String, secret: Option<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("HTTP client error: {e}")))?;
        Ok(Self { client, url, secret })
    }
}

#[async_trait]
impl RotationEffects for WebhookEffects {
    async fn secrets_changed(&self, event: &SecretsChanged) -> Result<(), AppError> {
        let body = serde_json::to_vec(event)?;
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body)?);
        }

        let resp = request.body(body).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Transport(format!(
                "Webhook returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        tracing::debug!(rotation_id = %event.rotation_id, "Delivered secrets-changed webhook");
        Ok(())
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("Invalid webhook secret: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> SecretsChanged {
        SecretsChanged {
            event: "secrets.changed",
            rotation_id: "rot-1".into(),
            workspace_id: "ws-1".into(),
            environment: "prod".into(),
            secret_path: "/".into(),
            secret_ids: vec!["sec-1".into()],
        }
    }

    #[test]
    fn test_sign_payload_matches_hmac() {
        let sig = sign_payload("test-secret", b"hello world").unwrap();
        let mut mac = HmacSha256::new_from_slice(b"test-secret").unwrap();
        mac.update(b"hello world");
        assert!(mac.verify_slice(&hex::decode(&sig).unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_webhook_posts_signed_event() {
        let server = MockServer::start().await;
        let body = serde_json::to_vec(&event()).unwrap();
        let expected_sig = sign_payload("s3cret", &body).unwrap();

        Mock::given(method("POST"))
            .and(path("/hooks/rotation"))
            .and(header(SIGNATURE_HEADER, expected_sig.as_str()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let effects = WebhookEffects::new(
            format!("{}/hooks/rotation", server.uri()),
            Some("s3cret".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        effects.secrets_changed(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_without_secret_is_unsigned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let effects = WebhookEffects::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        effects.secrets_changed(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let effects = WebhookEffects::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            effects.secrets_changed(&event()).await,
            Err(AppError::Transport(_))
        ));
    }
}
