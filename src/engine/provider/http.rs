use reqwest::Method;
use serde_json::Value;

use crate::engine::interpolate::{interpolate, render_str, RunContext};
use crate::engine::template::HttpFunction;
use crate::error::AppError;

/// Longest slice of an error response body kept in the failure message.
const ERROR_BODY_PREVIEW: usize = 200;

/// Interpolate and send one HTTP function. Any non-2xx status fails the call.
///
/// The response body is returned as JSON when it parses, otherwise as a string.
pub(crate) async fn call(
    client: &reqwest::Client,
    func: &HttpFunction,
    ctx: &RunContext,
) -> Result<Value, AppError> {
    let method_raw = render_str(&func.method, ctx)?.to_uppercase();
    let method = Method::from_bytes(method_raw.as_bytes())
        .map_err(|_| AppError::Template(format!("Invalid HTTP method '{method_raw}'")))?;

    let url = render_str(&func.url, ctx)?;
    let parsed = url::Url::parse(&url)
        .map_err(|e| AppError::Template(format!("Invalid URL in HTTP function: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Template(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    // Path only: query strings and userinfo may carry credentials
    let label = format!("{method} {}{}", parsed.host_str().unwrap_or_default(), parsed.path());

    let mut request = client.request(method, parsed);

    for (name, value) in &func.headers {
        request = request.header(name.as_str(), as_text(interpolate(value, ctx)?));
    }

    if !func.query.is_empty() {
        let mut pairs = Vec::with_capacity(func.query.len());
        for (name, value) in &func.query {
            pairs.push((name.clone(), as_text(interpolate(value, ctx)?)));
        }
        request = request.query(&pairs);
    }

    if let Some(body) = &func.body {
        match interpolate(body, ctx)? {
            Value::Null => {}
            Value::String(s) => request = request.body(s),
            other => request = request.json(&other),
        }
    }

    tracing::debug!(request = %label, "Calling HTTP function");

    let resp = request.send().await?;
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        // Body goes to debug logs only
        let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
        tracing::debug!(request = %label, status = status.as_u16(), body = %preview, "HTTP function failed");
        return Err(AppError::Transport(format!(
            "{label} returned HTTP {}",
            status.as_u16()
        )));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

fn as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
