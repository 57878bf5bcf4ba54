use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// JSON-RPC 2.0 over HTTP POST.
///
/// Bundler and paymaster endpoints on Alchemy are the same URL as the chain RPC,
/// so both clients share this transport.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, id, "json-rpc request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            // the URL embeds the API key; keep it out of error chains
            .with_context(|| format!("POST {method} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(http_error(method, status, &text));
        }

        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("{method}: failed to decode JSON"))?;
        extract_result(body)
    }
}

/// Error for a non-2xx reply. Gateways answer with HTML as often as JSON, so
/// the body is kept as text and clipped.
pub(crate) fn http_error(what: &str, status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    const MAX_BODY: usize = 512;
    let body = body.trim();
    let clipped = match body.char_indices().nth(MAX_BODY) {
        Some((cut, _)) => &body[..cut],
        None => body,
    };
    anyhow!("{what}: HTTP {status}: {clipped}")
}

fn extract_result(mut body: Value) -> Result<Value> {
    if let Some(err) = body.get("error") {
        return Err(anyhow!("RPC error: {}", err));
    }

    body.get_mut("result")
        .map(Value::take)
        .ok_or_else(|| anyhow!("missing result field"))
}
