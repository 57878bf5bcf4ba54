use crate::rpc::http_error;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Session-based signing as exposed by a custody service. Key material never
/// leaves the service; callers only ever see signatures.
#[async_trait]
pub trait CustodyService: Send + Sync {
    async fn is_session_active(&self) -> Result<bool>;

    /// Wallets attached to the session, in the order the service listed them.
    fn wallets(&self) -> &[WalletRecord];

    /// Sign a base64-encoded 32-byte digest with the wallet's key.
    async fn sign_message(&self, wallet_id: &str, message_base64: &str)
        -> Result<SignMessageResponse>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Environment {
    #[default]
    Beta,
    Sandbox,
    Prod,
}

impl Environment {
    pub fn base_url(self) -> &'static str {
        match self {
            Environment::Beta => "https://api.beta.getpara.com",
            Environment::Sandbox => "https://api.sandbox.getpara.com",
            Environment::Prod => "https://api.getpara.com",
        }
    }
}

/// A wallet as recorded in the session. `id` is kept untyped: a record whose id
/// is not a string cannot be used for signing.
#[derive(Debug, Clone, Deserialize)]
pub struct WalletRecord {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl WalletRecord {
    pub fn id_str(&self) -> Option<&str> {
        self.id.as_str()
    }
}

/// Result of a sign request. The service either signs immediately or defers
/// to a user review flow, in which case `signature` is absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignMessageResponse {
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub pending_transaction_id: Option<String>,
    #[serde(default)]
    pub transaction_review_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedSession {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    wallets: serde_json::Map<String, Value>,
    #[serde(default)]
    session_cookie: Option<String>,
}

/// Decoded session token: who is logged in and which wallets they hold.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Option<String>,
    pub wallets: Vec<WalletRecord>,
    cookie: Option<String>,
}

impl Session {
    /// Decode an exported session (base64 of the session JSON).
    pub fn decode(token: &str) -> Result<Self> {
        let raw = B64
            .decode(token.trim())
            .context("session token is not valid base64")?;
        let exported: ExportedSession =
            serde_json::from_slice(&raw).context("session token is not valid session JSON")?;

        let wallets = exported
            .wallets
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value::<WalletRecord>(value)
                    .with_context(|| format!("invalid wallet entry {key} in session"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            user_id: exported.user_id,
            wallets,
            cookie: exported.session_cookie,
        })
    }
}

pub struct ParaClient {
    base_url: Url,
    api_key: String,
    http: reqwest::Client,
    session: Session,
}

impl fmt::Debug for ParaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParaClient")
            .field("base_url", &self.base_url.as_str())
            .field("user_id", &self.session.user_id)
            .field("wallets", &self.session.wallets.len())
            .finish_non_exhaustive()
    }
}

impl ParaClient {
    /// Restore a previously exported session against `environment`.
    pub fn import_session(environment: Environment, api_key: &str, token: &str) -> Result<Self> {
        let session = Session::decode(token)?;
        let base_url = Url::parse(environment.base_url()).context("invalid Para base URL")?;

        tracing::info!(
            environment = ?environment,
            user_id = session.user_id.as_deref().unwrap_or("<unknown>"),
            wallets = session.wallets.len(),
            "imported Para session"
        );

        Ok(Self {
            base_url,
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
            session,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        join_segments(&self.base_url, segments)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self
            .http
            .request(method, url)
            .header("x-external-api-key", &self.api_key);
        match self.session.cookie.as_deref() {
            Some(cookie) => req.header(reqwest::header::COOKIE, cookie),
            None => req,
        }
    }
}

#[async_trait]
impl CustodyService for ParaClient {
    async fn is_session_active(&self) -> Result<bool> {
        let url = self.endpoint(&["touch"])?;
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .context("Para session check failed")?;

        let status = resp.status();
        let state = session_state(status);
        if state.is_err() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body.trim(), "unexpected Para session check reply");
        }
        state
    }

    fn wallets(&self) -> &[WalletRecord] {
        &self.session.wallets
    }

    async fn sign_message(
        &self,
        wallet_id: &str,
        message_base64: &str,
    ) -> Result<SignMessageResponse> {
        let url = self.endpoint(&["wallets", wallet_id, "sign-message"])?;
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&serde_json::json!({ "messageBase64": message_base64 }))
            .send()
            .await
            .context("Para sign-message request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(http_error("Para sign-message", status, &text));
        }

        resp.json::<SignMessageResponse>()
            .await
            .context("unexpected Para sign-message response shape")
    }
}

/// `/touch` reply: 2xx is a live session, 401/403 an expired one. Anything
/// else says nothing about the session and is an error.
fn session_state(status: StatusCode) -> Result<bool> {
    match status {
        s if s.is_success() => Ok(true),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
        s => Err(anyhow!("Para session check returned HTTP {s}")),
    }
}

fn join_segments(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("base URL {} cannot take a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
