//! Authentication tokens for the barrage login handshake.
//!
//! A [`Token`] is issued by the open API for an application id/secret pair
//! and stays usable for two hours. Rooms keep the token they were issued and
//! carry it across reconnects; [`TokenProvider`] is only consulted when the
//! carried token is missing or stale.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::Deserialize;

/// Token lifetime: a token older than this is refreshed before login.
pub const TOKEN_TTL_SECS: i64 = 2 * 60 * 60;

const TOKEN_PATH: &str = "/api/thirdPart/token";

/// Source of the current unix time, in seconds.
pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch.
    fn unix_now(&self) -> i64;
}

/// Wall-clock [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

/// An issued authentication token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Opaque token value sent in login and join-group requests.
    pub value: String,
    /// Unix time the token was issued at.
    pub issued_at: i64,
    /// Lifetime advertised by the issuer, in seconds.
    pub expire: i64,
}

impl Token {
    /// Whether the token can still be used at `now`.
    pub fn is_fresh(&self, now: i64) -> bool {
        now - self.issued_at < TOKEN_TTL_SECS
    }
}

/// Errors produced while obtaining a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The HTTP request failed or the body was not valid JSON.
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The endpoint answered with a non-success status.
    #[error("token endpoint returned HTTP {0}")]
    Status(u16),
    /// The endpoint answered with an application error code.
    #[error("token request rejected (code {code}): {msg}")]
    Rejected {
        /// Application error code.
        code: i64,
        /// Message from the endpoint.
        msg: String,
    },
    /// The response carried no token.
    #[error("token response has no token")]
    MissingToken,
}

/// Issues tokens for an application id/secret pair.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Request a fresh token at unix time `now`.
    async fn issue(&self, aid: &str, secret: &str, now: i64) -> Result<Token, TokenError>;
}

/// [`TokenProvider`] backed by the open API's HTTP token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenProvider {
    /// Build a provider with its own HTTP client.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Build a provider sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    #[serde(default)]
    token: String,
    #[serde(default)]
    expire: i64,
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    #[tracing::instrument(skip_all, fields(aid = %aid))]
    async fn issue(&self, aid: &str, secret: &str, now: i64) -> Result<Token, TokenError> {
        let auth = request_signature(aid, secret, now);
        let url = format!("{}{TOKEN_PATH}", self.base_url);
        let time = now.to_string();

        let resp = self
            .client
            .get(url)
            .query(&[("aid", aid), ("time", time.as_str()), ("auth", auth.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TokenError::Status(status.as_u16()));
        }

        let body: ApiResponse = resp.json().await?;
        if body.code != 0 {
            return Err(TokenError::Rejected {
                code: body.code,
                msg: body.msg,
            });
        }

        let data = body.data.ok_or(TokenError::MissingToken)?;
        if data.token.is_empty() {
            return Err(TokenError::MissingToken);
        }

        tracing::debug!(expire = data.expire, "Issued token");
        Ok(Token {
            value: data.token,
            issued_at: now,
            expire: data.expire,
        })
    }
}

/// Signature of a token request: md5 of the path and query, followed by the secret.
pub fn request_signature(aid: &str, secret: &str, now: i64) -> String {
    md5_hex(&format!("{TOKEN_PATH}?aid={aid}&time={now}{secret}"))
}

/// Lowercase hex md5 digest.
pub(crate) fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}
