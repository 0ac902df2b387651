//! OAuth 2.0 client credentials grant authenticated with a private key JWT
//! (RFC 7521 / RFC 7523).

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::{self, DeserializeOwned};
use serde_json::{Map, Value};
use url::Url;

use crate::crypto::KeyPair;
use crate::error::{Error, Result};
use crate::token::{AssertionBuilder, ClientAssertion, decode_payload};

pub const GRANT_TYPE: &str = "client_credentials";
pub const CLIENT_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Token endpoint of `realm` on the OpenID Connect server at `auth_host`.
pub fn token_endpoint(auth_host: &Url, realm: &str) -> Result<Url> {
    let mut url = auth_host.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Configuration {
            message: format!("`{auth_host}` cannot be used as auth host"),
        })?
        .pop_if_empty()
        .extend([
            "auth",
            "realms",
            realm,
            "protocol",
            "openid-connect",
            "token",
        ]);

    Ok(url)
}

/// Successful token endpoint response (RFC 6749 section 5.1).
///
/// Only `access_token` is required. A known field holding an unexpected
/// type is kept as sent in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(rename = "not-before-policy", skip_serializing_if = "Option::is_none")]
    pub not_before_policy: Option<i64>,
    /// Unverified payload of `access_token`, for inspection only.
    /// Absent when the access token is opaque.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_decoded: Option<Value>,
    /// Fields not covered above, kept as sent.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenResponse {
    /// Parse a 200 body. Fails only when it is not a JSON object or lacks a
    /// string `access_token`.
    pub fn from_body(body: &str) -> Result<Self> {
        let mut fields: Map<String, Value> = serde_json::from_str(body)?;
        let access_token = take(&mut fields, "access_token")
            .ok_or_else(|| de::Error::missing_field("access_token"))
            .map_err(Error::InvalidResponse)?;

        Ok(Self {
            access_token,
            token_type: take(&mut fields, "token_type"),
            expires_in: take(&mut fields, "expires_in"),
            refresh_expires_in: take(&mut fields, "refresh_expires_in"),
            refresh_token: take(&mut fields, "refresh_token"),
            scope: take(&mut fields, "scope"),
            not_before_policy: take(&mut fields, "not-before-policy"),
            access_token_decoded: None,
            extra: fields,
        })
    }
}

/// Remove `name` from `fields` when it has the expected type.
fn take<T: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    name: &str,
) -> Option<T> {
    let value = fields.get(name)?;
    match T::deserialize(value) {
        Ok(parsed) => {
            fields.remove(name);
            Some(parsed)
        },
        Err(err) => {
            tracing::debug!(field = name, %err, "unexpected type, kept as sent");
            None
        },
    }
}

/// Outcome of a token request which reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenResult {
    Granted(TokenResponse),
    /// Any non-200 answer. `body` holds the server JSON error, or the raw
    /// text as a JSON string when it is not JSON.
    Rejected { status: StatusCode, body: Value },
}

impl TokenResult {
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Granted(response) => Some(&response.access_token),
            Self::Rejected { .. } => None,
        }
    }
}

/// HTTP client for the token endpoint.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
}

impl TokenClient {
    /// Create a new [`TokenClient`] whose requests fail after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { http })
    }

    /// Form body of the token request.
    pub fn form<'a>(
        client_id: &'a str,
        assertion: &'a ClientAssertion,
    ) -> [(&'static str, &'a str); 4] {
        [
            ("grant_type", GRANT_TYPE),
            ("client_id", client_id),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
        ]
    }

    /// Sign one assertion and exchange it for an access token.
    pub async fn exchange(
        &self,
        key: &KeyPair,
        endpoint: &Url,
        client_id: &str,
        self_hosted: bool,
    ) -> Result<TokenResult> {
        let assertion =
            AssertionBuilder::new(key).build(client_id, endpoint, self_hosted)?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let mut form: Map<String, Value> = Self::form(client_id, &assertion)
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value.into()))
                .collect();
            form.insert(
                "client_assertion_content".into(),
                decode_payload(assertion.as_str()).unwrap_or_default(),
            );
            let form = Value::Object(form);
            tracing::debug!(%form, "sending token request");
        }

        self.request_token(endpoint, client_id, &assertion).await
    }

    /// POST the assertion to `endpoint`.
    ///
    /// Sends exactly one request and never retries, so a `jti` reaches the
    /// server at most once.
    pub async fn request_token(
        &self,
        endpoint: &Url,
        client_id: &str,
        assertion: &ClientAssertion,
    ) -> Result<TokenResult> {
        let response = self
            .http
            .post(endpoint.clone())
            .form(&Self::form(client_id, assertion))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        tracing::info!(%status, %endpoint, "token endpoint answered");

        if status != StatusCode::OK {
            let body = serde_json::from_str(&body).unwrap_or(Value::String(body));
            tracing::warn!(%status, %body, "token request rejected");
            return Ok(TokenResult::Rejected { status, body });
        }

        let mut token = TokenResponse::from_body(&body)?;
        token.access_token_decoded = decode_payload(&token.access_token);
        if token.access_token_decoded.is_none() {
            tracing::debug!("access token is not a JWT, payload left undecoded");
        }

        Ok(TokenResult::Granted(token))
    }
}
