//! Error handler for jwks-bearer.

use std::path::PathBuf;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Command generating a key accepted by [`crate::crypto::KeyPair::load`].
pub fn keygen_hint(path: &std::path::Path) -> String {
    format!(
        "openssl genpkey -algorithm RSA -pkeyopt rsa_keygen_bits:2048 -out {}",
        path.display()
    )
}

/// Every failure the client and the key publisher can report.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    Configuration { message: String },

    #[error(
        "private pem key not found in {}, please generate one with `{}`",
        path.display(),
        keygen_hint(path)
    )]
    KeyNotFound { path: PathBuf },

    #[error("cannot read private key {}: {source}", path.display())]
    KeyParse {
        path: PathBuf,
        source: crate::crypto::KeyError,
    },

    #[error("cannot sign client assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("token endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint sent an unexpected body: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::Configuration`] asking for a missing flag.
    pub fn missing(flag: &str, what: &str) -> Self {
        Self::Configuration {
            message: format!("{what} not specified: use {flag}=<value>"),
        }
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Point to the request which failed.
    pub fn instance(mut self, path: &str) -> Self {
        self.instance = Some(path.into());
        self
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match serde_json::to_string(&self) {
            Ok(body) => (
                status,
                [(header::CONTENT_TYPE, "application/problem+json")],
                body,
            )
                .into_response(),
            Err(_) => internal_server_error(),
        }
    }
}

fn internal_server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "type": null,
            "title": "Internal server error.",
            "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            "detail": null,
            "instance": null,
        })
        .to_string(),
    )
        .into_response()
}
