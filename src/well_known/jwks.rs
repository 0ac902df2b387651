//! Based on JWK (RFC 7517 <https://datatracker.ietf.org/doc/html/rfc7517>).
//!
//! Path: /.well-known/jwks.json

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::crypto::{Jwk, KeyPair};
use crate::token::ALGORITHM_NAME;

const KEY_USE: &str = "sig";

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub keys: Vec<Jwk>,
}

/// JWKS holding the public half of `key`, annotated for RS256 signatures.
pub fn document(key: &KeyPair) -> Response {
    Response {
        keys: vec![key.public_jwk().with_usage(ALGORITHM_NAME, KEY_USE)],
    }
}

pub async fn handler(State(key): State<Arc<KeyPair>>) -> Json<Response> {
    Json(document(&key))
}
