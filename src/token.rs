//! Client assertions, as defined on RFC 7523 section 2.2.
//!
//! An assertion is a short-lived JWT signed with the client private key.
//! It carries the client id as both issuer and subject and the token
//! endpoint as audience.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64ct::{Base64UrlUnpadded, Encoding};
use jsonwebtoken::{Algorithm, Header, encode};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::crypto::KeyPair;
use crate::error::Result;

/// Signing algorithm of every assertion.
pub const ALGORITHM: Algorithm = Algorithm::RS256;
/// `alg` value of [`ALGORITHM`] as written in JOSE headers and JWKs.
pub const ALGORITHM_NAME: &str = "RS256";
/// Lifetime of an assertion, in seconds.
pub const VALIDITY: u64 = 600;
const JTI_LENGTH: usize = 16; // 128 bits.

/// Source of the current time, in seconds since Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// System clock using the OS time.
///
/// Crashes if the clock is set before Unix epoch (unrecoverable state).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_secs()
    }
}

/// How the verifier finds the public key matching an assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionHeader {
    /// The public key is served on our own JWKS endpoint and looked up by `kid`.
    SelfHosted { kid: String },
    /// The verifier got the public key out of band, no `kid` is sent.
    ExternallyHosted,
}

impl AssertionHeader {
    pub fn new(key: &KeyPair, self_hosted: bool) -> Self {
        if self_hosted {
            Self::SelfHosted {
                kid: key.kid().to_owned(),
            }
        } else {
            Self::ExternallyHosted
        }
    }

    pub fn kid(&self) -> Option<&str> {
        match self {
            Self::SelfHosted { kid } => Some(kid),
            Self::ExternallyHosted => None,
        }
    }
}

impl From<&AssertionHeader> for Header {
    fn from(value: &AssertionHeader) -> Self {
        let mut header = Header::new(ALGORITHM);
        header.kid = value.kid().map(ToOwned::to_owned);
        header
    }
}

/// Pieces of information asserted by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Unique identifier, prevents the assertion from being replayed.
    pub jti: String,
    /// Client ID.
    pub iss: String,
    /// Client ID.
    pub sub: String,
    /// Token endpoint the assertion is intended for.
    pub aud: String,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
}

/// Signed JWT in compact serialization.
#[derive(Clone, Debug)]
pub struct ClientAssertion {
    pub header: AssertionHeader,
    pub claims: Claims,
    token: String,
}

impl ClientAssertion {
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for ClientAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// Build and sign client assertions with a loaded key.
pub struct AssertionBuilder<'k> {
    key: &'k KeyPair,
    clock: Box<dyn Clock>,
}

impl<'k> AssertionBuilder<'k> {
    /// Create a new [`AssertionBuilder`] using the system clock.
    pub fn new(key: &'k KeyPair) -> Self {
        Self {
            key,
            clock: Box::new(SystemClock),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Create a fresh signed assertion for `client_id`.
    ///
    /// `kid` is only written in the header when `self_hosted` is set.
    pub fn build(
        &self,
        client_id: &str,
        audience: &Url,
        self_hosted: bool,
    ) -> Result<ClientAssertion> {
        let iat = self.clock.now();
        let header = AssertionHeader::new(self.key, self_hosted);
        let claims = Claims {
            jti: generate_jti(),
            iss: client_id.to_owned(),
            sub: client_id.to_owned(),
            aud: audience.as_str().to_owned(),
            iat,
            exp: iat + VALIDITY,
        };

        let token = encode(&(&header).into(), &claims, self.key.signing_key())?;
        tracing::trace!(jti = %claims.jti, kid = ?header.kid(), "client assertion signed");

        Ok(ClientAssertion {
            header,
            claims,
            token,
        })
    }
}

fn generate_jti() -> String {
    let mut bytes = [0u8; JTI_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Decode the payload of a compact JWT **without** checking its signature.
///
/// Returns `None` when `token` is not made of three segments or when the
/// payload is not a base64url-encoded JSON object. Trailing padding is
/// tolerated.
pub fn decode_payload(token: &str) -> Option<Value> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    let payload = payload.trim_end_matches('=');
    // A single dangling sextet can never be valid base64.
    if payload.is_empty() || payload.len() % 4 == 1 {
        return None;
    }

    let bytes = Base64UrlUnpadded::decode_vec(payload).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.is_object().then_some(value)
}

#[cfg(test)]
pub(crate) struct FixedClock(pub u64);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};

    use super::*;
    use crate::crypto::test_key;
    use crate::error::Error;

    const CLIENT_ID: &str = "my-client";

    fn audience() -> Url {
        Url::parse(
            "https://auth.example.com/auth/realms/demo/protocol/openid-connect/token",
        )
        .unwrap()
    }

    fn raw_header(token: &str) -> Value {
        let segment = token.split('.').next().unwrap();
        serde_json::from_slice(&Base64UrlUnpadded::decode_vec(segment).unwrap())
            .unwrap()
    }

    #[test]
    fn test_signature_is_valid() {
        let key = test_key();
        let jwk = key.public_jwk();
        let assertion = AssertionBuilder::new(&key)
            .build(CLIENT_ID, &audience(), true)
            .unwrap();

        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[audience().as_str()]);
        validation.set_issuer(&[CLIENT_ID]);

        let data =
            decode::<Claims>(assertion.as_str(), &decoding_key, &validation)
                .unwrap();
        assert_eq!(data.claims, assertion.claims);
        assert_eq!(data.header.alg, Algorithm::RS256);
    }

    #[test]
    fn test_self_hosted_header_has_kid() {
        let key = test_key();
        let assertion = AssertionBuilder::new(&key)
            .build(CLIENT_ID, &audience(), true)
            .unwrap();

        let header = decode_header(assertion.as_str()).unwrap();
        assert_eq!(header.kid.as_deref(), Some(key.kid()));
        assert_eq!(
            assertion.header,
            AssertionHeader::SelfHosted {
                kid: key.kid().to_owned()
            }
        );
    }

    #[test]
    fn test_externally_hosted_header_omits_kid() {
        let key = test_key();
        let assertion = AssertionBuilder::new(&key)
            .build(CLIENT_ID, &audience(), false)
            .unwrap();

        let header = raw_header(assertion.as_str());
        assert!(header.get("kid").is_none());
        assert_eq!(header["alg"], "RS256");
        assert_eq!(assertion.header, AssertionHeader::ExternallyHosted);
    }

    #[test]
    fn test_claims() {
        let key = test_key();
        let assertion = AssertionBuilder::new(&key)
            .with_clock(FixedClock(1_700_000_000))
            .build(CLIENT_ID, &audience(), true)
            .unwrap();

        assert_eq!(assertion.claims.iss, CLIENT_ID);
        assert_eq!(assertion.claims.sub, CLIENT_ID);
        assert_eq!(assertion.claims.aud, audience().as_str());
        assert_eq!(assertion.claims.iat, 1_700_000_000);
        assert_eq!(assertion.claims.exp - assertion.claims.iat, VALIDITY);
        assert_eq!(VALIDITY, 600);
    }

    #[test]
    fn test_jti_is_unique() {
        let key = test_key();
        // Same second for both assertions.
        let builder =
            AssertionBuilder::new(&key).with_clock(FixedClock(1_700_000_000));

        let first = builder.build(CLIENT_ID, &audience(), true).unwrap();
        let second = builder.build(CLIENT_ID, &audience(), true).unwrap();

        assert_ne!(first.claims.jti, second.claims.jti);
        assert_eq!(first.claims.jti.len(), JTI_LENGTH * 2);
        assert_eq!(first.claims.iss, second.claims.iss);
        assert_eq!(first.claims.sub, second.claims.sub);
        assert_eq!(first.claims.aud, second.claims.aud);
    }

    #[test]
    fn test_signing_error() {
        let key = test_key().with_broken_signer();
        let result = AssertionBuilder::new(&key).build(CLIENT_ID, &audience(), true);

        assert!(matches!(result, Err(Error::Signing(_))));
    }

    #[test]
    fn test_algorithm_name() {
        assert_eq!(serde_json::to_value(ALGORITHM).unwrap(), ALGORITHM_NAME);
    }

    #[test]
    fn test_decode_payload_round_trip() {
        let key = test_key();
        let assertion = AssertionBuilder::new(&key)
            .build(CLIENT_ID, &audience(), false)
            .unwrap();

        assert_eq!(
            decode_payload(assertion.as_str()),
            Some(serde_json::to_value(&assertion.claims).unwrap())
        );
    }

    #[test]
    fn test_decode_payload_tolerates_padding() {
        // {"sub":"a"} is 11 bytes long, its encoding needs one padding char.
        let payload = Base64UrlUnpadded::encode_string(br#"{"sub":"a"}"#);
        let token = format!("e30.{payload}=.c2ln");

        assert_eq!(
            decode_payload(&token),
            Some(serde_json::json!({ "sub": "a" }))
        );
    }

    #[test]
    fn test_decode_payload_skips_malformed() {
        assert_eq!(decode_payload("opaque-token"), None);
        assert_eq!(decode_payload("e30.e30"), None);
        assert_eq!(decode_payload("e30.e30.c2ln.extra"), None);
        assert_eq!(decode_payload("e30..c2ln"), None);
        assert_eq!(decode_payload("e30.!!!.c2ln"), None);
        assert_eq!(decode_payload("e30.a.c2ln"), None);
        // Valid base64 but not a JSON object.
        let payload = Base64UrlUnpadded::encode_string(b"[1,2]");
        assert_eq!(decode_payload(&format!("e30.{payload}.c2ln")), None);
    }
}
