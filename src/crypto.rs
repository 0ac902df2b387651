//! Private key loading and its public JWK projection.
//!
//! A [`KeyPair`] is loaded once at startup and never re-read. Both the
//! assertion signer and the JWKS handler borrow it, which keeps the `kid`
//! they advertise identical.

use std::fmt;
use std::path::Path;

use base64ct::{Base64UrlUnpadded, Encoding};
use jsonwebtoken::EncodingKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Smallest modulus accepted, in bits.
pub const MIN_KEY_BITS: usize = 2048;
const KEY_TYPE: &str = "RSA";

/// Error related to private keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pkcs1(#[from] rsa::pkcs1::Error),
    #[error(transparent)]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("key is {0} bits long while at least {MIN_KEY_BITS} are required")]
    TooSmall(usize),
    #[error("unknown private key format, PKCS#1 or PKCS#8 PEM is expected")]
    UnknownFormat,
}

/// Public RSA key as a JSON Web Key (RFC 7517).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub n: String,
    pub e: String,
    pub kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#use: Option<String>,
}

impl Jwk {
    /// Annotate the key with its signing algorithm and intended usage.
    pub fn with_usage(mut self, alg: &str, usage: &str) -> Self {
        self.alg = Some(alg.to_owned());
        self.r#use = Some(usage.to_owned());
        self
    }
}

/// Compute the RFC 7638 thumbprint of an RSA key from its base64url
/// encoded exponent and modulus.
pub fn thumbprint(e: &str, n: &str) -> String {
    // Required members only, in lexicographic order, without whitespace.
    let canonical = format!(r#"{{"e":"{e}","kty":"{KEY_TYPE}","n":"{n}"}}"#);
    let digest = Sha256::digest(canonical.as_bytes());

    Base64UrlUnpadded::encode_string(&digest)
}

/// RSA key pair loaded from a PEM file.
#[derive(Clone)]
pub struct KeyPair {
    public: RsaPublicKey,
    signing: EncodingKey,
    kid: String,
}

impl KeyPair {
    /// Read and parse the private key stored at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::KeyNotFound {
                path: path.to_path_buf(),
            });
        }

        let parse_error = |source: KeyError| Error::KeyParse {
            path: path.to_path_buf(),
            source,
        };
        let pem = std::fs::read_to_string(path)
            .map_err(|err| parse_error(err.into()))?;
        let key = Self::from_pem(&pem).map_err(parse_error)?;

        tracing::debug!(path = %path.display(), kid = %key.kid, "private key loaded");
        Ok(key)
    }

    /// Parse a PKCS#1 or PKCS#8 PEM-encoded RSA private key.
    pub fn from_pem(pem: &str) -> std::result::Result<Self, KeyError> {
        let private = if pem.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(pem)?
        } else if pem.contains("BEGIN PRIVATE KEY") {
            RsaPrivateKey::from_pkcs8_pem(pem)?
        } else {
            return Err(KeyError::UnknownFormat);
        };

        let bits = private.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(KeyError::TooSmall(bits));
        }

        let der = private.to_pkcs1_der()?;
        let signing = EncodingKey::from_rsa_der(der.as_bytes());
        let public = private.to_public_key();
        let (n, e) = components(&public);

        Ok(Self {
            kid: thumbprint(&e, &n),
            public,
            signing,
        })
    }

    /// Key identifier, the RFC 7638 thumbprint of the public key.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public half of the key as a bare JWK (`kty`, `n`, `e`, `kid`).
    pub fn public_jwk(&self) -> Jwk {
        let (n, e) = components(&self.public);
        Jwk {
            kty: KEY_TYPE.to_owned(),
            n,
            e,
            kid: self.kid.clone(),
            alg: None,
            r#use: None,
        }
    }

    pub(crate) fn signing_key(&self) -> &EncodingKey {
        &self.signing
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

fn components(public: &RsaPublicKey) -> (String, String) {
    let n = Base64UrlUnpadded::encode_string(&public.n().to_bytes_be());
    let e = Base64UrlUnpadded::encode_string(&public.e().to_bytes_be());
    (n, e)
}

/// Path of the fixture key shared by tests.
#[cfg(test)]
pub(crate) fn fixture_path(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
}

/// MUST NEVER be used in production.
#[cfg(test)]
pub(crate) fn test_key() -> KeyPair {
    KeyPair::from_pem(include_str!("../fixtures/private_key.pem"))
        .expect("fixture key is valid")
}

#[cfg(test)]
impl KeyPair {
    /// Swap the signing material for garbage, detected only when signing.
    pub(crate) fn with_broken_signer(mut self) -> Self {
        self.signing = EncodingKey::from_rsa_der(b"broken");
        self
    }
}
