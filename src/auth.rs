//! Basic-auth credentials and the inbound access gate

use crate::error::{ProxyError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::fmt;
use tracing::{debug, warn};

/// Realm sent with the authentication challenge
pub const REALM: &str = "401";

/// A `user:pass` pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(user_pass: &str) -> Self {
        Self(user_pass.to_string())
    }

    pub fn username(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// `Basic <base64(user:pass)>`
    pub fn basic_header(&self) -> HeaderValue {
        let encoded = STANDARD.encode(self.0.as_bytes());
        // base64 output is always a valid header value
        HeaderValue::from_str(&format!("Basic {}", encoded))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"))
    }

    /// Compare against a raw `Authorization` header value. Only the Basic
    /// scheme (any case) is accepted.
    pub fn matches(&self, authorization: &str) -> bool {
        let Some((scheme, encoded)) = authorization.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            debug!("Unsupported authorization scheme: {}", scheme);
            return false;
        }
        match STANDARD.decode(encoded.trim()) {
            Ok(decoded) => decoded == self.0.as_bytes(),
            Err(e) => {
                debug!("Failed to decode Basic auth credentials: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}:***)", self.username())
    }
}

/// Global inbound credential check, independent of the requested site
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    credential: Option<Credential>,
}

impl AccessGate {
    pub fn new(credential: Option<Credential>) -> Self {
        Self { credential }
    }

    pub fn is_enabled(&self) -> bool {
        self.credential.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.credential else {
            return Ok(());
        };

        let provided = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if expected.matches(provided) {
            Ok(())
        } else {
            warn!("Rejected request with missing or invalid credentials");
            Err(ProxyError::Unauthorized)
        }
    }
}
