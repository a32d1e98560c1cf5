// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access tokens, best-effort JWT decoding and the managed-identity token cache.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use data_encoding::BASE64URL_NOPAD;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;

/// An access token and, when the issuer reported it, its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: Option<DateTime<Utc>>,
}

impl core::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_on: None,
        }
    }

    pub fn with_expiry(mut self, expires_on: DateTime<Utc>) -> Self {
        self.expires_on = Some(expires_on);
        self
    }

    /// Reported expiry, else the JWT `exp` claim, else `now + fallback`.
    pub fn expiry(&self, now: DateTime<Utc>, fallback: Duration) -> DateTime<Utc> {
        self.expires_on
            .or_else(|| {
                DecodedJwt::decode(&self.token)
                    .ok()
                    .and_then(|jwt| jwt.expires_at())
            })
            .unwrap_or(now + fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwtDecodeError {
    Malformed(String),
    Encoding(String),
    Json(String),
}

impl core::fmt::Display for JwtDecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            JwtDecodeError::Malformed(msg) => write!(f, "Malformed JWT: {}", msg),
            JwtDecodeError::Encoding(msg) => write!(f, "Invalid JWT segment encoding: {}", msg),
            JwtDecodeError::Json(msg) => write!(f, "Invalid JWT segment JSON: {}", msg),
        }
    }
}

impl std::error::Error for JwtDecodeError {}

/// Header, payload and raw signature of a compact JWS. The signature is not verified.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedJwt {
    pub header: Map<String, Value>,
    pub payload: Map<String, Value>,
    pub signature: String,
}

impl DecodedJwt {
    pub fn decode(token: &str) -> core::result::Result<Self, JwtDecodeError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(JwtDecodeError::Malformed(
                "expected three dot-separated segments".to_string(),
            ));
        };

        Ok(Self {
            header: Self::decode_segment(header, "header")?,
            payload: Self::decode_segment(payload, "payload")?,
            signature: signature.to_string(),
        })
    }

    fn decode_segment(
        segment: &str,
        what: &str,
    ) -> core::result::Result<Map<String, Value>, JwtDecodeError> {
        let bytes = BASE64URL_NOPAD
            .decode(segment.trim_end_matches('=').as_bytes())
            .map_err(|e| JwtDecodeError::Encoding(format!("{}: {}", what, e)))?;
        match serde_json::from_slice(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(JwtDecodeError::Json(format!("{} is not an object", what))),
            Err(e) => Err(JwtDecodeError::Json(format!("{}: {}", what, e))),
        }
    }

    fn claim_str(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(|v| v.as_str())
    }

    pub fn issuer(&self) -> Option<&str> {
        self.claim_str("iss")
    }

    pub fn subject(&self) -> Option<&str> {
        self.claim_str("sub")
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let exp = self.payload.get("exp")?;
        let seconds = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
        Utc.timestamp_opt(seconds, 0).single()
    }

    /// The `JsonWebToken` output shape.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "Header": Value::Object(self.header.clone()),
            "Payload": Value::Object(self.payload.clone()),
            "Signature": self.signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: Uuid,
    application_id: Uuid,
    /// Lower-cased, original order.
    scopes: Vec<String>,
}

impl CacheKey {
    fn new(tenant_id: Uuid, application_id: Uuid, scopes: &[String]) -> Self {
        Self {
            tenant_id,
            application_id,
            scopes: scopes.iter().map(|s| s.to_lowercase()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_on: DateTime<Utc>,
}

/// Managed-identity tokens of one broker.
///
/// Keyed by tenant, application and the scope list (case-insensitive, order
/// sensitive). A token is handed out until `refresh_skew` before it expires.
#[derive(Debug)]
pub struct TokenCache {
    refresh_skew: Duration,
    fallback_lifetime: Duration,
    entries: Mutex<HashMap<CacheKey, CachedToken>>,
}

impl TokenCache {
    pub fn new(refresh_skew: Duration) -> Self {
        Self {
            refresh_skew,
            fallback_lifetime: Duration::hours(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fallback_lifetime(mut self, lifetime: Duration) -> Self {
        self.fallback_lifetime = lifetime;
        self
    }

    pub fn get_or_acquire(
        &self,
        tenant_id: Uuid,
        application_id: Uuid,
        scopes: &[String],
        acquire: impl FnOnce() -> Result<AccessToken>,
    ) -> Result<String> {
        self.get_or_acquire_at(Utc::now(), tenant_id, application_id, scopes, acquire)
    }

    /// As [`TokenCache::get_or_acquire`] with an explicit clock.
    pub fn get_or_acquire_at(
        &self,
        now: DateTime<Utc>,
        tenant_id: Uuid,
        application_id: Uuid,
        scopes: &[String],
        acquire: impl FnOnce() -> Result<AccessToken>,
    ) -> Result<String> {
        let key = CacheKey::new(tenant_id, application_id, scopes);
        if let Some(cached) = self.lock().get(&key) {
            if now < cached.expires_on - self.refresh_skew {
                tracing::debug!(%tenant_id, %application_id, "token cache hit");
                return Ok(cached.token.clone());
            }
        }

        // The lock is not held while acquiring.
        let token = acquire()?;
        let expires_on = token.expiry(now, self.fallback_lifetime);
        self.lock().insert(
            key,
            CachedToken {
                token: token.token.clone(),
                expires_on,
            },
        );
        Ok(token.token)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CachedToken>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Build an unsigned compact JWT from a payload; for tests and fixtures.
pub fn unsigned_jwt(payload: &Value) -> String {
    let header = BASE64URL_NOPAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = BASE64URL_NOPAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.", header, body)
}
