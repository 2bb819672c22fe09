//! Deployment tokens.
//!
//! Tokens are JWTs issued by the deployment. Only the payload is decoded
//! (no signature check); the claims decide whether a token is a master,
//! tenant or webtask token and carry the webtask settings that have to
//! survive a migration.

pub mod store;

pub use store::TokenStore;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};

use crate::config::secrets::SecretString;
use crate::error::{Error, Result};

/// Claims that describe the token itself rather than webtask settings.
const RESERVED_CLAIMS: &[&str] = &[
    "jti", "iat", "ca", "dd", "dr", "ten", "jtn", "url", "ectx", "host",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// No tenant claim.
    Master,
    /// Scoped to one tenant.
    Tenant,
    /// Tenant token that cannot issue further tokens (`dd == 0`).
    Webtask,
}

#[derive(Clone)]
pub struct Token {
    encoded: SecretString,
    claims: Map<String, Value>,
    tenant: Option<String>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind())
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl Token {
    pub fn parse(encoded: &str) -> Result<Self> {
        let claims = decode_claims(encoded)?;
        let tenant = claims
            .get("ten")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok(Self {
            encoded: SecretString::from(encoded.to_string()),
            claims,
            tenant,
        })
    }

    /// Parse a token and pin it to `tenant`, whatever its `ten` claim says.
    pub fn for_tenant(encoded: &str, tenant: &str) -> Result<Self> {
        let mut token = Self::parse(encoded)?;
        token.tenant = Some(tenant.to_string());
        Ok(token)
    }

    pub fn kind(&self) -> TokenKind {
        let ten = self.claims.get("ten").and_then(Value::as_str).unwrap_or("");
        if ten.is_empty() {
            TokenKind::Master
        } else if self.claims.get("dd").and_then(Value::as_i64) == Some(0) {
            TokenKind::Webtask
        } else {
            TokenKind::Tenant
        }
    }

    pub fn is_master(&self) -> bool {
        self.kind() == TokenKind::Master
    }

    pub fn is_webtask(&self) -> bool {
        self.kind() == TokenKind::Webtask
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Claims a re-issued webtask token must carry over.
    pub fn webtask_claims(&self) -> Map<String, Value> {
        self.claims
            .iter()
            .filter(|(key, value)| {
                let key = key.as_str();
                !(RESERVED_CLAIMS.contains(&key)
                    || (key == "pb" && value.as_i64() == Some(2))
                    || (key == "mb" && value.as_i64() == Some(0)))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn tenant_name(&self) -> &str {
        self.tenant.as_deref().unwrap_or("")
    }

    pub fn webtask_name(&self) -> &str {
        self.claims.get("jtn").and_then(Value::as_str).unwrap_or("")
    }

    pub fn host(&self) -> Option<&str> {
        self.claims.get("host").and_then(Value::as_str)
    }

    /// External code URL; `webtask://` URLs point at inline code and don't count.
    pub fn code_url(&self) -> Option<&str> {
        self.claims
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.starts_with("webtask://"))
    }

    pub fn secret(&self) -> SecretString {
        self.encoded.clone()
    }
}

fn decode_claims(encoded: &str) -> Result<Map<String, Value>> {
    let payload = encoded
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Token("token is not a JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Token(format!("bad token payload encoding: {e}")))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(claims)) => Ok(claims),
        Ok(_) => Err(Error::Token("token payload is not an object".to_string())),
        Err(e) => Err(Error::Token(format!("bad token payload: {e}"))),
    }
}
