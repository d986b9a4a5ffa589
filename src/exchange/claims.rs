//! Outbound claim composition under the reserved-claim policy.

use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};
use crate::oidc::VerifiedClaims;

/// Claims controlled exclusively by the bridge.
pub const RESERVED_CLAIMS: [&str; 7] = ["iss", "sub", "aud", "exp", "iat", "nbf", "jti"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_CLAIMS.contains(&name)
}

/// Service-side inputs to composition.
#[derive(Debug, Clone)]
pub struct ComposeContext<'a> {
    /// This service's own issuer URL.
    pub issuer: &'a str,
    /// Outbound audience. Empty: reuse the verified token's audience.
    pub audience: &'a [String],
    pub ttl_secs: u64,
    /// Current time, seconds since the epoch.
    pub now: u64,
}

/// Claim set of a token about to be issued.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundClaims {
    claims: Map<String, Value>,
}

impl OutboundClaims {
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.claims.get("exp").and_then(Value::as_u64)
    }

    pub fn jti(&self) -> Option<&str> {
        self.claims.get("jti").and_then(Value::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// Build the outbound claim set from a verified token and caller claims.
///
/// Any custom claim named like a reserved claim fails the whole
/// composition. Custom claims with an empty name are ignored.
pub fn compose(
    verified: &VerifiedClaims,
    custom: &Map<String, Value>,
    ctx: &ComposeContext<'_>,
) -> Result<OutboundClaims> {
    if let Some(name) = custom.keys().find(|name| is_reserved(name)) {
        return Err(BridgeError::ReservedClaimOverwrite(name.clone()));
    }

    let audience = if ctx.audience.is_empty() {
        verified.audience().values()
    } else {
        ctx.audience.to_vec()
    };
    let aud = match audience.as_slice() {
        [single] => Value::String(single.clone()),
        _ => Value::from(audience),
    };

    let mut claims = Map::new();
    claims.insert("iss".to_string(), Value::from(ctx.issuer));
    claims.insert("sub".to_string(), Value::from(verified.subject()));
    claims.insert("aud".to_string(), aud);
    claims.insert("iat".to_string(), Value::from(ctx.now));
    claims.insert("nbf".to_string(), Value::from(ctx.now));
    claims.insert("exp".to_string(), Value::from(ctx.now + ctx.ttl_secs));
    claims.insert("jti".to_string(), Value::from(generate_jti()));

    for (name, value) in custom {
        if name.is_empty() {
            continue;
        }
        claims.insert(name.clone(), value.clone());
    }

    Ok(OutboundClaims { claims })
}

/// Generate a unique JWT ID.
fn generate_jti() -> String {
    uuid::Uuid::new_v4().to_string()
}
