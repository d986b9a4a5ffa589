//! Token issuer for generating exchanged tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, Header};
use std::sync::Arc;
use tracing::debug;

use super::claims::OutboundClaims;
use crate::error::{BridgeError, Result};
use crate::signer::Signer;

/// Serializes and signs outbound tokens.
pub struct TokenIssuer {
    signer: Arc<dyn Signer>,
}

/// Issued token result.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWS.
    pub token: String,
    pub key_id: String,
    pub algorithm: Algorithm,
}

/// Signer errors surface as `SigningUnavailable` whatever the signer reported.
fn signing_error(e: BridgeError) -> BridgeError {
    match e {
        BridgeError::SigningUnavailable(_) => e,
        other => BridgeError::SigningUnavailable(other.to_string()),
    }
}

fn encode_segment<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    let json = serde_json::to_vec(value)
        .map_err(|e| BridgeError::SigningUnavailable(format!("failed to encode token {}: {}", what, e)))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

impl TokenIssuer {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    /// Sign `claims` with the signer's current key.
    pub async fn issue(&self, claims: &OutboundClaims) -> Result<IssuedToken> {
        let key = self.signer.public_key().await.map_err(signing_error)?;

        let mut header = Header::new(key.algorithm);
        header.kid = Some(key.key_id.clone());

        let signing_input = format!(
            "{}.{}",
            encode_segment(&header, "header")?,
            encode_segment(claims.as_map(), "payload")?
        );
        let signature = self
            .signer
            .sign(signing_input.as_bytes())
            .await
            .map_err(signing_error)?;

        debug!(
            sub = ?claims.subject(),
            jti = ?claims.jti(),
            kid = %key.key_id,
            exp = ?claims.expires_at(),
            "Issued new token"
        );

        Ok(IssuedToken {
            token: format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)),
            key_id: key.key_id,
            algorithm: key.algorithm,
        })
    }
}
