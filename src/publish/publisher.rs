//! Key set and discovery document publication.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::Algorithm;

use super::config::KeySetConfig;
use crate::cache::RefreshCache;
use crate::error::{BridgeError, Result};
use crate::exchange::RESERVED_CLAIMS;
use crate::oidc::{Jwk, JwkSet};
use crate::signer::{algorithm_name, Signer, SigningKeyInfo};

/// Path of the key set relative to the service's base URL.
pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// OpenID provider metadata for this service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub jwks_uri: String,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub claims_supported: Vec<String>,
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len().saturating_sub(1));
    &bytes[start..]
}

/// Render a signing key's public half as a JWK.
pub fn jwk_from_key_info(info: &SigningKeyInfo) -> std::result::Result<Jwk, String> {
    let (_, spki) = SubjectPublicKeyInfo::from_der(&info.public_key_der)
        .map_err(|e| format!("invalid public key DER: {}", e))?;
    let parsed = spki
        .parsed()
        .map_err(|e| format!("unsupported public key: {}", e))?;

    let alg = algorithm_name(info.algorithm).to_string();
    let mut jwk = Jwk {
        kid: Some(info.key_id.clone()),
        alg: Some(alg),
        key_use: Some("sig".to_string()),
        ..Default::default()
    };

    match parsed {
        PublicKey::RSA(rsa) => {
            if !matches!(
                info.algorithm,
                Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::PS256 | Algorithm::PS384 | Algorithm::PS512
            ) {
                return Err(format!("RSA key cannot be used with {:?}", info.algorithm));
            }
            jwk.kty = "RSA".to_string();
            jwk.n = Some(URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.modulus)));
            jwk.e = Some(URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.exponent)));
        }
        PublicKey::EC(point) => {
            let data = point.data();
            let (crv, size, expected) = match data.len() {
                65 => ("P-256", 32, Algorithm::ES256),
                97 => ("P-384", 48, Algorithm::ES384),
                n => return Err(format!("unsupported EC point length {}", n)),
            };
            if data[0] != 0x04 {
                return Err("EC point is not uncompressed".to_string());
            }
            if info.algorithm != expected {
                return Err(format!("{} key cannot be used with {:?}", crv, info.algorithm));
            }
            jwk.kty = "EC".to_string();
            jwk.crv = Some(crv.to_string());
            jwk.x = Some(URL_SAFE_NO_PAD.encode(&data[1..1 + size]));
            jwk.y = Some(URL_SAFE_NO_PAD.encode(&data[1 + size..]));
        }
        _ => return Err("only RSA and EC public keys can be published".to_string()),
    }

    Ok(jwk)
}

/// Publishes the signer's public key, cached with its own TTL.
pub struct KeySetPublisher {
    signer: Arc<dyn Signer>,
    cache: RefreshCache<(), Arc<JwkSet>>,
}

impl KeySetPublisher {
    /// `signer_budget` is the longest the signer's public key lookup may take.
    pub fn new(signer: Arc<dyn Signer>, config: &KeySetConfig, signer_budget: Duration) -> Self {
        Self {
            signer,
            cache: RefreshCache::new(
                "key_set",
                Duration::from_secs(config.ttl_secs),
                config.refresh_timeout(signer_budget),
                BridgeError::KeySetUnavailable,
            ),
        }
    }

    /// Current key set document.
    pub async fn publish(&self) -> Result<Arc<JwkSet>> {
        let signer = Arc::clone(&self.signer);
        let entry = self
            .cache
            .get_or_fetch(&(), move || async move {
                let info = signer
                    .public_key()
                    .await
                    .map_err(|e| BridgeError::KeySetUnavailable(e.to_string()))?;
                let jwk = jwk_from_key_info(&info).map_err(BridgeError::KeySetUnavailable)?;
                info!(kid = %info.key_id, kty = %jwk.kty, "Rendered key set");
                Ok(Arc::new(JwkSet { keys: vec![jwk] }))
            })
            .await?;
        Ok(entry.value)
    }

    /// Discovery document for a service reachable at `base_url`.
    pub async fn discovery(&self, base_url: &str) -> Result<DiscoveryDocument> {
        if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
            return Err(BridgeError::MalformedInput(format!(
                "base URL '{}' is not an HTTP(S) URL",
                base_url
            )));
        }
        let issuer = base_url.trim_end_matches('/').to_string();

        let key_set = self.publish().await?;
        let algs = key_set
            .keys
            .iter()
            .filter_map(|k| k.alg.clone())
            .collect::<Vec<_>>();
        debug!(issuer = %issuer, "Rendering discovery document");

        Ok(DiscoveryDocument {
            jwks_uri: format!("{}{}", issuer, JWKS_PATH),
            issuer,
            id_token_signing_alg_values_supported: algs,
            response_types_supported: vec!["id_token".to_string()],
            subject_types_supported: vec!["public".to_string()],
            claims_supported: RESERVED_CLAIMS.iter().map(|c| c.to_string()).collect(),
        })
    }
}
