//! JSON Web Keys and the trust anchor built from them.

use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Key set document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC)
    pub kty: String,
    /// Key ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    // RSA parameters
    /// RSA modulus (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    // EC parameters
    /// EC curve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC x coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// Asymmetric key families a verification key can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    EcP256,
    EcP384,
}

impl KeyFamily {
    /// Whether a token signed with `alg` may be checked with a key of this family.
    pub fn accepts(self, alg: Algorithm) -> bool {
        match self {
            KeyFamily::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyFamily::EcP256 => alg == Algorithm::ES256,
            KeyFamily::EcP384 => alg == Algorithm::ES384,
        }
    }
}

/// A published public key usable for signature verification.
#[derive(Clone)]
pub struct VerificationKey {
    pub kid: Option<String>,
    pub family: KeyFamily,
    /// Algorithm pinned by the key's `alg` member, if any.
    pub alg: Option<Algorithm>,
    pub key: DecodingKey,
}

impl VerificationKey {
    /// Convert a JWK into a verification key.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, String> {
        let alg = match jwk.alg.as_deref() {
            Some(name) => Some(
                name.parse::<Algorithm>()
                    .map_err(|_| format!("unrecognised alg '{}'", name))?,
            ),
            None => None,
        };

        let (family, key) = match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk.n.as_ref().ok_or("RSA key missing 'n'")?;
                let e = jwk.e.as_ref().ok_or("RSA key missing 'e'")?;
                let key = DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| format!("invalid RSA key: {}", e))?;
                (KeyFamily::Rsa, key)
            }
            "EC" => {
                let x = jwk.x.as_ref().ok_or("EC key missing 'x'")?;
                let y = jwk.y.as_ref().ok_or("EC key missing 'y'")?;
                let crv = jwk.crv.as_ref().ok_or("EC key missing 'crv'")?;
                let family = match crv.as_str() {
                    "P-256" => KeyFamily::EcP256,
                    "P-384" => KeyFamily::EcP384,
                    _ => return Err(format!("unsupported EC curve: {}", crv)),
                };
                let key = DecodingKey::from_ec_components(x, y)
                    .map_err(|e| format!("invalid EC key: {}", e))?;
                (family, key)
            }
            kty => return Err(format!("unsupported key type: {}", kty)),
        };

        if let Some(alg) = alg {
            if !family.accepts(alg) {
                return Err(format!("alg {:?} does not match key type {}", alg, jwk.kty));
            }
        }

        Ok(Self {
            kid: jwk.kid.clone(),
            family,
            alg,
            key,
        })
    }

    /// `kid` for log and error messages.
    pub fn label(&self) -> &str {
        self.kid.as_deref().unwrap_or("<no kid>")
    }

    /// Whether this key may verify a token signed with `alg`.
    pub fn permits(&self, alg: Algorithm) -> bool {
        self.family.accepts(alg) && self.alg.map_or(true, |pinned| pinned == alg)
    }
}

/// Verification material published by one external issuer.
#[derive(Clone)]
pub struct TrustAnchor {
    /// Issuer URL the keys belong to.
    pub issuer: String,
    /// Where the keys were fetched from.
    pub jwks_uri: String,
    keys: HashMap<String, VerificationKey>,
    /// Keys published without `kid`. Only reachable by a token without `kid`.
    unkeyed: Vec<VerificationKey>,
}

impl std::fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("issuer", &self.issuer)
            .field("jwks_uri", &self.jwks_uri)
            .field("kids", &self.keys.keys().collect::<Vec<_>>())
            .field("unkeyed", &self.unkeyed.len())
            .finish()
    }
}

impl TrustAnchor {
    /// Build an anchor from a key set, skipping encryption keys and keys
    /// that cannot be parsed. An anchor with no usable keys is an error.
    pub fn from_jwk_set(issuer: &str, jwks_uri: &str, jwks: &JwkSet) -> Result<Self, String> {
        let mut keys = HashMap::new();
        let mut unkeyed = Vec::new();
        for jwk in &jwks.keys {
            // Skip encryption keys
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            match VerificationKey::from_jwk(jwk) {
                Ok(key) => {
                    debug!(kid = %key.label(), kty = %jwk.kty, "Loaded JWK");
                    match key.kid.clone() {
                        Some(kid) => {
                            keys.insert(kid, key);
                        }
                        None => unkeyed.push(key),
                    }
                }
                Err(e) => {
                    warn!(
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        error = %e,
                        "Failed to parse JWK, skipping"
                    );
                }
            }
        }

        if keys.is_empty() && unkeyed.is_empty() {
            return Err("no valid signing keys found in JWKS".to_string());
        }

        Ok(Self {
            issuer: issuer.to_string(),
            jwks_uri: jwks_uri.to_string(),
            keys,
            unkeyed,
        })
    }

    /// Look up the key for a token header's `kid`.
    ///
    /// A token without `kid` is only accepted when exactly one key is
    /// published, with or without a `kid` of its own.
    pub fn key(&self, kid: Option<&str>) -> Option<&VerificationKey> {
        match kid {
            Some(kid) => self.keys.get(kid),
            None if self.key_count() == 1 => self.keys.values().chain(&self.unkeyed).next(),
            None => None,
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len() + self.unkeyed.len()
    }
}
