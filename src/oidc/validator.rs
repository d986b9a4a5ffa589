//! Inbound identity token verification.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::config::TrustedIssuerConfig;
use super::jwks::TrustAnchor;
use super::resolver::TrustAnchorResolver;
use crate::error::{BridgeError, Result};
use crate::signer::parse_algorithm;

/// Audience can be a single string or array of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, aud: &str) -> bool {
        match self {
            Audience::Single(s) => s == aud,
            Audience::Multiple(v) => v.iter().any(|a| a == aud),
        }
    }

    /// Whether any of `accepted` appears in this audience.
    pub fn intersects(&self, accepted: &[String]) -> bool {
        accepted.iter().any(|a| self.contains(a))
    }

    pub fn values(&self) -> Vec<String> {
        match self {
            Audience::Single(s) => vec![s.clone()],
            Audience::Multiple(v) => v.clone(),
        }
    }
}

/// What a token must satisfy besides its signature.
#[derive(Debug, Clone)]
pub struct VerifyPolicy<'a> {
    /// Expected `iss`, compared exactly.
    pub issuer: &'a str,
    /// Accepted audiences; the token's `aud` must contain one of them.
    pub audiences: &'a [String],
    /// Allowance for `iat`/`nbf` slightly in the future.
    pub clock_skew_secs: u64,
}

/// Claims of a token whose signature and standard claims were verified.
///
/// Only produced by [`verify_token_at`].
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims {
    issuer: String,
    subject: String,
    audience: Audience,
    issued_at: Option<u64>,
    expires_at: u64,
    claims: Map<String, Value>,
}

impl VerifiedClaims {
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn audience(&self) -> &Audience {
        &self.audience
    }

    pub fn issued_at(&self) -> Option<u64> {
        self.issued_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Every claim of the token, including provider-specific ones.
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

fn decode_segment<T: for<'de> Deserialize<'de>>(token: &str, index: usize, what: &str) -> Result<T> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(BridgeError::MalformedInput(
            "token is not a compact JWS (expected three segments)".to_string(),
        ));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(parts[index])
        .map_err(|e| BridgeError::MalformedInput(format!("token {} is not base64url: {}", what, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| BridgeError::MalformedInput(format!("token {} is not valid JSON: {}", what, e)))
}

/// Read the `iss` claim without verifying anything. Used only to pick
/// which trusted issuer's policy applies.
pub fn peek_issuer(token: &str) -> Result<String> {
    let payload: Map<String, Value> = decode_segment(token, 1, "payload")?;
    payload
        .get("iss")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::MalformedInput("token has no 'iss' claim".to_string()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Verify a token against a trust anchor using the current time.
pub fn verify_token(token: &str, policy: &VerifyPolicy<'_>, anchor: &TrustAnchor) -> Result<VerifiedClaims> {
    verify_token_at(token, policy, anchor, unix_now())
}

/// Verify a token's algorithm, signature and standard claims as of `now`.
pub fn verify_token_at(
    token: &str,
    policy: &VerifyPolicy<'_>,
    anchor: &TrustAnchor,
    now: u64,
) -> Result<VerifiedClaims> {
    let header: RawHeader = decode_segment(token, 0, "header")?;

    let alg = parse_algorithm(&header.alg).map_err(BridgeError::UnsupportedAlgorithm)?;

    let key = anchor.key(header.kid.as_deref()).ok_or_else(|| {
        BridgeError::UnknownSigningKey(match &header.kid {
            Some(kid) => format!("no key '{}' published by {}", kid, anchor.issuer),
            None => format!("token has no kid and {} publishes several keys", anchor.issuer),
        })
    })?;

    if !key.permits(alg) {
        return Err(BridgeError::UnsupportedAlgorithm(format!(
            "{:?} not accepted by key '{}'",
            alg,
            key.label()
        )));
    }

    let claims = decode_signed(token, &key.key, alg)?;
    check_claims(claims, policy, now)
}

fn decode_signed(token: &str, key: &jsonwebtoken::DecodingKey, alg: Algorithm) -> Result<Map<String, Value>> {
    // Signature only; claims are checked below with exact rules.
    let mut validation = Validation::new(alg);
    validation.leeway = 0;
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    decode::<Map<String, Value>>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                BridgeError::UnsupportedAlgorithm(e.to_string())
            }
            ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                BridgeError::MalformedInput(format!("token could not be decoded: {}", e))
            }
            _ => BridgeError::InvalidSignature(e.to_string()),
        })
}

fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| BridgeError::ClaimValidationFailed(format!("'{}' is not a valid timestamp", name))),
        Some(_) => Err(BridgeError::ClaimValidationFailed(format!(
            "'{}' is not numeric",
            name
        ))),
    }
}

fn check_claims(claims: Map<String, Value>, policy: &VerifyPolicy<'_>, now: u64) -> Result<VerifiedClaims> {
    let issuer = claims
        .get("iss")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if issuer != policy.issuer {
        return Err(BridgeError::ClaimValidationFailed(format!(
            "issuer mismatch: expected '{}', got '{}'",
            policy.issuer, issuer
        )));
    }

    let audience: Audience = claims
        .get("aud")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .ok_or_else(|| BridgeError::ClaimValidationFailed("missing or malformed 'aud'".to_string()))?;
    if !audience.intersects(policy.audiences) {
        return Err(BridgeError::ClaimValidationFailed(format!(
            "audience {:?} does not include any of {:?}",
            audience.values(),
            policy.audiences
        )));
    }

    let expires_at = numeric_claim(&claims, "exp")?
        .ok_or_else(|| BridgeError::ClaimValidationFailed("missing 'exp'".to_string()))?;
    if expires_at <= now {
        return Err(BridgeError::ClaimValidationFailed(format!(
            "token expired at {} (now {})",
            expires_at, now
        )));
    }

    let latest = now.saturating_add(policy.clock_skew_secs);
    if let Some(nbf) = numeric_claim(&claims, "nbf")? {
        if nbf > latest {
            return Err(BridgeError::ClaimValidationFailed(format!(
                "token not valid before {} (now {})",
                nbf, now
            )));
        }
    }
    let issued_at = numeric_claim(&claims, "iat")?;
    if let Some(iat) = issued_at {
        if iat > latest {
            return Err(BridgeError::ClaimValidationFailed(format!(
                "token issued in the future at {} (now {})",
                iat, now
            )));
        }
    }

    let subject = match claims.get("sub").and_then(Value::as_str) {
        Some(sub) if !sub.is_empty() => sub.to_string(),
        _ => return Err(BridgeError::ClaimValidationFailed("missing 'sub'".to_string())),
    };

    Ok(VerifiedClaims {
        issuer,
        subject,
        audience,
        issued_at,
        expires_at,
        claims,
    })
}

/// Verifies tokens against resolved trust anchors, refreshing an anchor
/// once when a token names a key it does not contain.
pub struct TokenVerifier {
    resolver: Arc<TrustAnchorResolver>,
    clock_skew_secs: u64,
}

impl TokenVerifier {
    pub fn new(resolver: Arc<TrustAnchorResolver>, clock_skew_secs: u64) -> Self {
        Self {
            resolver,
            clock_skew_secs,
        }
    }

    pub async fn verify(&self, token: &str, issuer: &TrustedIssuerConfig) -> Result<VerifiedClaims> {
        let policy = VerifyPolicy {
            issuer: &issuer.issuer_url,
            audiences: &issuer.audiences,
            clock_skew_secs: self.clock_skew_secs,
        };

        let anchor = self.resolver.resolve(&issuer.issuer_url).await?;
        match verify_token(token, &policy, &anchor.value) {
            Err(BridgeError::UnknownSigningKey(reason)) => {
                debug!(
                    issuer = %issuer.issuer_url,
                    generation = anchor.generation,
                    reason = %reason,
                    "Key id not in trust anchor, refreshing"
                );
                let refreshed = self
                    .resolver
                    .refresh_for_unknown_key(&issuer.issuer_url, anchor.generation)
                    .await?;
                verify_token(token, &policy, &refreshed.value)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::config::TrustAnchorConfig;
    use crate::oidc::jwks::tests::upstream_jwk;
    use crate::oidc::jwks::JwkSet;
    use crate::retry::RetryConfig;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const UPSTREAM_KEY: &[u8] = include_bytes!("../../testdata/upstream_rsa.pem");
    const ISSUER: &str = "https://issuer.example";
    const NOW: u64 = 1_700_000_000;

    fn anchor() -> TrustAnchor {
        let jwks = JwkSet {
            keys: vec![upstream_jwk("k1")],
        };
        TrustAnchor::from_jwk_set(ISSUER, "https://issuer.example/jwks", &jwks).unwrap()
    }

    fn audiences() -> Vec<String> {
        vec!["bridge".to_string()]
    }

    fn policy(audiences: &[String]) -> VerifyPolicy<'_> {
        VerifyPolicy {
            issuer: ISSUER,
            audiences,
            clock_skew_secs: 30,
        }
    }

    fn claims() -> Value {
        json!({
            "iss": ISSUER,
            "sub": "repo:org/name:ref:main",
            "aud": ["bridge"],
            "iat": NOW - 10,
            "exp": NOW + 300,
            "repository": "org/name",
        })
    }

    fn sign_with(alg: Algorithm, kid: Option<&str>, claims: &Value) -> String {
        let mut header = Header::new(alg);
        header.kid = kid.map(str::to_string);
        let key = EncodingKey::from_rsa_pem(UPSTREAM_KEY).unwrap();
        encode(&header, claims, &key).unwrap()
    }

    fn sign(claims: &Value) -> String {
        sign_with(Algorithm::RS256, Some("k1"), claims)
    }

    #[test]
    fn test_valid_token() {
        let aud = audiences();
        let verified = verify_token_at(&sign(&claims()), &policy(&aud), &anchor(), NOW).unwrap();

        assert_eq!(verified.issuer(), ISSUER);
        assert_eq!(verified.subject(), "repo:org/name:ref:main");
        assert!(verified.audience().contains("bridge"));
        assert_eq!(verified.expires_at(), NOW + 300);
        assert_eq!(verified.issued_at(), Some(NOW - 10));
        assert_eq!(verified.get("repository"), Some(&json!("org/name")));
        assert_eq!(Value::Object(verified.claims().clone()), claims());
    }

    #[test]
    fn test_expired_token() {
        let mut claims = claims();
        claims["exp"] = json!(NOW - 1);
        let aud = audiences();
        let err = verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::ClaimValidationFailed(ref r) if r.contains("expired")));

        // Expiry exactly now is also rejected.
        claims["exp"] = json!(NOW);
        assert!(verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).is_err());
    }

    #[test]
    fn test_wrong_issuer() {
        let mut claims = claims();
        claims["iss"] = json!("https://issuer.example/");
        let aud = audiences();
        let err = verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::ClaimValidationFailed(ref r) if r.contains("issuer")));
    }

    #[test]
    fn test_audience_must_intersect() {
        let aud = audiences();
        let mut claims = claims();
        claims["aud"] = json!("someone-else");
        let err = verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::ClaimValidationFailed(_)));

        claims["aud"] = json!("bridge");
        assert!(verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).is_ok());

        claims["aud"] = json!(["other", "bridge"]);
        assert!(verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).is_ok());

        claims.as_object_mut().unwrap().remove("aud");
        assert!(verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).is_err());
    }

    #[test]
    fn test_future_iat_and_nbf_within_skew() {
        let aud = audiences();
        let mut claims = claims();
        claims["iat"] = json!(NOW + 20);
        claims["nbf"] = json!(NOW + 20);
        assert!(verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).is_ok());

        claims["iat"] = json!(NOW + 120);
        let err = verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::ClaimValidationFailed(ref r) if r.contains("future")));

        claims["iat"] = json!(NOW);
        claims["nbf"] = json!(NOW + 120);
        assert!(verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).is_err());
    }

    #[test]
    fn test_missing_subject() {
        let aud = audiences();
        let mut claims = claims();
        claims.as_object_mut().unwrap().remove("sub");
        let err = verify_token_at(&sign(&claims), &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::ClaimValidationFailed(_)));
    }

    #[test]
    fn test_symmetric_algorithm_rejected() {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".to_string());
        let token = encode(&header, &claims(), &EncodingKey::from_secret(b"secret")).unwrap();

        let aud = audiences();
        let err = verify_token_at(&token, &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_alg_none_rejected() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","kid":"k1"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims().to_string());
        let token = format!("{}.{}.", header, payload);

        let aud = audiences();
        let err = verify_token_at(&token, &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_key_pinned_to_other_algorithm() {
        let token = sign_with(Algorithm::RS384, Some("k1"), &claims());
        let aud = audiences();
        let err = verify_token_at(&token, &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_unknown_kid() {
        let token = sign_with(Algorithm::RS256, Some("rotated"), &claims());
        let aud = audiences();
        let err = verify_token_at(&token, &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownSigningKey(_)));

        // A single published key serves tokens without kid.
        let token = sign_with(Algorithm::RS256, None, &claims());
        assert!(verify_token_at(&token, &policy(&aud), &anchor(), NOW).is_ok());
    }

    #[test]
    fn test_key_without_kid_not_selected_by_name() {
        let mut jwk = upstream_jwk("k1");
        jwk.kid = None;
        let anchor = TrustAnchor::from_jwk_set(ISSUER, "https://issuer.example/jwks", &JwkSet { keys: vec![jwk] }).unwrap();
        let aud = audiences();

        let token = sign_with(Algorithm::RS256, Some("default"), &claims());
        let err = verify_token_at(&token, &policy(&aud), &anchor, NOW).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownSigningKey(_)));

        let token = sign_with(Algorithm::RS256, None, &claims());
        assert!(verify_token_at(&token, &policy(&aud), &anchor, NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload() {
        let token = sign(&claims());
        let mut forged = claims();
        forged["sub"] = json!("repo:attacker/name:ref:main");
        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(forged.to_string()),
            parts[2]
        );

        let aud = audiences();
        let err = verify_token_at(&tampered, &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidSignature(_)));
    }

    #[test]
    fn test_malformed_token() {
        let aud = audiences();
        let err = verify_token_at("not-a-token", &policy(&aud), &anchor(), NOW).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedInput(_)));
    }

    #[test]
    fn test_peek_issuer() {
        assert_eq!(peek_issuer(&sign(&claims())).unwrap(), ISSUER);
        assert!(peek_issuer("a.b").is_err());
    }

    #[tokio::test]
    async fn test_verifier_refreshes_on_unknown_kid() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": server.uri(),
                "jwks_uri": format!("{}/jwks", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [upstream_jwk("old")] })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [upstream_jwk("k1")] })))
            .expect(1)
            .mount(&server)
            .await;

        let issuer = TrustedIssuerConfig {
            name: "mock".to_string(),
            issuer_url: server.uri(),
            audiences: audiences(),
            fingerprints: vec![],
            outbound_audience: vec![],
        };
        let config = TrustAnchorConfig {
            min_refresh_secs: 0,
            retry: RetryConfig::disabled(),
            ..Default::default()
        };
        let resolver = Arc::new(TrustAnchorResolver::new(&[issuer.clone()], &config).unwrap());
        let verifier = TokenVerifier::new(resolver, 30);

        let now = unix_now();
        let token = sign(&json!({
            "iss": server.uri(),
            "sub": "system:serviceaccount:ci:deployer",
            "aud": "bridge",
            "iat": now,
            "exp": now + 300,
        }));

        let verified = verifier.verify(&token, &issuer).await.unwrap();
        assert_eq!(verified.subject(), "system:serviceaccount:ci:deployer");

        // The rotated key is now cached.
        assert!(verifier.verify(&token, &issuer).await.is_ok());
    }
}
