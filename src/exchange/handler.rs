//! Exchange requests and the orchestrator that serves them.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, info_span, warn, Instrument};

use super::claims::{compose, ComposeContext};
use super::config::ExchangeConfig;
use super::issuer::TokenIssuer;
use crate::error::{BridgeError, Result};
use crate::oidc::{peek_issuer, TokenVerifier, TrustedIssuerConfig};

/// Token type URN of issued tokens (RFC 8693).
pub const ISSUED_TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";

/// A parsed exchange request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRequest {
    /// The inbound identity token.
    pub id_token: String,
    /// Caller-supplied claims, untrusted until composed.
    pub custom_claims: Map<String, Value>,
    /// Trusted issuer to verify against, by name. When absent the token's
    /// own `iss` selects it.
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRequest {
    #[serde(default, alias = "subject_token")]
    id_token: Option<String>,
    #[serde(default)]
    custom_claims: Option<Value>,
    #[serde(default)]
    provider: Option<String>,
}

/// RFC 8693 style form body. Other token-exchange fields are accepted and ignored.
#[derive(Debug, Deserialize)]
struct FormRequest {
    #[serde(default)]
    subject_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    /// JSON object, encoded as a form value.
    #[serde(default)]
    custom_claims: Option<String>,
    #[serde(default)]
    provider: Option<String>,
}

fn custom_claims_object(value: Option<Value>) -> Result<Map<String, Value>> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(mut map)) => {
            map.remove("");
            Ok(map)
        }
        Some(_) => Err(BridgeError::MalformedInput(
            "custom_claims must be a JSON object".to_string(),
        )),
    }
}

fn required_token(token: Option<String>) -> Result<String> {
    match token {
        Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(BridgeError::MalformedInput("missing id_token".to_string())),
    }
}

/// Parse an exchange request body.
///
/// JSON and `application/x-www-form-urlencoded` bodies are accepted; without
/// a content type the body shape decides. Hosts that deliver bodies
/// base64-encoded set `is_base64`.
pub fn parse_exchange_request(content_type: Option<&str>, body: &str, is_base64: bool) -> Result<ExchangeRequest> {
    let decoded;
    let body = if is_base64 {
        let bytes = STANDARD
            .decode(body.trim())
            .map_err(|e| BridgeError::MalformedInput(format!("body is not valid base64: {}", e)))?;
        decoded = String::from_utf8(bytes)
            .map_err(|_| BridgeError::MalformedInput("body is not valid UTF-8".to_string()))?;
        decoded.as_str()
    } else {
        body
    };

    let is_form = match content_type.map(|ct| ct.trim().to_ascii_lowercase()) {
        Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => true,
        Some(ct) if ct.starts_with("application/json") => false,
        _ => !body.trim_start().starts_with('{'),
    };

    if is_form {
        let form: FormRequest = serde_urlencoded::from_str(body)
            .map_err(|e| BridgeError::MalformedInput(format!("invalid form body: {}", e)))?;
        let custom = match form.custom_claims.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
                BridgeError::MalformedInput(format!("custom_claims is not valid JSON: {}", e))
            })?),
        };
        Ok(ExchangeRequest {
            id_token: required_token(form.subject_token.or(form.id_token))?,
            custom_claims: custom_claims_object(custom)?,
            provider: form.provider.filter(|p| !p.is_empty()),
        })
    } else {
        let json: JsonRequest = serde_json::from_str(body)
            .map_err(|e| BridgeError::MalformedInput(format!("invalid JSON body: {}", e)))?;
        Ok(ExchangeRequest {
            id_token: required_token(json.id_token)?,
            custom_claims: custom_claims_object(json.custom_claims)?,
            provider: json.provider.filter(|p| !p.is_empty()),
        })
    }
}

/// Successful exchange response (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeResponse {
    /// The issued token.
    pub access_token: String,
    /// Type of token issued (URN).
    pub issued_token_type: String,
    /// Token type (always "Bearer").
    pub token_type: String,
    /// Expires in seconds.
    pub expires_in: u64,
}

/// Progress of one exchange. A failure at any stage rejects the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStage {
    Received,
    Verified,
    Composed,
    Issued,
    Completed,
}

/// Verifier → composer → issuer.
pub struct ExchangeService {
    /// This service's own issuer URL.
    issuer_url: String,
    config: ExchangeConfig,
    trusted: Vec<TrustedIssuerConfig>,
    verifier: TokenVerifier,
    issuer: TokenIssuer,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ExchangeService {
    pub fn new(
        issuer_url: &str,
        config: ExchangeConfig,
        trusted: Vec<TrustedIssuerConfig>,
        verifier: TokenVerifier,
        issuer: TokenIssuer,
    ) -> Self {
        Self {
            issuer_url: issuer_url.to_string(),
            config,
            trusted,
            verifier,
            issuer,
        }
    }

    /// Pick the trusted issuer whose policy applies to `request`.
    fn select_issuer(&self, request: &ExchangeRequest) -> Result<&TrustedIssuerConfig> {
        match &request.provider {
            Some(name) => self
                .trusted
                .iter()
                .find(|issuer| &issuer.name == name)
                .ok_or_else(|| BridgeError::UntrustedIssuer(format!("unknown provider '{}'", name))),
            None => {
                let iss = peek_issuer(&request.id_token)?;
                self.trusted
                    .iter()
                    .find(|issuer| issuer.issuer_url == iss)
                    .ok_or_else(|| BridgeError::UntrustedIssuer(format!("issuer '{}' is not trusted", iss)))
            }
        }
    }

    /// Exchange a verified identity token for a token signed by this service.
    pub async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeResponse> {
        let request_id = uuid::Uuid::new_v4();
        let span = info_span!("exchange", request_id = %request_id);

        let mut stage = ExchangeStage::Received;
        let result = self.run(&request, &mut stage).instrument(span.clone()).await;

        if let Err(e) = &result {
            span.in_scope(|| {
                warn!(
                    stage = ?stage,
                    component = e.component(),
                    kind = e.kind(),
                    error = %e,
                    "Exchange rejected"
                )
            });
        }
        result
    }

    async fn run(&self, request: &ExchangeRequest, stage: &mut ExchangeStage) -> Result<ExchangeResponse> {
        let trusted = self.select_issuer(request)?;
        debug!(provider = %trusted.name, issuer = %trusted.issuer_url, "Selected trusted issuer");

        let verified = self.verifier.verify(&request.id_token, trusted).await?;
        *stage = ExchangeStage::Verified;

        let audience = if trusted.outbound_audience.is_empty() {
            &self.config.default_audience
        } else {
            &trusted.outbound_audience
        };
        let claims = compose(
            &verified,
            &request.custom_claims,
            &ComposeContext {
                issuer: &self.issuer_url,
                audience,
                ttl_secs: self.config.token_ttl_secs,
                now: unix_now(),
            },
        )?;
        *stage = ExchangeStage::Composed;

        let issued = self.issuer.issue(&claims).await?;
        *stage = ExchangeStage::Issued;

        if self.config.log_exchanges {
            info!(
                provider = %trusted.name,
                subject = %verified.subject(),
                jti = ?claims.jti(),
                kid = %issued.key_id,
                custom_claims = request.custom_claims.len(),
                "Token exchange successful"
            );
        }

        *stage = ExchangeStage::Completed;
        Ok(ExchangeResponse {
            access_token: issued.token,
            issued_token_type: ISSUED_TOKEN_TYPE_JWT.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: self.config.token_ttl_secs,
        })
    }
}
