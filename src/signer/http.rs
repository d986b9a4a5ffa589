//! Remote signing service over HTTP.
//!
//! `POST {endpoint}/keys/{key_id}/sign` with `{"algorithm", "message"}`
//! returns `{"signature"}`; `GET {endpoint}/keys/{key_id}` returns
//! `{"key_id", "algorithm", "public_key"}`. Binary values are standard base64.
//!
//! ECDSA signatures may come back DER encoded, as cloud KMS services return
//! them, or already in the JWS form (`r || s`, each padded to the curve
//! size). Either way the backend hands out the JWS form.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use jsonwebtoken::Algorithm;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::backend::{BackendError, BackendKey, SigningBackend};
use super::{algorithm_name, parse_algorithm};

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    algorithm: &'a str,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct KeyDescription {
    key_id: String,
    algorithm: String,
    public_key: String,
}

/// Client for a remote signing service.
pub struct HttpKeyBackend {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpKeyBackend {
    pub fn new(endpoint: &str, bearer_token: Option<String>, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("token-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    fn key_url(&self, key_id: &str) -> String {
        format!("{}/keys/{}", self.endpoint, urlencoding::encode(key_id))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, BackendError> {
        let request = match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("signing service unreachable: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(BackendError::Transient(format!("signing service returned HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Rejected(format!(
                "signing service returned HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Rejected(format!("malformed signing service response: {}", e)))
    }
}

#[async_trait]
impl SigningBackend for HttpKeyBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn sign(&self, key_id: &str, algorithm: Algorithm, message: &[u8]) -> Result<Vec<u8>, BackendError> {
        let body = SignRequest {
            algorithm: algorithm_name(algorithm),
            message: STANDARD.encode(message),
        };
        let url = format!("{}/sign", self.key_url(key_id));
        let response: SignResponse = self.send(self.client.post(&url).json(&body)).await?;

        let signature = STANDARD
            .decode(response.signature.as_bytes())
            .map_err(|e| BackendError::Rejected(format!("signature is not valid base64: {}", e)))?;

        jws_signature(algorithm, signature)
    }

    async fn public_key(&self, key_id: &str) -> Result<BackendKey, BackendError> {
        let description: KeyDescription = self.send(self.client.get(self.key_url(key_id))).await?;

        if description.key_id != key_id {
            return Err(BackendError::Rejected(format!(
                "signing service described key '{}' instead of '{}'",
                description.key_id, key_id
            )));
        }

        let algorithm = parse_algorithm(&description.algorithm).map_err(BackendError::Rejected)?;
        let public_key_der = STANDARD
            .decode(description.public_key.as_bytes())
            .map_err(|e| BackendError::Rejected(format!("public key is not valid base64: {}", e)))?;

        Ok(BackendKey {
            public_key_der,
            algorithm: Some(algorithm),
        })
    }
}

/// Bring a signature into JWS form. Only ECDSA needs work.
fn jws_signature(algorithm: Algorithm, signature: Vec<u8>) -> Result<Vec<u8>, BackendError> {
    let scalar_len = match algorithm {
        Algorithm::ES256 => 32,
        Algorithm::ES384 => 48,
        _ => return Ok(signature),
    };

    if let Some(raw) = ecdsa_der_to_raw(&signature, scalar_len) {
        return Ok(raw);
    }
    if signature.len() == scalar_len * 2 {
        return Ok(signature);
    }
    Err(BackendError::Rejected(format!(
        "{} signature is neither DER nor {} raw bytes (got {})",
        algorithm_name(algorithm),
        scalar_len * 2,
        signature.len()
    )))
}

/// `SEQUENCE { r INTEGER, s INTEGER }` to `r || s`.
fn ecdsa_der_to_raw(der: &[u8], scalar_len: usize) -> Option<Vec<u8>> {
    let (body, rest) = der_element(der, 0x30)?;
    if !rest.is_empty() {
        return None;
    }
    let (r, body) = der_element(body, 0x02)?;
    let (s, body) = der_element(body, 0x02)?;
    if !body.is_empty() {
        return None;
    }

    let mut raw = vec![0u8; scalar_len * 2];
    copy_scalar(r, &mut raw[..scalar_len])?;
    copy_scalar(s, &mut raw[scalar_len..])?;
    Some(raw)
}

/// Split one element with the given tag off the front of `input`.
fn der_element(input: &[u8], tag: u8) -> Option<(&[u8], &[u8])> {
    let (&first, rest) = input.split_first()?;
    if first != tag {
        return None;
    }
    let (&len_byte, rest) = rest.split_first()?;
    let (len, rest) = match len_byte {
        n if n < 0x80 => (n as usize, rest),
        0x81 => {
            let (&n, rest) = rest.split_first()?;
            (n as usize, rest)
        }
        _ => return None,
    };
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

fn copy_scalar(integer: &[u8], out: &mut [u8]) -> Option<()> {
    let start = integer.iter().position(|b| *b != 0).unwrap_or(integer.len());
    let digits = &integer[start..];
    if digits.len() > out.len() {
        return None;
    }
    let offset = out.len() - digits.len();
    out[offset..].copy_from_slice(digits);
    Some(())
}
