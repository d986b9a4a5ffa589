//! Error kinds surfaced by the exchange engine.
//!
//! Verification and policy failures are terminal for a request. The three
//! `*Unavailable` kinds describe infrastructure failures that were already
//! retried (within budget) at the point of the remote call.

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Every way an exchange or discovery request can fail.
///
/// Reasons are plain strings so the error stays `Clone`: a single failed
/// cache refresh is handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("untrusted issuer: {0}")]
    UntrustedIssuer(String),

    #[error("trust anchor unavailable: {0}")]
    TrustAnchorUnavailable(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unknown signing key: {0}")]
    UnknownSigningKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("claim validation failed: {0}")]
    ClaimValidationFailed(String),

    #[error("custom claim '{0}' cannot overwrite a reserved claim")]
    ReservedClaimOverwrite(String),

    #[error("signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("key set unavailable: {0}")]
    KeySetUnavailable(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl BridgeError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::UntrustedIssuer(_) => "untrusted_issuer",
            BridgeError::TrustAnchorUnavailable(_) => "trust_anchor_unavailable",
            BridgeError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            BridgeError::UnknownSigningKey(_) => "unknown_signing_key",
            BridgeError::InvalidSignature(_) => "invalid_signature",
            BridgeError::ClaimValidationFailed(_) => "claim_validation_failed",
            BridgeError::ReservedClaimOverwrite(_) => "reserved_claim_overwrite",
            BridgeError::SigningUnavailable(_) => "signing_unavailable",
            BridgeError::KeySetUnavailable(_) => "key_set_unavailable",
            BridgeError::MalformedInput(_) => "malformed_input",
        }
    }

    /// Component responsible for the failure, for logs.
    pub fn component(&self) -> &'static str {
        match self {
            BridgeError::UntrustedIssuer(_) | BridgeError::TrustAnchorUnavailable(_) => {
                "trust_anchor"
            }
            BridgeError::UnsupportedAlgorithm(_)
            | BridgeError::UnknownSigningKey(_)
            | BridgeError::InvalidSignature(_)
            | BridgeError::ClaimValidationFailed(_) => "verifier",
            BridgeError::ReservedClaimOverwrite(_) => "composer",
            BridgeError::SigningUnavailable(_) => "signer",
            BridgeError::KeySetUnavailable(_) => "publisher",
            BridgeError::MalformedInput(_) => "request",
        }
    }

    /// HTTP-style status class for the failure.
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::MalformedInput(_) => 400,
            BridgeError::TrustAnchorUnavailable(_)
            | BridgeError::SigningUnavailable(_)
            | BridgeError::KeySetUnavailable(_) => 500,
            _ => 401,
        }
    }

    /// Infrastructure failures that a bounded retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::TrustAnchorUnavailable(_)
                | BridgeError::SigningUnavailable(_)
                | BridgeError::KeySetUnavailable(_)
        )
    }

    /// Build the response body returned to the caller.
    ///
    /// Upstream failures get a generic description; the detail stays in logs.
    pub fn to_response(&self) -> ErrorResponse {
        let description = if self.status_code() >= 500 {
            "an upstream dependency is unavailable".to_string()
        } else {
            self.to_string()
        };

        ErrorResponse {
            error: self.kind().to_string(),
            error_description: Some(description),
        }
    }
}

/// Structured error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}
