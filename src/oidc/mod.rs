//! Inbound side: trusted OIDC issuers and verification of their tokens.
//!
//! The resolver fetches each issuer's discovery document and key set (over a
//! fingerprint-pinned TLS client when configured) and caches the resulting
//! trust anchor. The verifier checks tokens against it.

pub mod config;
pub mod jwks;
pub mod pinning;
pub mod resolver;
pub mod validator;

pub use config::{TrustAnchorConfig, TrustedIssuerConfig};
pub use jwks::{Jwk, JwkSet, TrustAnchor};
pub use resolver::TrustAnchorResolver;
pub use validator::{peek_issuer, verify_token, Audience, TokenVerifier, VerifiedClaims, VerifyPolicy};
