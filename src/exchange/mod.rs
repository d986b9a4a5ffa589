//! Token exchange: verified inbound token in, token signed by the bridge out.
//!
//! - `claims`: outbound claim composition under the reserved-claim policy
//! - `issuer`: compact JWS serialization through a [`crate::signer::Signer`]
//! - `handler`: request parsing and the exchange orchestrator

pub mod claims;
pub mod config;
pub mod handler;
pub mod issuer;

pub use claims::{compose, ComposeContext, OutboundClaims, RESERVED_CLAIMS};
pub use config::ExchangeConfig;
pub use handler::{
    parse_exchange_request, ExchangeRequest, ExchangeResponse, ExchangeService, ExchangeStage,
    ISSUED_TOKEN_TYPE_JWT,
};
pub use issuer::{IssuedToken, TokenIssuer};
