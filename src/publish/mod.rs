//! Publication of the bridge's own verification material.

pub mod config;
pub mod publisher;

pub use config::KeySetConfig;
pub use publisher::{jwk_from_key_info, DiscoveryDocument, KeySetPublisher, JWKS_PATH};
