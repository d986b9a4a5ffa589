//! Trust anchor resolution: discovery metadata and key sets of trusted issuers.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::{TrustAnchorConfig, TrustedIssuerConfig};
use super::jwks::{JwkSet, TrustAnchor};
use super::pinning::{build_client, is_fingerprint_rejection};
use crate::cache::{Entry, RefreshCache};
use crate::error::{BridgeError, Result};
use crate::retry::RetryConfig;

/// The subset of OpenID provider metadata the bridge relies on.
#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

/// HTTP client for one configured issuer.
#[derive(Clone)]
struct IssuerSource {
    client: reqwest::Client,
    pinned: bool,
}

/// Fetches and caches trust anchors, one per configured issuer URL.
pub struct TrustAnchorResolver {
    sources: HashMap<String, IssuerSource>,
    cache: RefreshCache<String, Arc<TrustAnchor>>,
    retry: RetryConfig,
    min_refresh: Duration,
}

impl TrustAnchorResolver {
    /// Build a resolver for the given issuers. Pinned issuers get a client
    /// that enforces their fingerprints.
    pub fn new(issuers: &[TrustedIssuerConfig], config: &TrustAnchorConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.fetch_timeout_ms);
        // Discovery then key set, each with its own retries.
        let refresh_timeout = config.retry.budget(timeout, 2);

        let mut sources = HashMap::new();
        for issuer in issuers {
            let pins = issuer.pins();
            let client = build_client(&pins, timeout).map_err(BridgeError::TrustAnchorUnavailable)?;
            sources.insert(
                issuer.issuer_url.clone(),
                IssuerSource {
                    client,
                    pinned: !pins.is_empty(),
                },
            );
        }

        Ok(Self {
            sources,
            cache: RefreshCache::new(
                "trust_anchor",
                Duration::from_secs(config.ttl_secs),
                refresh_timeout,
                BridgeError::TrustAnchorUnavailable,
            ),
            retry: config.retry.clone(),
            min_refresh: Duration::from_secs(config.min_refresh_secs),
        })
    }

    /// Current trust anchor for `issuer_url`, fetched on first use or expiry.
    pub async fn resolve(&self, issuer_url: &str) -> Result<Entry<Arc<TrustAnchor>>> {
        let source = self.source(issuer_url)?;
        let key = issuer_url.to_string();
        let url = key.clone();
        let retry = self.retry.clone();
        self.cache
            .get_or_fetch(&key, move || fetch_anchor(source, url, retry))
            .await
    }

    /// Refetch the anchor after a token referenced a key id that the anchor
    /// of `stale_generation` does not contain.
    ///
    /// Concurrent misses against the same generation share one fetch, and an
    /// anchor younger than `min_refresh_secs` is returned as is.
    pub async fn refresh_for_unknown_key(
        &self,
        issuer_url: &str,
        stale_generation: u64,
    ) -> Result<Entry<Arc<TrustAnchor>>> {
        let source = self.source(issuer_url)?;
        let key = issuer_url.to_string();
        let url = key.clone();
        let retry = self.retry.clone();
        self.cache
            .refetch(&key, stale_generation, self.min_refresh, move || {
                fetch_anchor(source, url, retry)
            })
            .await
    }

    fn source(&self, issuer_url: &str) -> Result<IssuerSource> {
        self.sources.get(issuer_url).cloned().ok_or_else(|| {
            BridgeError::UntrustedIssuer(format!("issuer '{}' is not configured", issuer_url))
        })
    }
}

async fn fetch_anchor(
    source: IssuerSource,
    issuer_url: String,
    retry: RetryConfig,
) -> Result<Arc<TrustAnchor>> {
    let discovery_url = format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    );

    debug!(issuer = %issuer_url, pinned = source.pinned, "Fetching OIDC discovery document");
    let metadata: ProviderMetadata = retry
        .run("oidc_discovery", BridgeError::is_transient, || {
            get_json(&source.client, &discovery_url)
        })
        .await?;

    if metadata.issuer != issuer_url {
        warn!(
            configured = %issuer_url,
            discovered = %metadata.issuer,
            "Discovery document names a different issuer"
        );
        return Err(BridgeError::UntrustedIssuer(format!(
            "discovery document at {} names issuer '{}'",
            discovery_url, metadata.issuer
        )));
    }

    let jwks: JwkSet = retry
        .run("oidc_jwks", BridgeError::is_transient, || {
            get_json(&source.client, &metadata.jwks_uri)
        })
        .await?;

    let anchor = TrustAnchor::from_jwk_set(&issuer_url, &metadata.jwks_uri, &jwks).map_err(|e| {
        BridgeError::TrustAnchorUnavailable(format!("{}: {}", metadata.jwks_uri, e))
    })?;

    info!(
        issuer = %issuer_url,
        jwks_uri = %metadata.jwks_uri,
        keys = anchor.key_count(),
        "Trust anchor refreshed"
    );

    Ok(Arc::new(anchor))
}

async fn get_json<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> Result<T> {
    let response = client.get(url).send().await.map_err(|e| {
        if is_fingerprint_rejection(&e) {
            BridgeError::UntrustedIssuer(format!("{}: certificate fingerprint mismatch", url))
        } else {
            BridgeError::TrustAnchorUnavailable(format!("{}: {}", url, e))
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(BridgeError::TrustAnchorUnavailable(format!(
            "{} returned HTTP {}",
            url, status
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| BridgeError::TrustAnchorUnavailable(format!("malformed response from {}: {}", url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::jwks::tests::upstream_jwk;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TLS_CERT: &[u8] = include_bytes!("../../testdata/tls_server_cert.der");
    const TLS_KEY: &[u8] = include_bytes!("../../testdata/tls_server_key.der");

    /// HTTPS endpoint on localhost presenting `tls_server_cert.der`.
    /// It only completes handshakes.
    fn tls_endpoint() -> String {
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(TLS_CERT.to_vec())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(TLS_KEY.to_vec())),
            )
            .unwrap();
        let config = Arc::new(config);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut tcp) = stream else { continue };
                if let Ok(mut conn) = rustls::ServerConnection::new(Arc::clone(&config)) {
                    let _ = conn.complete_io(&mut tcp);
                }
            }
        });
        format!("https://127.0.0.1:{}", port)
    }

    fn pinned_issuer(url: &str, fingerprint: &str) -> TrustedIssuerConfig {
        TrustedIssuerConfig {
            name: "pinned".to_string(),
            issuer_url: url.to_string(),
            audiences: vec!["bridge".to_string()],
            fingerprints: vec![fingerprint.to_string()],
            outbound_audience: vec![],
        }
    }

    fn issuer_for(server: &MockServer) -> TrustedIssuerConfig {
        TrustedIssuerConfig {
            name: "mock".to_string(),
            issuer_url: server.uri(),
            audiences: vec!["bridge".to_string()],
            fingerprints: vec![],
            outbound_audience: vec![],
        }
    }

    fn anchor_config(min_refresh_secs: u64) -> TrustAnchorConfig {
        TrustAnchorConfig {
            ttl_secs: 300,
            min_refresh_secs,
            fetch_timeout_ms: 2000,
            retry: RetryConfig {
                max_retries: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                use_jitter: false,
            },
        }
    }

    async fn mount_discovery(server: &MockServer, issuer: &str, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "jwks_uri": format!("{}/jwks", server.uri()),
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_resolves_fetch_once() {
        let server = MockServer::start().await;
        mount_discovery(&server, &server.uri(), 1).await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "keys": [upstream_jwk("k1")] }))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = Arc::new(
            TrustAnchorResolver::new(&[issuer_for(&server)], &anchor_config(10)).unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let resolver = Arc::clone(&resolver);
            let issuer = server.uri();
            handles.push(tokio::spawn(async move { resolver.resolve(&issuer).await }));
        }
        for handle in handles {
            let entry = handle.await.unwrap().unwrap();
            assert!(entry.value.key(Some("k1")).is_some());
            assert_eq!(entry.value.issuer, server.uri());
        }
    }

    #[tokio::test]
    async fn test_unknown_key_refresh_picks_up_rotation() {
        let server = MockServer::start().await;
        mount_discovery(&server, &server.uri(), 2).await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [upstream_jwk("old")] })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [upstream_jwk("new")] })))
            .mount(&server)
            .await;

        let resolver = TrustAnchorResolver::new(&[issuer_for(&server)], &anchor_config(0)).unwrap();
        let first = resolver.resolve(&server.uri()).await.unwrap();
        assert!(first.value.key(Some("new")).is_none());

        let refreshed = resolver
            .refresh_for_unknown_key(&server.uri(), first.generation)
            .await
            .unwrap();
        assert!(refreshed.value.key(Some("new")).is_some());

        // Same stale generation again: served from cache.
        let again = resolver
            .refresh_for_unknown_key(&server.uri(), first.generation)
            .await
            .unwrap();
        assert_eq!(again.generation, refreshed.generation);
    }

    #[tokio::test]
    async fn test_forced_refresh_bounded_by_min_interval() {
        let server = MockServer::start().await;
        mount_discovery(&server, &server.uri(), 1).await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [upstream_jwk("k1")] })))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = TrustAnchorResolver::new(&[issuer_for(&server)], &anchor_config(60)).unwrap();
        let first = resolver.resolve(&server.uri()).await.unwrap();
        let second = resolver
            .refresh_for_unknown_key(&server.uri(), first.generation)
            .await
            .unwrap();
        assert_eq!(second.generation, first.generation);
    }

    #[tokio::test]
    async fn test_discovery_issuer_mismatch_is_untrusted() {
        let server = MockServer::start().await;
        mount_discovery(&server, "https://impostor.example", 1).await;

        let resolver = TrustAnchorResolver::new(&[issuer_for(&server)], &anchor_config(10)).unwrap();
        let err = resolver.resolve(&server.uri()).await.unwrap_err();
        assert!(matches!(err, BridgeError::UntrustedIssuer(_)));
    }

    #[tokio::test]
    async fn test_key_set_failure_is_unavailable_after_retries() {
        let server = MockServer::start().await;
        mount_discovery(&server, &server.uri(), 1).await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let resolver = TrustAnchorResolver::new(&[issuer_for(&server)], &anchor_config(10)).unwrap();
        let err = resolver.resolve(&server.uri()).await.unwrap_err();
        assert!(matches!(err, BridgeError::TrustAnchorUnavailable(ref r) if r.contains("503")));
    }

    #[tokio::test]
    async fn test_hung_request_is_retried_within_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_discovery(&server, &server.uri(), 1).await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [upstream_jwk("k1")] })))
            .expect(1)
            .mount(&server)
            .await;

        let config = TrustAnchorConfig {
            fetch_timeout_ms: 300,
            retry: RetryConfig {
                max_retries: 2,
                ..anchor_config(10).retry
            },
            ..anchor_config(10)
        };
        let resolver = TrustAnchorResolver::new(&[issuer_for(&server)], &config).unwrap();
        let entry = resolver.resolve(&server.uri()).await.unwrap();
        assert!(entry.value.key(Some("k1")).is_some());
    }

    #[tokio::test]
    async fn test_slow_issuer_within_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "issuer": server.uri(),
                        "jwks_uri": format!("{}/jwks", server.uri()),
                    }))
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "keys": [upstream_jwk("k1")] }))
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;

        let config = TrustAnchorConfig {
            fetch_timeout_ms: 600,
            ..anchor_config(10)
        };
        let resolver = TrustAnchorResolver::new(&[issuer_for(&server)], &config).unwrap();
        let entry = resolver.resolve(&server.uri()).await.unwrap();
        assert_eq!(entry.value.key_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_set() {
        let server = MockServer::start().await;
        mount_discovery(&server, &server.uri(), 1).await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [] })))
            .mount(&server)
            .await;

        let resolver = TrustAnchorResolver::new(&[issuer_for(&server)], &anchor_config(10)).unwrap();
        let err = resolver.resolve(&server.uri()).await.unwrap_err();
        assert!(matches!(err, BridgeError::TrustAnchorUnavailable(_)));
    }

    #[tokio::test]
    async fn test_pin_mismatch_in_handshake_is_untrusted() {
        let url = tls_endpoint();
        // Fingerprint of a different certificate.
        let issuer = pinned_issuer(&url, "BB:8F:81:A4:7D:0B:25:5F:9E:E9:D7:A7:D4:E5:0A:B0:67:7D:43:B0");
        let client = build_client(&issuer.pins(), Duration::from_secs(5)).unwrap();

        let err = get_json::<serde_json::Value>(&client, &format!("{}/.well-known/openid-configuration", url))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UntrustedIssuer(ref r) if r.contains("fingerprint")));
        assert!(!err.is_transient());

        let resolver = TrustAnchorResolver::new(&[issuer], &anchor_config(10)).unwrap();
        let err = resolver.resolve(&url).await.unwrap_err();
        assert!(matches!(err, BridgeError::UntrustedIssuer(_)));
    }

    #[tokio::test]
    async fn test_matching_pin_still_requires_trusted_chain() {
        let url = tls_endpoint();
        let issuer = pinned_issuer(&url, &hex::encode(Sha256::digest(TLS_CERT)));
        let client = build_client(&issuer.pins(), Duration::from_secs(5)).unwrap();

        // Self-signed: the pin matches but WebPKI validation rejects it.
        let err = get_json::<serde_json::Value>(&client, &format!("{}/.well-known/openid-configuration", url))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TrustAnchorUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_issuer() {
        let resolver = TrustAnchorResolver::new(&[], &anchor_config(10)).unwrap();
        let err = resolver.resolve("https://elsewhere.example").await.unwrap_err();
        assert!(matches!(err, BridgeError::UntrustedIssuer(_)));
    }
}
