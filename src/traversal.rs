//! Traversal server resolution.
//!
//! Builds the ordered list of network traversal servers for one connection
//! attempt. STUN discovery entries are always present; the relay portion
//! cascades dynamic credential issuance → static operator configuration →
//! well-known public fallback. [`TraversalResolver::resolve`] never fails:
//! every tier that cannot be used is logged and skipped, and the list is
//! immutable once handed to the transport.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Public STUN entries prepended to every resolved list. Discovery only,
/// no relaying.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Public relay entries used when no dynamic or static relay is available.
/// Intended for non-production use; reliability degrades on restrictive
/// networks.
const FALLBACK_RELAY_URLS: [&str; 2] = [
    "turn:openrelay.metered.ca:80",
    "turn:openrelay.metered.ca:443",
];
const FALLBACK_RELAY_USERNAME: &str = "openrelayproject";
const FALLBACK_RELAY_CREDENTIAL: &str = "openrelayproject";

/// Which cascade tier produced an entry. Diagnostics and ordering only;
/// behavior never branches on this after the list is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraversalTier {
    StunDefault,
    DynamicRelay,
    StaticRelay,
    FallbackPublicRelay,
}

/// One entry in the server list handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub tier: TraversalTier,
}

impl TraversalServerConfig {
    fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
            tier: TraversalTier::StunDefault,
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// Enables dynamic credential issuance (tier 2).
    pub dynamic_enabled: bool,
    /// Credential-issuing endpoint, POSTed for short-lived relay credentials.
    pub credential_endpoint: Option<String>,
    /// Desired credential lifetime passed to the endpoint.
    pub desired_ttl_secs: Option<u64>,
    /// Upper bound on the issuance fetch.
    pub fetch_timeout: Duration,
    /// Operator-supplied static relay servers (tier 3).
    pub static_relay_urls: Vec<String>,
    pub static_username: Option<String>,
    pub static_credential: Option<String>,
    /// Marks a production deployment: reaching the public fallback tier is
    /// logged as a warning because call reliability will degrade on
    /// restrictive networks.
    pub production: bool,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            dynamic_enabled: false,
            credential_endpoint: None,
            desired_ttl_secs: None,
            fetch_timeout: Duration::from_secs(5),
            static_relay_urls: Vec::new(),
            static_username: None,
            static_credential: None,
            production: false,
        }
    }
}

/// Errors internal to the cascade. Never escape `resolve()`.
#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("credential endpoint request failed: {0}")]
    Http(String),

    #[error("credential endpoint timed out")]
    Timeout,

    #[error("credential response had an unusable shape: {0}")]
    InvalidResponse(String),
}

/// Fetches short-lived relay credentials from the issuing endpoint.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    /// POST to the endpoint; returns the raw response body.
    async fn fetch(
        &self,
        endpoint: &str,
        desired_ttl_secs: Option<u64>,
    ) -> Result<String, TraversalError>;
}

/// HTTP fetcher backed by `ureq`. Since `ureq` is blocking, requests are
/// wrapped in `tokio::task::spawn_blocking`.
#[derive(Debug, Clone, Default)]
pub struct HttpCredentialFetcher;

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn fetch(
        &self,
        endpoint: &str,
        desired_ttl_secs: Option<u64>,
    ) -> Result<String, TraversalError> {
        let endpoint = endpoint.to_string();
        let body = match desired_ttl_secs {
            Some(ttl) => format!("{{\"ttl\":{ttl}}}"),
            None => "{}".to_string(),
        };

        tokio::task::spawn_blocking(move || {
            let response = ureq::post(&endpoint)
                .header("content-type", "application/json")
                .send(body.as_bytes())
                .map_err(|e| TraversalError::Http(e.to_string()))?;

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(TraversalError::Http(format!("status {status}")));
            }

            response
                .into_body()
                .read_to_string()
                .map_err(|e| TraversalError::Http(e.to_string()))
        })
        .await
        .map_err(|e| TraversalError::Http(e.to_string()))?
    }
}

/// The issuance response arrives as either a single object or an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IssuedCredentials {
    One(IssuedEntry),
    Many(Vec<IssuedEntry>),
}

impl IssuedCredentials {
    fn into_vec(self) -> Vec<IssuedEntry> {
        match self {
            Self::One(entry) => vec![entry],
            Self::Many(entries) => entries,
        }
    }
}

/// The URL list itself may be a single string or an array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl UrlList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(url) => vec![url],
            Self::Many(urls) => urls,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssuedEntry {
    #[serde(default, alias = "url")]
    urls: Option<UrlList>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default, alias = "secret", alias = "password")]
    credential: Option<String>,
}

impl IssuedEntry {
    /// An entry missing a URL, username, or secret is invalid and excluded
    /// from the dynamic tier's success condition.
    fn into_config(self) -> Option<TraversalServerConfig> {
        let urls: Vec<String> = self
            .urls?
            .into_vec()
            .into_iter()
            .filter(|u| !u.trim().is_empty())
            .collect();
        if urls.is_empty() {
            return None;
        }
        let username = self.username.filter(|u| !u.is_empty())?;
        let credential = self.credential.filter(|c| !c.is_empty())?;
        Some(TraversalServerConfig {
            urls,
            username: Some(username),
            credential: Some(credential),
            tier: TraversalTier::DynamicRelay,
        })
    }
}

fn parse_issued(body: &str) -> Result<Vec<TraversalServerConfig>, TraversalError> {
    let issued: IssuedCredentials = serde_json::from_str(body)
        .map_err(|e| TraversalError::InvalidResponse(e.to_string()))?;
    let configs: Vec<TraversalServerConfig> = issued
        .into_vec()
        .into_iter()
        .filter_map(IssuedEntry::into_config)
        .collect();
    if configs.is_empty() {
        return Err(TraversalError::InvalidResponse(
            "no usable entries".to_string(),
        ));
    }
    Ok(configs)
}

/// Resolves the ordered traversal server list for a connection attempt.
pub struct TraversalResolver {
    config: TraversalConfig,
    fetcher: Arc<dyn CredentialFetcher>,
}

impl TraversalResolver {
    pub fn new(config: TraversalConfig, fetcher: Arc<dyn CredentialFetcher>) -> Self {
        Self { config, fetcher }
    }

    /// Resolver with the default HTTP fetcher.
    pub fn with_http(config: TraversalConfig) -> Self {
        Self::new(config, Arc::new(HttpCredentialFetcher))
    }

    /// Build the server list. Never fails: the result always contains at
    /// least the default STUN tier, and exactly one relay tier on top of it.
    pub async fn resolve(&self) -> Vec<TraversalServerConfig> {
        let mut servers: Vec<TraversalServerConfig> = DEFAULT_STUN_SERVERS
            .iter()
            .map(|url| TraversalServerConfig::stun(url))
            .collect();

        if let Some(dynamic) = self.resolve_dynamic().await {
            servers.extend(dynamic);
            return servers;
        }

        if !self.config.static_relay_urls.is_empty() {
            debug!(target: "Calls/Traversal", "Using statically configured relay servers");
            servers.push(TraversalServerConfig {
                urls: self.config.static_relay_urls.clone(),
                username: self.config.static_username.clone(),
                credential: self.config.static_credential.clone(),
                tier: TraversalTier::StaticRelay,
            });
            return servers;
        }

        if self.config.production {
            warn!(
                target: "Calls/Traversal",
                "No relay credentials available, falling back to public relays; call reliability will degrade on restrictive networks"
            );
        } else {
            debug!(target: "Calls/Traversal", "Using public fallback relays");
        }
        servers.push(TraversalServerConfig {
            urls: FALLBACK_RELAY_URLS.iter().map(|u| u.to_string()).collect(),
            username: Some(FALLBACK_RELAY_USERNAME.to_string()),
            credential: Some(FALLBACK_RELAY_CREDENTIAL.to_string()),
            tier: TraversalTier::FallbackPublicRelay,
        });
        servers
    }

    async fn resolve_dynamic(&self) -> Option<Vec<TraversalServerConfig>> {
        if !self.config.dynamic_enabled {
            return None;
        }
        let endpoint = match &self.config.credential_endpoint {
            Some(endpoint) => endpoint,
            None => {
                warn!(
                    target: "Calls/Traversal",
                    "Dynamic relay issuance enabled but no endpoint configured"
                );
                return None;
            }
        };

        let fetch = self.fetcher.fetch(endpoint, self.config.desired_ttl_secs);
        let body = match timeout(self.config.fetch_timeout, fetch).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                warn!(target: "Calls/Traversal", "Credential issuance failed: {e}");
                return None;
            }
            Err(_) => {
                warn!(
                    target: "Calls/Traversal",
                    "Credential issuance timed out after {:?}", self.config.fetch_timeout
                );
                return None;
            }
        };

        match parse_issued(&body) {
            Ok(configs) => {
                debug!(
                    target: "Calls/Traversal",
                    "Issued {} dynamic relay entr{}",
                    configs.len(),
                    if configs.len() == 1 { "y" } else { "ies" }
                );
                Some(configs)
            }
            Err(e) => {
                warn!(target: "Calls/Traversal", "Credential response unusable: {e}");
                None
            }
        }
    }
}
