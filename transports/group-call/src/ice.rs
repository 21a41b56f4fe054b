//! ICE server (STUN/TURN) credential sourcing
//!
//! The provider fetches credentials once per process and caches them. When the
//! credential source fails, callers receive a single fallback STUN entry, so an
//! [`IceServerSet`] is never empty.

use crate::config::IceConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// One STUN/TURN server entry as returned by the credential endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs; the endpoint may send a single string or a list
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,

    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Create a credential-less STUN entry
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

/// Non-empty list of ICE servers handed to every peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerSet {
    servers: Vec<IceServer>,
    fallback: bool,
}

impl IceServerSet {
    /// Wrap a fetched server list, rejecting empty lists
    pub fn new(servers: Vec<IceServer>) -> Option<Self> {
        let servers: Vec<IceServer> = servers
            .into_iter()
            .filter(|server| !server.urls.is_empty())
            .collect();

        if servers.is_empty() {
            None
        } else {
            Some(Self {
                servers,
                fallback: false,
            })
        }
    }

    /// Singleton STUN set used when credentials are unavailable
    pub fn fallback(stun_url: &str) -> Self {
        Self {
            servers: vec![IceServer::stun(stun_url)],
            fallback: true,
        }
    }

    /// Server entries
    pub fn servers(&self) -> &[IceServer] {
        &self.servers
    }

    /// Whether this set is the fallback entry
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Convert to webrtc-rs ICE server configuration
    pub fn to_rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.servers
            .iter()
            .map(|server| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                }
            })
            .collect()
    }
}

/// Source of raw ICE server entries
#[async_trait]
pub trait IceCredentialSource: Send + Sync {
    /// Fetch the current server list
    async fn fetch_servers(&self) -> Result<Vec<IceServer>>;
}

/// Fetches credentials from a REST endpoint
pub struct HttpIceCredentialSource {
    url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpIceCredentialSource {
    /// Create a new HTTP credential source
    ///
    /// # Arguments
    ///
    /// * `url` - Endpoint returning `[{urls, username?, credential?}]`
    /// * `auth_token` - Optional bearer token
    /// * `timeout` - Request timeout
    pub fn new(url: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            auth_token,
            client,
        })
    }
}

#[async_trait]
impl IceCredentialSource for HttpIceCredentialSource {
    async fn fetch_servers(&self) -> Result<Vec<IceServer>> {
        debug!("Fetching ICE servers from {}", self.url);

        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::IceServerFetchFailed(format!("Request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::IceServerFetchFailed(format!("Bad status: {}", e)))?;

        response
            .json::<Vec<IceServer>>()
            .await
            .map_err(|e| Error::IceServerFetchFailed(format!("Invalid body: {}", e)))
    }
}

/// Serves servers listed in configuration
pub struct StaticIceCredentialSource {
    servers: Vec<IceServer>,
}

impl StaticIceCredentialSource {
    /// Create a source from an explicit server list
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }

    /// Build from static STUN/TURN configuration
    pub fn from_config(config: &IceConfig) -> Self {
        let servers = config
            .stun_servers
            .iter()
            .map(|url| IceServer::stun(url))
            .chain(config.turn_servers.iter().map(|turn| IceServer {
                urls: vec![turn.url.clone()],
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            }))
            .collect();

        Self { servers }
    }
}

#[async_trait]
impl IceCredentialSource for StaticIceCredentialSource {
    async fn fetch_servers(&self) -> Result<Vec<IceServer>> {
        Ok(self.servers.clone())
    }
}

/// Cached, never-failing ICE server provider
pub struct IceServerProvider {
    source: Arc<dyn IceCredentialSource>,
    fallback_stun_url: String,
    cache: Mutex<Option<IceServerSet>>,
}

impl IceServerProvider {
    /// Create a provider over an arbitrary credential source
    pub fn new(source: Arc<dyn IceCredentialSource>, fallback_stun_url: &str) -> Self {
        Self {
            source,
            fallback_stun_url: fallback_stun_url.to_string(),
            cache: Mutex::new(None),
        }
    }

    /// Build a provider from configuration
    ///
    /// Uses the HTTP endpoint when configured, otherwise the static lists.
    /// Without either, the fallback STUN entry is served as a regular result.
    pub fn from_config(config: &IceConfig) -> Result<Self> {
        let source: Arc<dyn IceCredentialSource> = match &config.endpoint_url {
            Some(url) => Arc::new(HttpIceCredentialSource::new(
                url,
                config.auth_token.clone(),
                Duration::from_millis(config.fetch_timeout_ms),
            )?),
            None if config.stun_servers.is_empty() && config.turn_servers.is_empty() => {
                Arc::new(StaticIceCredentialSource::new(vec![IceServer::stun(
                    &config.fallback_stun_url,
                )]))
            }
            None => Arc::new(StaticIceCredentialSource::from_config(config)),
        };

        Ok(Self::new(source, &config.fallback_stun_url))
    }

    /// Fetch the ICE server set
    ///
    /// A successful fetch is cached for the lifetime of the provider. A failed
    /// fetch returns the fallback STUN entry and is retried on the next call.
    pub async fn fetch(&self) -> IceServerSet {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            return cached.clone();
        }

        let fetched = self.source.fetch_servers().await.and_then(|servers| {
            IceServerSet::new(servers).ok_or_else(|| {
                Error::IceServerFetchFailed("credential endpoint returned no servers".to_string())
            })
        });

        match fetched {
            Ok(set) => {
                info!("Fetched {} ICE server entries", set.servers().len());
                *cache = Some(set.clone());
                set
            }
            Err(e) => {
                warn!("{}; using fallback {}", e, self.fallback_stun_url);
                IceServerSet::fallback(&self.fallback_stun_url)
            }
        }
    }
}
