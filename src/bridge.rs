use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::config::KnownBridge;
use crate::error::ApiError;
use crate::hue_client::{HueApi, HueClient};
use crate::model::BridgeInfo;

/// One authenticated bridge. Owned by the registry; entities hold an `Arc`
/// back to it only to issue calls.
pub struct Bridge {
    pub host: String,
    pub username: String,
    pub proxy: Option<String>,
    pub info: BridgeInfo,
    api: Arc<dyn HueApi>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("host", &self.host)
            .field("id", &self.info.bridgeid)
            .field("name", &self.info.name)
            .finish()
    }
}

impl Bridge {
    pub fn new(host: &str, username: &str, info: BridgeInfo, api: Arc<dyn HueApi>) -> Self {
        Self {
            host: host.to_string(),
            username: username.to_string(),
            proxy: None,
            info,
            api,
        }
    }

    /// Build a client for a configured bridge and fetch its config.
    pub async fn connect(known: &KnownBridge, timeout: Duration) -> Result<Self, ApiError> {
        let client = HueClient::new(
            &known.hostname,
            &known.username,
            known.proxy.as_deref(),
            timeout,
        )?;
        let info = client.get_config().await?;
        let mut bridge = Bridge::new(&known.hostname, &known.username, info, Arc::new(client));
        bridge.proxy = known.proxy.clone();
        Ok(bridge)
    }

    /// Registry key: the bridge id, or the host for bridges that do not report one.
    pub fn id(&self) -> &str {
        if self.info.bridgeid.is_empty() {
            &self.host
        } else {
            &self.info.bridgeid
        }
    }

    pub fn api(&self) -> &dyn HueApi {
        self.api.as_ref()
    }

    /// Matches `use <bridge>` arguments: id, host, or name.
    pub fn matches(&self, token: &str) -> bool {
        self.id().eq_ignore_ascii_case(token)
            || self.host == token
            || (!self.info.name.is_empty() && self.info.name == token)
    }
}

/// Connect to every configured bridge concurrently. Bridges that fail are
/// logged and skipped.
pub async fn connect_known(known: &[KnownBridge], timeout: Duration) -> Vec<Bridge> {
    let attempts = known.iter().map(|k| async move {
        let result = Bridge::connect(k, timeout).await;
        (k, result)
    });

    let mut bridges = Vec::new();
    for (k, result) in join_all(attempts).await {
        match result {
            Ok(bridge) => {
                info!(
                    "Connected to bridge {} ({}) at {}",
                    bridge.info.name,
                    bridge.id(),
                    k.hostname
                );
                bridges.push(bridge);
            }
            Err(e) => warn!("Failed to connect to bridge {}: {}", k.hostname, e),
        }
    }
    bridges
}
