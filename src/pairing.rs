use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{connect_known, Bridge};
use crate::config::{persist_bridge, Config, KnownBridge};
use crate::discover::{discover_bridges, FoundBridge};
use crate::error::{ApiError, DiscoveryError, PairingError};
use crate::hue_client::{HueApi, HueClient};
use crate::prompt::{AuthMethod, Decisions, MIN_USERNAME_LEN};
use crate::registry::Registry;

/// `devicetype` sent when creating a user, unique per install.
fn device_type() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("huesh#{}", &id[..8])
}

/// Obtain credentials for a discovered bridge, record them in the config
/// file and check they work.
pub async fn provision(
    found: &FoundBridge,
    decisions: &dyn Decisions,
    config_path: Option<&Path>,
    timeout: Duration,
) -> Result<Bridge, PairingError> {
    provision_with(found, decisions, config_path, |username| {
        let client = HueClient::new(&found.host, username, None, timeout)?;
        Ok(Arc::new(client) as Arc<dyn HueApi>)
    })
    .await
}

async fn provision_with<F>(
    found: &FoundBridge,
    decisions: &dyn Decisions,
    config_path: Option<&Path>,
    connect: F,
) -> Result<Bridge, PairingError>
where
    F: Fn(&str) -> Result<Arc<dyn HueApi>, ApiError>,
{
    let method = decisions.auth_method(found).ok_or(PairingError::Declined)?;
    let username = match method {
        AuthMethod::CreateUser => {
            if !decisions.confirm_link_button(&found.host) {
                return Err(PairingError::Declined);
            }
            let anonymous = connect("").map_err(PairingError::Client)?;
            let username = anonymous
                .create_user(&device_type())
                .await
                .map_err(PairingError::CreateUser)?;
            info!("Created user on {}", found.host);
            username
        }
        AuthMethod::Existing(username) => {
            if username.len() < MIN_USERNAME_LEN {
                return Err(PairingError::InvalidUsername {
                    min: MIN_USERNAME_LEN,
                });
            }
            username
        }
    };

    let known = KnownBridge {
        hostname: found.host.clone(),
        username: username.clone(),
        proxy: None,
    };
    if let Some(path) = config_path {
        match persist_bridge(path, known) {
            Ok(()) => info!("Saved {} to {}", found.host, path.display()),
            Err(e) => warn!("Could not save credentials for {}: {:#}", found.host, e),
        }
    }

    let api = connect(&username).map_err(PairingError::Client)?;
    api.get_capabilities().await.map_err(PairingError::Login)?;
    let info = match api.get_config().await {
        Ok(info) => info,
        Err(e) => {
            warn!("Could not read config from {}: {}", found.host, e);
            found.info.clone()
        }
    };
    info!("Logged in to {} ({})", info.name, found.host);
    Ok(Bridge::new(&found.host, &username, info, api))
}

/// Register every configured bridge that answers. With none, offer a scan
/// and provision whatever it finds. Returns the number of bridges registered.
pub async fn setup(
    config: &Config,
    config_path: Option<&Path>,
    decisions: &dyn Decisions,
    registry: &Registry,
    cancel: &CancellationToken,
) -> Result<usize, DiscoveryError> {
    let timeout = config.commands.timeout();
    let connected = connect_known(&config.bridges, timeout).await;
    if !connected.is_empty() {
        for bridge in connected {
            registry.add_bridge(bridge).await;
        }
        return Ok(registry.bridge_count().await);
    }

    if !config.bridges.is_empty() {
        warn!("None of the {} configured bridges answered", config.bridges.len());
    }
    if !decisions.confirm("No bridges available. Scan the local network?") {
        return Err(DiscoveryError::NoBridgesAvailable);
    }

    let found = discover_bridges(&config.discovery, decisions, cancel).await?;
    for bridge in &found {
        match provision(bridge, decisions, config_path, timeout).await {
            Ok(bridge) => {
                registry.add_bridge(bridge).await;
            }
            Err(e) => warn!("Skipping bridge at {}: {}", bridge.host, e),
        }
    }

    match registry.bridge_count().await {
        0 => Err(DiscoveryError::NoBridgesAvailable),
        n => Ok(n),
    }
}
