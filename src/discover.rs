use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pnet::ipnetwork::{IpNetwork, Ipv4Network};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::BridgeInfo;
use crate::prompt::Decisions;

/// Substring every Hue bridge puts in its unauthenticated `/api/config`.
pub const BRIDGE_MARKER: &str = "Philips hue";
const BRIDGE_ID_FIELD: &str = "bridgeid";

/// The parts of a network interface discovery cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct NetInterface {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub point_to_point: bool,
    pub mac: Option<[u8; 6]>,
    pub networks: Vec<IpNetwork>,
}

impl From<&pnet::datalink::NetworkInterface> for NetInterface {
    fn from(iface: &pnet::datalink::NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            up: iface.is_up(),
            loopback: iface.is_loopback(),
            point_to_point: iface.is_point_to_point(),
            mac: iface.mac.map(|m| m.octets()),
            networks: iface.ips.clone(),
        }
    }
}

impl NetInterface {
    pub fn describe(&self) -> String {
        let addrs: Vec<String> = self.networks.iter().map(|n| n.to_string()).collect();
        format!("{} [{}]", self.name, addrs.join(", "))
    }
}

pub fn system_interfaces() -> Vec<NetInterface> {
    pnet::datalink::interfaces().iter().map(NetInterface::from).collect()
}

/// Private, loopback or link-local.
pub fn is_lan_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Interfaces worth scanning: up, not loopback or point-to-point, with a
/// hardware address, and no public addresses.
pub fn candidate_interfaces(all: Vec<NetInterface>) -> Vec<NetInterface> {
    all.into_iter()
        .filter(|i| {
            let keep = i.up
                && !i.loopback
                && !i.point_to_point
                && i.mac.is_some_and(|m| m != [0; 6])
                && !i.networks.is_empty()
                && i.networks.iter().all(|n| is_lan_address(n.ip()));
            if !keep {
                trace!("Skipping interface {}", i.name);
            }
            keep
        })
        .collect()
}

/// Every IPv4 host address on the interface's networks, excluding network,
/// broadcast and the interface's own address. Networks wider than
/// `/min_prefix` are narrowed to the `/min_prefix` around the interface.
pub fn host_addresses(iface: &NetInterface, min_prefix: u8) -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    for network in &iface.networks {
        let IpNetwork::V4(net) = network else {
            continue;
        };
        let net = if net.prefix() < min_prefix {
            match Ipv4Network::new(net.ip(), min_prefix) {
                Ok(narrowed) => {
                    debug!("Narrowing {} to {}", net, narrowed);
                    narrowed
                }
                Err(_) => continue,
            }
        } else {
            *net
        };
        if net.prefix() > 30 {
            continue;
        }
        let (first, last) = (net.network(), net.broadcast());
        out.extend(
            net.iter()
                .filter(|a| *a != first && *a != last && *a != net.ip()),
        );
    }
    out
}

/// A bridge that answered a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct FoundBridge {
    /// `ip` or `ip:port` when probed on a non-standard port.
    pub host: String,
    pub info: BridgeInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Found(FoundBridge),
    NotABridge,
    Unreachable,
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, addr: Ipv4Addr) -> ProbeOutcome;
}

pub fn looks_like_bridge(body: &str) -> bool {
    body.contains(BRIDGE_MARKER) && body.contains(BRIDGE_ID_FIELD)
}

/// TCP dial, then `GET /api/config`.
pub struct HttpProbe {
    http: reqwest::Client,
    port: u16,
    dial_timeout: Duration,
}

impl HttpProbe {
    pub fn new(settings: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout())
            .build()?;
        Ok(Self {
            http,
            port: settings.port,
            dial_timeout: settings.dial_timeout(),
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, addr: Ipv4Addr) -> ProbeOutcome {
        let socket = SocketAddr::from((addr, self.port));
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(socket)).await {
            Ok(Ok(_)) => {}
            _ => return ProbeOutcome::Unreachable,
        }

        let url = format!("http://{}/api/config", socket);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                trace!("{}: {}", url, e);
                return ProbeOutcome::Unreachable;
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            return ProbeOutcome::NotABridge;
        }
        let body = match response.text().await {
            Ok(body) => body,
            Err(_) => return ProbeOutcome::NotABridge,
        };
        if !looks_like_bridge(&body) {
            return ProbeOutcome::NotABridge;
        }

        let info: BridgeInfo = serde_json::from_str(&body).unwrap_or_default();
        let host = if self.port == 80 {
            addr.to_string()
        } else {
            socket.to_string()
        };
        ProbeOutcome::Found(FoundBridge { host, info })
    }
}

#[derive(Debug)]
pub enum ScanEvent {
    /// Sent once, before the first probe is dispatched.
    Started { addresses: usize },
    Probed { addr: Ipv4Addr, outcome: ProbeOutcome },
}

async fn feed(
    addresses: Vec<Ipv4Addr>,
    probe: Arc<dyn Probe>,
    max_in_flight: usize,
    tx: mpsc::Sender<ScanEvent>,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));
    if tx
        .send(ScanEvent::Started {
            addresses: addresses.len(),
        })
        .await
        .is_err()
    {
        return;
    }

    for addr in addresses {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        let probe = probe.clone();
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = probe.probe(addr) => outcome,
            };
            let _ = tx.send(ScanEvent::Probed { addr, outcome }).await;
        });
    }
}

/// Probe `addresses` with at most `max_in_flight` outstanding probes.
/// The first bridge found cancels everything else.
pub async fn scan(
    addresses: Vec<Ipv4Addr>,
    probe: Arc<dyn Probe>,
    max_in_flight: usize,
    cancel: &CancellationToken,
) -> Result<FoundBridge, DiscoveryError> {
    let scan_cancel = cancel.child_token();
    let (tx, mut rx) = mpsc::channel(max_in_flight.max(1) * 2);
    let feeder = tokio::spawn(feed(
        addresses,
        probe,
        max_in_flight,
        tx,
        scan_cancel.clone(),
    ));

    let mut started = false;
    let mut probed = 0usize;
    let mut found = None;
    while let Some(event) = rx.recv().await {
        match event {
            ScanEvent::Started { addresses } => {
                started = true;
                info!("Probing {} addresses for bridges...", addresses);
            }
            ScanEvent::Probed {
                addr,
                outcome: ProbeOutcome::Found(bridge),
            } => {
                info!("Found bridge {} at {}", bridge.info.bridgeid, addr);
                found = Some(bridge);
                break;
            }
            ScanEvent::Probed { addr, outcome } => {
                probed += 1;
                trace!("{}: {:?}", addr, outcome);
            }
        }
    }

    scan_cancel.cancel();
    drop(rx);
    if let Err(e) = feeder.await {
        warn!("Probe feeder failed: {}", e);
    }

    match found {
        Some(bridge) => Ok(bridge),
        None if cancel.is_cancelled() => Err(DiscoveryError::Cancelled),
        None => {
            debug!("Scan exhausted after {} probes (started: {})", probed, started);
            Err(DiscoveryError::Exhausted)
        }
    }
}

/// Pick an interface, then scan its networks for a bridge.
pub async fn discover_bridges(
    settings: &DiscoveryConfig,
    decisions: &dyn Decisions,
    cancel: &CancellationToken,
) -> Result<Vec<FoundBridge>, DiscoveryError> {
    let candidates = candidate_interfaces(system_interfaces());
    if candidates.is_empty() {
        return Err(DiscoveryError::NoViableInterfaces);
    }
    let chosen = decisions
        .choose_interface(&candidates)
        .and_then(|i| candidates.get(i))
        .ok_or(DiscoveryError::Declined)?;

    let addresses = host_addresses(chosen, settings.min_prefix);
    info!("Scanning {} addresses on {}", addresses.len(), chosen.describe());
    let probe = Arc::new(HttpProbe::new(settings)?);
    let found = scan(addresses, probe, settings.max_in_flight, cancel).await?;
    Ok(vec![found])
}
