//! Gossip-based cluster membership and consistent bucket routing.
//!
//! Every node advertises its proxy listen port as node metadata. A watcher
//! task rebuilds the routing view (lexicographically sorted member names plus
//! name → `ip:proxy_port`) whenever the live-node set changes, and routing
//! picks `members[hash % count]`. The scheme is intentionally weak — routes
//! are soft, and brief disagreement during a rebalance collapses into local
//! processing with at most one token of global-limit slack.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::util::hash_crc64;

const PROXY_PORT_KEY: &str = "proxy_port";
const CLUSTER_ID: &str = "nirn-proxy";

/// Snapshot of the cluster used for routing decisions.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    /// Member names, lexicographically sorted so every node agrees on
    /// `members[hash % count]`.
    pub ordered_members: Vec<String>,
    pub name_to_address: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct RouterState {
    view: Option<ClusterView>,
    local_proxy_addr: String,
}

/// Consistent-hash route selection over the current cluster view.
pub struct ClusterRouter {
    state: RwLock<RouterState>,
    /// Routes that must never leave the local node. These endpoints carry no
    /// ratelimit headers, so spreading them through the cluster only adds
    /// tail latency.
    always_local: HashSet<u64>,
}

impl ClusterRouter {
    pub fn new() -> Self {
        let mut always_local = HashSet::new();
        always_local.insert(hash_crc64("/users/@me"));
        always_local.insert(hash_crc64("/users/@me/channels"));
        Self {
            state: RwLock::new(RouterState::default()),
            always_local,
        }
    }

    /// Pick the owner for `hash`. `None` means process locally: stand-alone
    /// mode, the no-key case, an always-local route, or the hash landing on
    /// this node.
    pub fn route(&self, hash: u64) -> Option<String> {
        if hash == 0 || self.always_local.contains(&hash) {
            return None;
        }

        let state = self.state.read().expect("router lock");
        let view = state.view.as_ref()?;
        let count = view.ordered_members.len() as u64;
        if count == 0 {
            return None;
        }

        let chosen = &view.ordered_members[(hash % count) as usize];
        let addr = view.name_to_address.get(chosen)?;
        if *addr == state.local_proxy_addr {
            return None;
        }
        Some(addr.clone())
    }

    pub fn apply_view(&self, view: ClusterView) {
        let mut state = self.state.write().expect("router lock");
        state.view = Some(view);
    }

    fn set_local_addr(&self, addr: String) {
        let mut state = self.state.write().expect("router lock");
        state.local_proxy_addr = addr;
    }
}

impl Default for ClusterRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Running gossip membership. Dropping without [`leave`] keeps gossiping
/// until the failure detector times the node out; shutdown paths should
/// always call leave.
pub struct ClusterMembership {
    handle: ChitchatHandle,
}

impl ClusterMembership {
    /// Join (or form) the cluster and keep `router` in sync with membership
    /// changes.
    pub async fn join(config: &Config, router: std::sync::Arc<ClusterRouter>) -> Result<Self> {
        let seeds = resolve_seeds(config).await?;
        let advertise_ip = advertise_ip(config);
        let gossip_addr = SocketAddr::new(advertise_ip, config.cluster_port);

        let node_name = config
            .node_name
            .clone()
            .unwrap_or_else(|| format!("{advertise_ip}-{}", config.port));
        let generation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_secs();

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId::new(node_name.clone(), generation, gossip_addr),
            cluster_id: CLUSTER_ID.to_string(),
            gossip_interval: Duration::from_millis(500),
            listen_addr: SocketAddr::new(config.bind_ip, config.cluster_port),
            seed_nodes: seeds,
            failure_detector_config: FailureDetectorConfig::default(),
            marked_for_deletion_grace_period: Duration::from_secs(60),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(
            chitchat_config,
            vec![(PROXY_PORT_KEY.to_string(), config.port.to_string())],
            &UdpTransport,
        )
        .await
        .map_err(|e| ProxyError::Cluster(format!("failed to start gossip: {e}")))?;

        router.set_local_addr(format!("{advertise_ip}:{}", config.port));

        let chitchat = handle.chitchat();
        let mut watcher = chitchat.lock().await.live_nodes_watch_stream();
        let watch_router = router.clone();
        tokio::spawn(async move {
            while let Some(live_nodes) = watcher.next().await {
                let mut view = ClusterView::default();
                for (id, state) in &live_nodes {
                    let proxy_port = match state.get(PROXY_PORT_KEY) {
                        Some(port) => port,
                        None => continue,
                    };
                    view.ordered_members.push(id.node_id.clone());
                    view.name_to_address.insert(
                        id.node_id.clone(),
                        format!("{}:{}", id.gossip_advertise_addr.ip(), proxy_port),
                    );
                }
                view.ordered_members.sort();
                tracing::info!(members = ?view.ordered_members, "cluster membership changed");
                watch_router.apply_view(view);
            }
        });

        tracing::info!(node = %node_name, "joined cluster gossip");
        Ok(Self { handle })
    }

    /// Broadcast the leave and stop gossiping.
    pub async fn leave(self) {
        if let Err(e) = self.handle.shutdown().await {
            tracing::warn!(error = %e, "gossip shutdown failed");
        }
    }
}

async fn resolve_seeds(config: &Config) -> Result<Vec<String>> {
    let mut seeds = Vec::new();
    if !config.cluster_members.is_empty() {
        for member in &config.cluster_members {
            if member.contains(':') {
                seeds.push(member.clone());
            } else {
                seeds.push(format!("{member}:{}", config.cluster_port));
            }
        }
    } else if let Some(dns) = &config.cluster_dns {
        let addrs = tokio::net::lookup_host(format!("{dns}:{}", config.cluster_port))
            .await
            .map_err(|e| ProxyError::Cluster(format!("cluster dns lookup failed: {e}")))?;
        for addr in addrs {
            seeds.push(addr.to_string());
        }
        if seeds.is_empty() {
            return Err(ProxyError::Cluster("no ips returned by dns".into()));
        }
    }
    Ok(seeds)
}

fn advertise_ip(config: &Config) -> IpAddr {
    if !config.bind_ip.is_unspecified() {
        return config.bind_ip;
    }
    // Routable local address discovery: a connected UDP socket never sends
    // anything but reveals which interface the OS would pick.
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_of(members: &[(&str, &str)]) -> ClusterView {
        let mut view = ClusterView::default();
        for (name, addr) in members {
            view.ordered_members.push(name.to_string());
            view.name_to_address
                .insert(name.to_string(), addr.to_string());
        }
        view.ordered_members.sort();
        view
    }

    #[test]
    fn no_view_routes_locally() {
        let router = ClusterRouter::new();
        assert_eq!(router.route(12345), None);
    }

    #[test]
    fn zero_hash_routes_locally() {
        let router = ClusterRouter::new();
        router.apply_view(view_of(&[("a", "10.0.0.1:8080"), ("b", "10.0.0.2:8080")]));
        assert_eq!(router.route(0), None);
    }

    #[test]
    fn always_local_routes_stay_local() {
        let router = ClusterRouter::new();
        router.apply_view(view_of(&[("a", "10.0.0.1:8080"), ("b", "10.0.0.2:8080")]));
        assert_eq!(router.route(hash_crc64("/users/@me")), None);
        assert_eq!(router.route(hash_crc64("/users/@me/channels")), None);
    }

    #[test]
    fn own_address_routes_locally() {
        let router = ClusterRouter::new();
        router.set_local_addr("10.0.0.1:8080".to_string());
        router.apply_view(view_of(&[("a", "10.0.0.1:8080"), ("b", "10.0.0.2:8080")]));

        let mut saw_local = false;
        let mut saw_remote = false;
        for hash in 1..100u64 {
            match router.route(hash) {
                None => saw_local = true,
                Some(addr) => {
                    assert_eq!(addr, "10.0.0.2:8080");
                    saw_remote = true;
                }
            }
        }
        assert!(saw_local && saw_remote);
    }

    #[test]
    fn nodes_agree_on_routing_targets() {
        let members = [
            ("node-a", "10.0.0.1:8080"),
            ("node-b", "10.0.0.2:8080"),
            ("node-c", "10.0.0.3:8080"),
        ];

        // Same view applied to three routers, each claiming a different
        // local address: for any hash, the non-owning nodes must name the
        // same owner.
        let routers: Vec<ClusterRouter> = members
            .iter()
            .map(|(_, addr)| {
                let router = ClusterRouter::new();
                router.set_local_addr(addr.to_string());
                router.apply_view(view_of(&members));
                router
            })
            .collect();

        for hash in 1..500u64 {
            let owners: Vec<Option<String>> =
                routers.iter().map(|r| r.route(hash)).collect();
            let named: HashSet<&String> = owners.iter().flatten().collect();
            // Exactly one member owns the hash; the owner itself reports
            // local (None), every other node reports the owner's address.
            assert_eq!(named.len(), 1, "hash {hash} produced owners {owners:?}");
            assert_eq!(owners.iter().filter(|o| o.is_none()).count(), 1);
        }
    }
}
