//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2_indexnode::manifest::{ShareDescriptor, ShareType};
use fs2_indexnode::{HelloRequest, IndexNode, IndexnodeConfig, PeerError, PeerTransport, StaticUserDirectory};
use parking_lot::Mutex;

pub const H1: &str = "0123456789abcdef0123456789abcdef";
pub const H2: &str = "fedcba9876543210fedcba9876543210";
pub const H3: &str = "00112233445566778899aabbccddeeff";

/// Address substituted for loopback clients in test nodes.
pub const HOST: &str = "192.168.1.10";

/// How a scripted file list fetch should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Connection-level error (transient).
    Io,
    /// 404 because the share was retracted (transient).
    NotFound,
    /// Body that does not parse.
    Garbage,
}

#[derive(Default)]
struct MockPeer {
    reachable: bool,
    shares: Vec<ShareDescriptor>,
    file_lists: HashMap<String, Vec<u8>>,
    failures: HashMap<String, Failure>,
    pings: usize,
    manifest_fetches: usize,
    file_list_fetches: HashMap<String, usize>,
}

/// In-process stand-in for the clients an indexnode talks to.
#[derive(Default)]
pub struct MockPeerTransport {
    peers: Mutex<HashMap<SocketAddr, MockPeer>>,
}

impl MockPeerTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a reachable peer with no shares.
    pub fn add_peer(&self, addr: SocketAddr) {
        self.peers.lock().insert(
            addr,
            MockPeer {
                reachable: true,
                ..Default::default()
            },
        );
    }

    pub fn set_reachable(&self, addr: SocketAddr, reachable: bool) {
        if let Some(peer) = self.peers.lock().get_mut(&addr) {
            peer.reachable = reachable;
        }
    }

    /// Publishes (or replaces) a tree-format share.
    pub fn set_share(&self, addr: SocketAddr, name: &str, revision: u64, body: Vec<u8>) {
        self.set_share_typed(addr, name, revision, ShareType::Tree, body);
    }

    pub fn set_share_typed(&self, addr: SocketAddr, name: &str, revision: u64, share_type: ShareType, body: Vec<u8>) {
        let mut peers = self.peers.lock();
        let Some(peer) = peers.get_mut(&addr) else { return };
        peer.shares.retain(|s| s.name != name);
        peer.shares.push(ShareDescriptor {
            name: name.to_string(),
            revision,
            share_type,
        });
        peer.file_lists.insert(name.to_string(), body);
    }

    pub fn remove_share(&self, addr: SocketAddr, name: &str) {
        if let Some(peer) = self.peers.lock().get_mut(&addr) {
            peer.shares.retain(|s| s.name != name);
            peer.file_lists.remove(name);
        }
    }

    pub fn fail_file_list(&self, addr: SocketAddr, name: &str, failure: Failure) {
        if let Some(peer) = self.peers.lock().get_mut(&addr) {
            peer.failures.insert(name.to_string(), failure);
        }
    }

    pub fn heal_file_list(&self, addr: SocketAddr, name: &str) {
        if let Some(peer) = self.peers.lock().get_mut(&addr) {
            peer.failures.remove(name);
        }
    }

    pub fn file_list_fetches(&self, addr: SocketAddr, name: &str) -> usize {
        self.peers
            .lock()
            .get(&addr)
            .and_then(|p| p.file_list_fetches.get(name).copied())
            .unwrap_or(0)
    }

    pub fn pings(&self, addr: SocketAddr) -> usize {
        self.peers.lock().get(&addr).map_or(0, |p| p.pings)
    }

    fn io_error(addr: SocketAddr) -> PeerError {
        PeerError::Io {
            addr: addr.to_string(),
            msg: "connection refused".into(),
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn ping(&self, peer: SocketAddr, _cltoken: &str) -> Result<(), PeerError> {
        let mut peers = self.peers.lock();
        match peers.get_mut(&peer) {
            Some(p) => {
                p.pings += 1;
                if p.reachable {
                    Ok(())
                } else {
                    Err(Self::io_error(peer))
                }
            }
            None => Err(Self::io_error(peer)),
        }
    }

    async fn fetch_manifest(&self, peer: SocketAddr) -> Result<Vec<u8>, PeerError> {
        let mut peers = self.peers.lock();
        let p = peers
            .get_mut(&peer)
            .filter(|p| p.reachable)
            .ok_or_else(|| Self::io_error(peer))?;
        p.manifest_fetches += 1;
        Ok(serde_json::to_vec(&p.shares)?)
    }

    async fn fetch_file_list(&self, peer: SocketAddr, share: &str) -> Result<Vec<u8>, PeerError> {
        let mut peers = self.peers.lock();
        let p = peers
            .get_mut(&peer)
            .filter(|p| p.reachable)
            .ok_or_else(|| Self::io_error(peer))?;
        *p.file_list_fetches.entry(share.to_string()).or_default() += 1;

        match p.failures.get(share) {
            Some(Failure::Io) => Err(Self::io_error(peer)),
            Some(Failure::NotFound) => Err(PeerError::NotFound {
                url: format!("http://{peer}/filelists/{share}"),
            }),
            Some(Failure::Garbage) => Ok(b"<filelist><oops".to_vec()),
            None => p.file_lists.get(share).cloned().ok_or_else(|| PeerError::NotFound {
                url: format!("http://{peer}/filelists/{share}"),
            }),
        }
    }
}

/// A tree-format file list with the given `(name, size, hash)` files at the
/// share root.
pub fn tree_listing(files: &[(&str, u64, &str)]) -> Vec<u8> {
    let children: Vec<serde_json::Value> = files
        .iter()
        .map(|(name, size, hash)| {
            serde_json::json!({"file": {"name": name, "size": size, "hash": hash, "hash-version": 1}})
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({"directory": {"name": "", "children": children}}))
        .unwrap_or_default()
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn test_config() -> IndexnodeConfig {
    IndexnodeConfig {
        advertised_address: Some(HOST.parse().unwrap()),
        refresh_workers: 2,
        // Long enough that liveness ticks never interfere unless a test wants them.
        ping_interval_secs: 3600,
        peer_timeout_secs: 2,
        ..Default::default()
    }
}

pub fn test_node(transport: &Arc<MockPeerTransport>) -> Arc<IndexNode> {
    test_node_with(transport, test_config())
}

pub fn test_node_with(transport: &Arc<MockPeerTransport>, config: IndexnodeConfig) -> Arc<IndexNode> {
    let users = Arc::new(StaticUserDirectory::new(
        config.admins.clone(),
        config.local_only_aliases.clone(),
    ));
    IndexNode::new(config, transport.clone(), users)
}

pub fn hello_from(peer: SocketAddr, alias: &str) -> HelloRequest {
    HelloRequest {
        remote: peer.ip(),
        port: peer.port(),
        cltoken: format!("token-{}", peer.port()),
        alias: alias.to_string(),
        secure: false,
    }
}

pub fn hello_from_ip(remote: IpAddr, port: u16, alias: &str) -> HelloRequest {
    HelloRequest {
        remote,
        port,
        cltoken: "token".to_string(),
        alias: alias.to_string(),
        secure: false,
    }
}

/// Waits for every queued refresh to finish.
pub async fn settle(node: &IndexNode) {
    tokio::time::timeout(Duration::from_secs(10), node.pipeline().wait_idle())
        .await
        .expect("refresh pipeline did not drain");
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
