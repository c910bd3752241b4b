//! The indexnode service: owns the filesystem index, client registry, refresh
//! pipeline and the boundary collaborators, with an explicit lifecycle.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::avatar::AvatarStore;
use crate::chat::{Chat, RegistryCommands};
use crate::client::Client;
use crate::config::IndexnodeConfig;
use crate::error::HelloError;
use crate::filesystem::{Entry, Filesystem};
use crate::peer::{HttpPeerTransport, PeerTransport};
use crate::refresh::RefreshPipeline;
use crate::registry::{ClientRegistry, HelloRequest};
use crate::stats::{IndexStats, StatsCache};
use crate::users::{StaticUserDirectory, UserDirectory};

/// What the advertisement broadcaster announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvertInfo {
    /// Port the indexnode listens on.
    pub port: u16,
    /// Random identifier of this indexnode instance.
    pub advert_uid: u64,
    /// False once the indexnode is shutting down.
    pub active: bool,
}

/// One indexnode instance. Several may coexist in one process.
pub struct IndexNode {
    config: IndexnodeConfig,
    fs: Arc<Filesystem>,
    registry: Arc<ClientRegistry>,
    pipeline: Arc<RefreshPipeline>,
    chat: Chat,
    avatars: AvatarStore,
    stats: StatsCache,
    host_address: IpAddr,
    advert_uid: u64,
    active: AtomicBool,
    started: Instant,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl IndexNode {
    /// Builds an indexnode. Must be called inside a Tokio runtime since the
    /// refresh workers start immediately.
    pub fn new(
        config: IndexnodeConfig,
        transport: Arc<dyn PeerTransport>,
        users: Arc<dyn UserDirectory>,
    ) -> Arc<Self> {
        let host_address = config.advertised_address.unwrap_or_else(resolve_host_address);
        let fs = Arc::new(Filesystem::new());
        let pipeline = RefreshPipeline::start(config.refresh_workers, fs.clone(), transport.clone());
        let registry = ClientRegistry::new(
            fs.clone(),
            transport,
            users,
            pipeline.clone(),
            host_address,
            config.liveness(),
        );

        let chat = Chat::new(config.chat_history_limit);
        chat.register_commandable(Arc::new(RegistryCommands::new(&registry, config.secure_mode)));

        info!(
            %host_address,
            workers = config.refresh_workers,
            secure_mode = config.secure_mode,
            "indexnode created"
        );
        Arc::new(Self {
            avatars: AvatarStore::new(config.max_avatar_bytes),
            config,
            fs,
            registry,
            pipeline,
            chat,
            stats: StatsCache::new(),
            host_address,
            advert_uid: rand::random(),
            active: AtomicBool::new(true),
            started: Instant::now(),
            housekeeping: Mutex::new(None),
        })
    }

    /// Builds an indexnode talking HTTP to clients, with users from `config`.
    pub fn from_config(config: IndexnodeConfig) -> anyhow::Result<Arc<Self>> {
        let transport = Arc::new(
            HttpPeerTransport::new(config.peer_timeout()).context("cannot build HTTP client")?,
        );
        let users = Arc::new(StaticUserDirectory::new(
            config.admins.clone(),
            config.local_only_aliases.clone(),
        ));
        Ok(Self::new(config, transport, users))
    }

    /// Starts the housekeeping task that regenerates statistics and drops
    /// avatars of departed clients.
    pub fn start(self: &Arc<Self>) {
        let node = Arc::downgrade(self);
        let interval = self.config.stats_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else { break };
                let stats = node.refresh_stats();
                let pruned = node
                    .avatars
                    .retain_aliases(|alias| node.registry.is_alias_taken(alias));
                debug!(
                    clients = stats.clients,
                    files = stats.files,
                    pruned_avatars = pruned,
                    "housekeeping done"
                );
            }
        });
        if let Some(old) = self.housekeeping.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stops accepting hellos, cancels liveness and housekeeping, and waits
    /// for queued refreshes to drain.
    pub async fn shutdown(&self) {
        info!("indexnode shutting down");
        self.active.store(false, Ordering::Release);
        self.registry.shutdown();
        if let Some(handle) = self.housekeeping.lock().take() {
            handle.abort();
        }
        self.pipeline.join().await;
        info!("indexnode stopped");
    }

    /// Registers or renews a client.
    pub async fn hello(&self, request: HelloRequest) -> Result<Arc<Client>, HelloError> {
        self.registry.hello(request).await
    }

    /// Keyword search, capped at the configured result limit.
    pub fn search(&self, query: &str) -> Vec<Arc<Entry>> {
        let mut hits = self.fs.search_for_name(query);
        hits.truncate(self.config.search_result_limit);
        hits
    }

    /// Download URL of some live copy of `hash`.
    pub fn download_url(&self, hash: &str) -> Option<String> {
        self.fs
            .search_for_hash(&hash.to_ascii_lowercase())
            .iter()
            .find_map(|entry| {
                let share = entry.share()?;
                if share.owner()?.is_destroyed() {
                    return None;
                }
                share.download_url(entry)
            })
    }

    /// Regenerates the statistics snapshot now and caches it.
    pub fn refresh_stats(&self) -> Arc<IndexStats> {
        self.stats.set(IndexStats::generate(
            &self.registry,
            self.config.popular_files_limit,
            self.started,
        ));
        self.stats.get()
    }

    /// The cached statistics snapshot.
    pub fn stats(&self) -> Arc<IndexStats> {
        self.stats.get()
    }

    /// Information polled by the advertisement broadcaster.
    pub fn advert_info(&self) -> AdvertInfo {
        AdvertInfo {
            port: self.config.bind_addr.port(),
            advert_uid: self.advert_uid,
            active: self.active.load(Ordering::Acquire),
        }
    }

    /// True if clients must connect securely.
    pub fn is_secure_mode(&self) -> bool {
        self.config.secure_mode
    }

    /// Active configuration.
    pub fn config(&self) -> &IndexnodeConfig {
        &self.config
    }

    /// The filesystem index.
    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    /// The client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The share refresh pipeline.
    pub fn pipeline(&self) -> &Arc<RefreshPipeline> {
        &self.pipeline
    }

    /// Chat log and command dispatch.
    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    /// Submitted avatars.
    pub fn avatars(&self) -> &AvatarStore {
        &self.avatars
    }

    /// Address substituted for loopback client identities.
    pub fn host_address(&self) -> IpAddr {
        self.host_address
    }
}

/// Finds the address of the interface that routes outward. No packet is sent.
fn resolve_host_address() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
