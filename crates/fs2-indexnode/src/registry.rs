//! Client registration, identity resolution and reconciliation.
//!
//! Clients are keyed by `(ip, declared port)`. A hello from loopback is keyed
//! by the indexnode's own host address instead, so a client and an indexnode
//! on one machine do not collide on `127.0.0.1`; such clients are flagged
//! local.
//!
//! The alias set is always locked before any filesystem lock. No lock is held
//! across a call to a client.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{HelloError, PeerError};
use crate::filesystem::{Filesystem, DIR_LINK_COUNT};
use crate::liveness::{spawn_monitor, LivenessConfig};
use crate::manifest::{is_valid_name, parse_share_manifest};
use crate::peer::PeerTransport;
use crate::refresh::{RefreshJob, RefreshPipeline};
use crate::share::Share;
use crate::users::UserDirectory;

/// Parameters of one hello request.
#[derive(Debug, Clone)]
pub struct HelloRequest {
    /// Source IP of the request.
    pub remote: IpAddr,
    /// Port the client serves on.
    pub port: u16,
    /// Session token.
    pub cltoken: String,
    /// Declared alias; may be empty.
    pub alias: String,
    /// True if the request arrived over a secure connection.
    pub secure: bool,
}

/// Registration counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Clients currently registered.
    pub clients: usize,
    /// Clients ever registered.
    pub registered: u64,
    /// Clients destroyed.
    pub destroyed: u64,
    /// Hellos rejected because the client was unreachable.
    pub rejected: u64,
}

/// All currently registered clients.
pub struct ClientRegistry {
    fs: Arc<Filesystem>,
    transport: Arc<dyn PeerTransport>,
    users: Arc<dyn UserDirectory>,
    pipeline: Arc<RefreshPipeline>,
    clients: DashMap<SocketAddr, Arc<Client>>,
    aliases: Mutex<HashSet<String>>,
    host_address: IpAddr,
    liveness: LivenessConfig,
    accepting: AtomicBool,
    registered: AtomicU64,
    destroyed: AtomicU64,
    rejected: AtomicU64,
}

impl ClientRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    /// * `host_address` - Address substituted for loopback identities
    /// * `liveness` - Probe interval, timeout and failure threshold
    pub fn new(
        fs: Arc<Filesystem>,
        transport: Arc<dyn PeerTransport>,
        users: Arc<dyn UserDirectory>,
        pipeline: Arc<RefreshPipeline>,
        host_address: IpAddr,
        liveness: LivenessConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            transport,
            users,
            pipeline,
            clients: DashMap::new(),
            aliases: Mutex::new(HashSet::new()),
            host_address,
            liveness,
            accepting: AtomicBool::new(true),
            registered: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Maps a request source to a client identity and its local flag.
    pub fn resolve_identity(&self, remote: IpAddr, port: u16) -> (SocketAddr, bool) {
        if remote.is_loopback() {
            (SocketAddr::new(self.host_address, port), true)
        } else {
            (SocketAddr::new(remote, port), false)
        }
    }

    /// Registers a client or refreshes an existing registration.
    ///
    /// A new client must answer a ping on its declared address before
    /// anything is created. Manifest failures during the first reconciliation
    /// are logged but do not reject the hello.
    pub async fn hello(self: &Arc<Self>, request: HelloRequest) -> Result<Arc<Client>, HelloError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(HelloError::ShuttingDown);
        }
        let (address, local) = self.resolve_identity(request.remote, request.port);

        // A destroy can land while a renewal is in flight; the destroyed
        // client is never handed out, the caller is registered afresh.
        let client = loop {
            if let Some(client) = self.get(address).filter(|c| !c.is_destroyed()) {
                self.renew(&client, &request).await;
                if !client.is_destroyed() {
                    return Ok(client);
                }
                debug!(%address, "client destroyed during renewal");
                continue;
            }

            self.check_reachable(address, &request.cltoken).await?;

            let created = match self.clients.entry(address) {
                MapEntry::Occupied(existing) if !existing.get().is_destroyed() => {
                    // Lost a race with a concurrent hello from the same client.
                    Err(existing.get().clone())
                }
                MapEntry::Occupied(mut stale) => {
                    let client = self.create_client(address, local, &request)?;
                    stale.insert(client.clone());
                    Ok(client)
                }
                MapEntry::Vacant(slot) => {
                    let client = self.create_client(address, local, &request)?;
                    slot.insert(client.clone());
                    Ok(client)
                }
            };
            match created {
                Ok(client) => break client,
                Err(existing) => {
                    self.renew(&existing, &request).await;
                    if !existing.is_destroyed() {
                        return Ok(existing);
                    }
                }
            }
        };

        self.registered.fetch_add(1, Ordering::Relaxed);
        client.set_liveness_task(spawn_monitor(
            Arc::downgrade(self),
            Arc::downgrade(&client),
            self.liveness.interval,
        ));
        info!(
            %address,
            alias = %client.alias(),
            local,
            secure = request.secure,
            "client registered"
        );

        self.reconcile_logged(&client).await;
        Ok(client)
    }

    async fn check_reachable(&self, address: SocketAddr, cltoken: &str) -> Result<(), HelloError> {
        let probe = self.transport.ping(address, cltoken);
        let reachable = match tokio::time::timeout(self.liveness.probe_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::Timeout {
                addr: address.to_string(),
            }),
        };
        reachable.map_err(|source| {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            info!(%address, error = %source, "rejecting hello from unreachable client");
            HelloError::Unreachable {
                addr: address.to_string(),
                source,
            }
        })
    }

    fn create_client(
        &self,
        address: SocketAddr,
        local: bool,
        request: &HelloRequest,
    ) -> Result<Arc<Client>, HelloError> {
        let mut aliases = self.aliases.lock();
        let alias = self.pick_alias(&aliases, &request.alias, address, local);

        let root = self
            .fs
            .create_child_entry(self.fs.root(), &alias, "", 0, DIR_LINK_COUNT, None)?;
        self.fs.root().add_link();
        aliases.insert(alias.clone());

        Ok(Arc::new(Client::new(
            address,
            local,
            request.alias.clone(),
            alias,
            request.cltoken.clone(),
            request.secure,
            root,
        )))
    }

    async fn renew(&self, client: &Arc<Client>, request: &HelloRequest) {
        client.set_session(&request.cltoken, request.secure);
        client.liveness().reset();
        if request.alias != client.declared_alias() {
            self.change_alias(client, &request.alias);
        }
        self.reconcile_logged(client).await;
    }

    /// Chooses the effective alias for `declared`.
    fn pick_alias(
        &self,
        taken: &HashSet<String>,
        declared: &str,
        address: SocketAddr,
        local: bool,
    ) -> String {
        let cleaned = declared.replace('/', "_");
        let base = if is_valid_name(&cleaned) {
            cleaned
        } else {
            format!("Unnamed@{address}")
        };

        if !taken.contains(&base) && (local || !self.users.is_local_only(&base)) {
            return base;
        }

        let mut alias = format!("{base}@{address}");
        let mut attempt = 1;
        while taken.contains(&alias) {
            attempt += 1;
            alias = format!("{base}@{address}~{attempt}");
        }
        info!(declared = %declared, alias = %alias, "alias disambiguated");
        alias
    }

    /// Re-resolves a client's alias after it declared a new one and renames
    /// its root directory to match.
    fn change_alias(&self, client: &Arc<Client>, declared: &str) {
        let mut aliases = self.aliases.lock();
        if client.is_destroyed() {
            return;
        }

        let old = client.alias();
        aliases.remove(&old);
        let new = self.pick_alias(&aliases, declared, client.address(), client.is_local());

        if new != old {
            if let Err(e) = self.fs.rename(client.root(), &new) {
                warn!(client = %old, alias = %new, error = %e, "cannot rename client directory");
                aliases.insert(old);
                return;
            }
            info!(old = %old, new = %new, "client alias changed");
        }
        aliases.insert(new.clone());
        client.set_alias(declared, &new);
    }

    async fn reconcile_logged(&self, client: &Arc<Client>) {
        match self.reconcile(client).await {
            Ok(scheduled) => {
                debug!(client = %client.alias(), scheduled, "reconciled shares");
            }
            Err(e) => {
                warn!(client = %client.alias(), error = %e, "cannot fetch share manifest");
            }
        }
    }

    /// Diffs the client's manifest against its known shares.
    ///
    /// Shares no longer listed are delisted at once; new shares and shares
    /// with a newer revision are submitted to the refresh pipeline. Returns
    /// the number of refreshes scheduled.
    pub async fn reconcile(&self, client: &Arc<Client>) -> Result<usize, PeerError> {
        let body = self.transport.fetch_manifest(client.address()).await?;
        let descriptors = parse_share_manifest(&body)?;

        let mut jobs = Vec::new();
        let mut removed = Vec::new();
        {
            let mut shares = client.shares.lock();
            if client.is_destroyed() {
                return Ok(0);
            }

            let listed: HashSet<&str> = descriptors
                .iter()
                .filter(|d| is_valid_name(&d.name))
                .map(|d| d.name.as_str())
                .collect();
            let gone: Vec<String> = shares
                .keys()
                .filter(|name| !listed.contains(name.as_str()))
                .cloned()
                .collect();
            for name in gone {
                if let Some(share) = shares.remove(&name) {
                    removed.push(share);
                }
            }

            for descriptor in &descriptors {
                if !is_valid_name(&descriptor.name) {
                    debug!(client = %client.alias(), share = %descriptor.name, "ignoring share with invalid name");
                    continue;
                }
                let share = shares
                    .entry(descriptor.name.clone())
                    .or_insert_with(|| Share::new(&descriptor.name, client, descriptor.share_type))
                    .clone();
                if let Some(previous) = share.bump_revision(descriptor.revision) {
                    share.set_share_type(descriptor.share_type);
                    jobs.push(RefreshJob {
                        share,
                        revision: descriptor.revision,
                        previous,
                    });
                }
            }
        }

        for share in removed {
            share.delist(&self.fs);
            info!(client = %client.alias(), share = %share.name(), "share delisted");
        }

        let mut scheduled = 0;
        for job in jobs {
            let (share, revision, previous) = (job.share.clone(), job.revision, job.previous);
            if self.pipeline.submit(job) {
                scheduled += 1;
            } else {
                share.rollback_revision(revision, previous);
            }
        }
        Ok(scheduled)
    }

    /// Removes a client and everything it shared. Idempotent.
    pub fn destroy(&self, client: &Arc<Client>) {
        if !client.mark_destroyed() {
            return;
        }
        client.cancel_liveness();
        self.clients
            .remove_if(&client.address(), |_, current| Arc::ptr_eq(current, client));

        let shares: Vec<Arc<Share>> = client.shares.lock().drain().map(|(_, s)| s).collect();
        for share in &shares {
            share.delist(&self.fs);
        }

        let mut aliases = self.aliases.lock();
        let root = client.root();
        let fs_root = self.fs.root();
        fs_root.remove_link();
        self.fs.sub_size_upward(fs_root, root.size());
        self.fs.erase(root);
        aliases.remove(&client.alias());
        drop(aliases);

        self.destroyed.fetch_add(1, Ordering::Relaxed);
        info!(
            client = %client.alias(),
            address = %client.address(),
            shares = shares.len(),
            "client destroyed"
        );
    }

    fn get(&self, address: SocketAddr) -> Option<Arc<Client>> {
        self.clients.get(&address).map(|c| c.value().clone())
    }

    /// Finds the client a request from `remote` declaring `port` belongs to.
    pub fn lookup(&self, remote: IpAddr, port: u16) -> Option<Arc<Client>> {
        let (address, _) = self.resolve_identity(remote, port);
        self.get(address)
    }

    /// Finds a client by effective alias.
    pub fn find_by_alias(&self, alias: &str) -> Option<Arc<Client>> {
        self.clients
            .iter()
            .find(|c| c.value().alias() == alias)
            .map(|c| c.value().clone())
    }

    /// Returns all registered clients sorted by alias.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        let mut clients: Vec<Arc<Client>> = self.clients.iter().map(|c| c.value().clone()).collect();
        clients.sort_by_key(|c| c.alias());
        clients
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// True if `alias` is held by a live client.
    pub fn is_alias_taken(&self, alias: &str) -> bool {
        self.aliases.lock().contains(alias)
    }

    /// Rejects further hellos and stops every liveness task.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        for client in self.clients.iter() {
            client.value().cancel_liveness();
        }
    }

    /// Returns a snapshot of the registration counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            clients: self.client_count(),
            registered: self.registered.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// The user database consulted for alias and privilege checks.
    pub fn users(&self) -> &Arc<dyn UserDirectory> {
        &self.users
    }

    /// The filesystem index clients are imported into.
    pub fn filesystem(&self) -> &Arc<Filesystem> {
        &self.fs
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub(crate) fn liveness_config(&self) -> &LivenessConfig {
        &self.liveness
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::users::StaticUserDirectory;

    fn registry(users: StaticUserDirectory) -> Arc<ClientRegistry> {
        let fs = Arc::new(Filesystem::new());
        let transport: Arc<dyn PeerTransport> =
            Arc::new(crate::peer::HttpPeerTransport::new(std::time::Duration::from_millis(200)).unwrap());
        let pipeline = RefreshPipeline::start(1, fs.clone(), transport.clone());
        ClientRegistry::new(
            fs,
            transport,
            Arc::new(users),
            pipeline,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            LivenessConfig::default(),
        )
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// Always reachable, no shares; when armed, destroys the requesting
    /// client from inside its next manifest fetch.
    #[derive(Default)]
    struct DestroyingTransport {
        registry: Mutex<std::sync::Weak<ClientRegistry>>,
        armed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PeerTransport for DestroyingTransport {
        async fn ping(&self, _peer: SocketAddr, _cltoken: &str) -> Result<(), PeerError> {
            Ok(())
        }

        async fn fetch_manifest(&self, peer: SocketAddr) -> Result<Vec<u8>, PeerError> {
            if self.armed.swap(false, Ordering::AcqRel) {
                if let Some(registry) = self.registry.lock().upgrade() {
                    if let Some(client) = registry.get(peer) {
                        registry.destroy(&client);
                    }
                }
            }
            Ok(b"[]".to_vec())
        }

        async fn fetch_file_list(&self, peer: SocketAddr, share: &str) -> Result<Vec<u8>, PeerError> {
            Err(PeerError::NotFound {
                url: format!("http://{peer}/filelists/{share}"),
            })
        }
    }

    #[tokio::test]
    async fn test_loopback_identity_substitution() {
        let registry = registry(StaticUserDirectory::default());
        let (address, local) = registry.resolve_identity(IpAddr::V4(Ipv4Addr::LOCALHOST), 41234);
        assert_eq!(address, addr("192.168.1.10:41234"));
        assert!(local);

        let (address, local) = registry.resolve_identity("10.0.0.5".parse().unwrap(), 41234);
        assert_eq!(address, addr("10.0.0.5:41234"));
        assert!(!local);
    }

    #[tokio::test]
    async fn test_pick_alias() {
        let registry = registry(StaticUserDirectory::new(vec![], vec!["console".to_string()]));
        let mut taken = HashSet::new();
        let a = addr("10.0.0.5:41234");

        assert_eq!(registry.pick_alias(&taken, "alice", a, false), "alice");
        assert_eq!(registry.pick_alias(&taken, "", a, false), "Unnamed@10.0.0.5:41234");
        assert_eq!(registry.pick_alias(&taken, "a/b", a, false), "a_b");
        assert_eq!(registry.pick_alias(&taken, "..", a, false), "Unnamed@10.0.0.5:41234");

        taken.insert("alice".to_string());
        assert_eq!(registry.pick_alias(&taken, "alice", a, false), "alice@10.0.0.5:41234");
        taken.insert("alice@10.0.0.5:41234".to_string());
        assert_eq!(registry.pick_alias(&taken, "alice", a, false), "alice@10.0.0.5:41234~2");

        assert_eq!(registry.pick_alias(&taken, "console", a, false), "console@10.0.0.5:41234");
        assert_eq!(registry.pick_alias(&taken, "console", a, true), "console");
    }

    #[tokio::test]
    async fn test_unreachable_hello_creates_nothing() {
        let registry = registry(StaticUserDirectory::default());
        let err = registry
            .hello(HelloRequest {
                remote: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 9,
                cltoken: "t".into(),
                alias: "alice".into(),
                secure: false,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, HelloError::Unreachable { .. }));
        assert_eq!(registry.client_count(), 0);
        assert!(!registry.is_alias_taken("alice"));
        assert_eq!(registry.filesystem().root().child_count(), 0);
        assert_eq!(registry.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_hello_rejected_after_shutdown() {
        let registry = registry(StaticUserDirectory::default());
        registry.shutdown();
        let err = registry
            .hello(HelloRequest {
                remote: "10.0.0.5".parse().unwrap(),
                port: 41234,
                cltoken: "t".into(),
                alias: "alice".into(),
                secure: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HelloError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_hello_never_returns_destroyed_client() {
        let fs = Arc::new(Filesystem::new());
        let transport = Arc::new(DestroyingTransport::default());
        let pipeline = RefreshPipeline::start(1, fs.clone(), transport.clone());
        let registry = ClientRegistry::new(
            fs,
            transport.clone(),
            Arc::new(StaticUserDirectory::default()),
            pipeline,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            LivenessConfig::default(),
        );
        *transport.registry.lock() = Arc::downgrade(&registry);

        let request = HelloRequest {
            remote: "10.0.0.5".parse().unwrap(),
            port: 41234,
            cltoken: "t".into(),
            alias: "alice".into(),
            secure: false,
        };
        let first = registry.hello(request.clone()).await.unwrap();

        transport.armed.store(true, Ordering::Release);
        let second = registry.hello(request).await.unwrap();

        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.alias(), "alice");
        let current = registry.lookup("10.0.0.5".parse().unwrap(), 41234).unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(registry.client_count(), 1);
        assert_eq!(registry.filesystem().root().child_count(), 1);
        assert!(registry.filesystem().verify().is_empty());
        registry.shutdown();
    }
}
