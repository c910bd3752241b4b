//! A registered client and the state the indexnode keeps for it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::filesystem::Entry;
use crate::liveness::LivenessTracker;
use crate::share::Share;

/// One peer registered with the indexnode.
///
/// A `Client` is created on the first successful hello and discarded for good
/// when destroyed; renewed contact afterwards creates a fresh one.
pub struct Client {
    address: SocketAddr,
    local: bool,
    declared_alias: RwLock<String>,
    alias: RwLock<String>,
    cltoken: RwLock<String>,
    secure: AtomicBool,
    pub(crate) shares: Mutex<HashMap<String, Arc<Share>>>,
    root: Arc<Entry>,
    liveness: LivenessTracker,
    liveness_task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    registered_at: SystemTime,
}

impl Client {
    pub(crate) fn new(
        address: SocketAddr,
        local: bool,
        declared_alias: String,
        alias: String,
        cltoken: String,
        secure: bool,
        root: Arc<Entry>,
    ) -> Self {
        Self {
            address,
            local,
            declared_alias: RwLock::new(declared_alias),
            alias: RwLock::new(alias),
            cltoken: RwLock::new(cltoken),
            secure: AtomicBool::new(secure),
            shares: Mutex::new(HashMap::new()),
            root,
            liveness: LivenessTracker::new(),
            liveness_task: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            registered_at: SystemTime::now(),
        }
    }

    /// Identity of the client: its (possibly substituted) IP and declared port.
    /// Also the address the indexnode and downloaders contact it on.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// True if the client connected over loopback.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// True if the client's last hello arrived over a secure connection.
    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    /// Effective, network-unique alias.
    pub fn alias(&self) -> String {
        self.alias.read().clone()
    }

    /// Alias as last declared by the client, before disambiguation.
    pub fn declared_alias(&self) -> String {
        self.declared_alias.read().clone()
    }

    /// Current session token.
    pub fn cltoken(&self) -> String {
        self.cltoken.read().clone()
    }

    /// Directory under the filesystem root holding all of this client's shares.
    pub fn root(&self) -> &Arc<Entry> {
        &self.root
    }

    /// Returns the client's shares sorted by name.
    pub fn shares(&self) -> Vec<Arc<Share>> {
        let mut shares: Vec<_> = self.shares.lock().values().cloned().collect();
        shares.sort_by(|a, b| a.name().cmp(b.name()));
        shares
    }

    /// Looks up one share by name.
    pub fn share(&self, name: &str) -> Option<Arc<Share>> {
        self.shares.lock().get(name).cloned()
    }

    /// Probe bookkeeping.
    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    /// True once the client has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// When the client was registered.
    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    pub(crate) fn set_session(&self, cltoken: &str, secure: bool) {
        *self.cltoken.write() = cltoken.to_string();
        self.secure.store(secure, Ordering::Release);
    }

    pub(crate) fn set_alias(&self, declared: &str, effective: &str) {
        *self.declared_alias.write() = declared.to_string();
        *self.alias.write() = effective.to_string();
    }

    pub(crate) fn set_liveness_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.liveness_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stops the recurring liveness task, if any.
    pub fn cancel_liveness(&self) {
        if let Some(handle) = self.liveness_task.lock().take() {
            handle.abort();
        }
    }

    /// Marks the client destroyed. Returns false if it already was.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address)
            .field("alias", &*self.alias.read())
            .field("local", &self.local)
            .field("secure", &self.is_secure())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
