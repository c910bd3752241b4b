//! Shares: named, revisioned exports offered by one client.
//!
//! A share is refreshed whenever its client reports a revision newer than the
//! last one scheduled. The revision is bumped optimistically when the refresh
//! is scheduled and rolled back only if the refresh fails with a transient I/O
//! error; parse failures keep the new revision so a broken file list is not
//! fetched again until the client publishes another revision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::PeerError;
use crate::filesystem::{Entry, Filesystem, DIR_LINK_COUNT, FILE_LINK_COUNT};
use crate::manifest::{
    is_valid_name, is_well_formed_hash, parse_file_list, FileListing, ListingNode, ShareType,
    EXPECTED_HASH_VERSION, MAX_FILE_SIZE,
};
use crate::peer::{download_url, PeerTransport};

/// Result of one refresh job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The file list was imported.
    Imported {
        /// Number of files imported.
        files: u64,
        /// Total bytes imported.
        size: u64,
    },
    /// The share or its client was gone before the job ran.
    Skipped,
    /// Fetching or parsing failed.
    Failed {
        /// True if the revision was restored so the next hello retries.
        rolled_back: bool,
    },
}

/// Counts accumulated while importing one directory.
#[derive(Default)]
struct ImportTally {
    size: u64,
    dirs: u64,
    files: u64,
}

/// A named export of one client.
pub struct Share {
    name: String,
    owner: Weak<Client>,
    share_type: RwLock<ShareType>,
    revision: Mutex<Option<u64>>,
    delisted: AtomicBool,
    entry: Mutex<Option<Arc<Entry>>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl Share {
    pub(crate) fn new(name: &str, owner: &Arc<Client>, share_type: ShareType) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            owner: Arc::downgrade(owner),
            share_type: RwLock::new(share_type),
            revision: Mutex::new(None),
            delisted: AtomicBool::new(false),
            entry: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Share name, unique per client.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The client offering this share, unless it has been dropped.
    pub fn owner(&self) -> Option<Arc<Client>> {
        self.owner.upgrade()
    }

    /// Current file list format.
    pub fn share_type(&self) -> ShareType {
        *self.share_type.read()
    }

    /// Last revision scheduled for import; `None` before the first schedule.
    pub fn revision(&self) -> Option<u64> {
        *self.revision.lock()
    }

    /// True once the share has been delisted.
    pub fn is_delisted(&self) -> bool {
        self.delisted.load(Ordering::Acquire)
    }

    /// Root directory of the imported content, if an import has completed.
    pub fn entry(&self) -> Option<Arc<Entry>> {
        self.entry.lock().clone()
    }

    pub(crate) fn set_share_type(&self, share_type: ShareType) {
        *self.share_type.write() = share_type;
    }

    /// Bumps the revision to `reported` if it is newer than the current one.
    ///
    /// Returns the previous revision when a refresh should be scheduled.
    pub(crate) fn bump_revision(&self, reported: u64) -> Option<Option<u64>> {
        let mut revision = self.revision.lock();
        match *revision {
            Some(current) if reported <= current => None,
            previous => {
                *revision = Some(reported);
                Some(previous)
            }
        }
    }

    /// Restores `previous` unless another bump has replaced `bumped` since.
    pub(crate) fn rollback_revision(&self, bumped: u64, previous: Option<u64>) -> bool {
        let mut revision = self.revision.lock();
        if *revision == Some(bumped) {
            *revision = previous;
            true
        } else {
            false
        }
    }

    /// Fetches this share's file list and replaces its imported subtree.
    ///
    /// Runs at most once at a time per share.
    pub async fn refresh(
        self: &Arc<Self>,
        fs: &Filesystem,
        transport: &dyn PeerTransport,
        revision: u64,
        previous: Option<u64>,
    ) -> RefreshOutcome {
        let _running = self.refresh_lock.lock().await;

        let Some(owner) = self.owner() else {
            return RefreshOutcome::Skipped;
        };
        if self.is_delisted() || owner.is_destroyed() {
            return RefreshOutcome::Skipped;
        }

        let listing = match self.fetch(transport, &owner).await {
            Ok(listing) => listing,
            Err(e) if e.is_transient() => {
                let rolled_back = self.rollback_revision(revision, previous);
                warn!(
                    client = %owner.alias(),
                    share = %self.name,
                    revision,
                    rolled_back,
                    error = %e,
                    "share refresh failed, will retry on next hello"
                );
                return RefreshOutcome::Failed { rolled_back };
            }
            Err(e) => {
                warn!(
                    client = %owner.alias(),
                    share = %self.name,
                    revision,
                    error = %e,
                    "share file list is malformed, keeping revision"
                );
                return RefreshOutcome::Failed { rolled_back: false };
            }
        };

        match self.import(fs, owner.root(), &listing) {
            Some((files, size)) => {
                info!(
                    client = %owner.alias(),
                    share = %self.name,
                    revision,
                    files,
                    size,
                    "share refreshed"
                );
                RefreshOutcome::Imported { files, size }
            }
            None => RefreshOutcome::Skipped,
        }
    }

    async fn fetch(
        &self,
        transport: &dyn PeerTransport,
        owner: &Client,
    ) -> Result<FileListing, PeerError> {
        let body = transport.fetch_file_list(owner.address(), &self.name).await?;
        parse_file_list(self.share_type(), &body)
    }

    /// Replaces the share's subtree under `client_root` with `listing`.
    ///
    /// Returns the imported file count and size, or `None` if the share was
    /// delisted or its directory could not be created.
    pub(crate) fn import(
        self: &Arc<Self>,
        fs: &Filesystem,
        client_root: &Arc<Entry>,
        listing: &FileListing,
    ) -> Option<(u64, u64)> {
        let mut current = self.entry.lock();
        if self.is_delisted() {
            return None;
        }
        if let Some(old) = current.take() {
            detach(fs, &old);
        }

        let share_root = match fs.create_child_entry(
            client_root,
            &self.name,
            "",
            0,
            DIR_LINK_COUNT,
            Some(self),
        ) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(share = %self.name, error = %e, "cannot create share directory");
                return None;
            }
        };

        let tally = self.import_dir(fs, &share_root, &listing.children);
        share_root.set_aggregates(tally.size, DIR_LINK_COUNT + tally.dirs);
        client_root.add_link();
        fs.add_size_upward(client_root, tally.size);

        *current = Some(share_root);
        Some((tally.files, tally.size))
    }

    fn import_dir(self: &Arc<Self>, fs: &Filesystem, dir: &Arc<Entry>, nodes: &[ListingNode]) -> ImportTally {
        let mut tally = ImportTally::default();
        for node in nodes {
            if !is_valid_name(node.name()) {
                debug!(share = %self.name, name = node.name(), "skipping invalid name");
                continue;
            }
            match node {
                ListingNode::Directory { name, children } => {
                    let child = match fs.create_child_entry(dir, name, "", 0, DIR_LINK_COUNT, Some(self)) {
                        Ok(child) => child,
                        Err(e) => {
                            debug!(share = %self.name, error = %e, "skipping directory");
                            continue;
                        }
                    };
                    let sub = self.import_dir(fs, &child, children);
                    child.set_aggregates(sub.size, DIR_LINK_COUNT + sub.dirs);
                    tally.size = tally.size.saturating_add(sub.size);
                    tally.files += sub.files;
                    tally.dirs += 1;
                }
                ListingNode::File {
                    name,
                    size,
                    hash,
                    hash_version,
                } => {
                    if *size > MAX_FILE_SIZE {
                        debug!(share = %self.name, file = %name, size, "skipping file with implausible size");
                        continue;
                    }
                    if *hash_version != EXPECTED_HASH_VERSION || !is_well_formed_hash(hash) {
                        debug!(share = %self.name, file = %name, hash_version, "skipping file with unusable hash");
                        continue;
                    }
                    let hash = hash.to_ascii_lowercase();
                    match fs.create_child_entry(dir, name, &hash, *size, FILE_LINK_COUNT, Some(self)) {
                        Ok(_) => {
                            tally.size = tally.size.saturating_add(*size);
                            tally.files += 1;
                        }
                        Err(e) => debug!(share = %self.name, error = %e, "skipping file"),
                    }
                }
            }
        }
        tally
    }

    /// Delists the share and erases its subtree. Terminal.
    pub(crate) fn delist(&self, fs: &Filesystem) {
        self.delisted.store(true, Ordering::Release);
        if let Some(old) = self.entry.lock().take() {
            detach(fs, &old);
        }
    }

    /// Download URL for `entry`, which must lie inside this share.
    pub fn download_url(&self, entry: &Arc<Entry>) -> Option<String> {
        let owner = self.owner()?;
        let share_root = self.entry()?;

        let mut path = Vec::new();
        let mut cursor = entry.clone();
        while cursor.id() != share_root.id() {
            path.push(cursor.name());
            cursor = cursor.parent()?;
        }
        path.reverse();
        download_url(owner.address(), &self.name, &path)
    }
}

/// Removes a share subtree, first taking its size and link out of the
/// ancestors so aggregates stay consistent throughout.
fn detach(fs: &Filesystem, share_root: &Arc<Entry>) {
    if let Some(parent) = share_root.parent() {
        parent.remove_link();
        fs.sub_size_upward(&parent, share_root.size());
    }
    fs.erase(share_root);
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("name", &self.name)
            .field("share_type", &self.share_type())
            .field("revision", &self.revision())
            .field("delisted", &self.is_delisted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H1: &str = "0123456789abcdef0123456789abcdef";
    const H2: &str = "fedcba9876543210fedcba9876543210";

    fn file(name: &str, size: u64, hash: &str, hash_version: u32) -> ListingNode {
        ListingNode::File {
            name: name.into(),
            size,
            hash: hash.into(),
            hash_version,
        }
    }

    fn make_client(fs: &Filesystem) -> Arc<Client> {
        let root = fs
            .create_child_entry(fs.root(), "alice", "", 0, DIR_LINK_COUNT, None)
            .unwrap();
        fs.root().add_link();
        Arc::new(Client::new(
            "10.0.0.1:41234".parse().unwrap(),
            false,
            "alice".into(),
            "alice".into(),
            "token".into(),
            false,
            root,
        ))
    }

    fn music() -> FileListing {
        FileListing {
            children: vec![
                file("track.mp3", 4_000_000, H1, 1),
                ListingNode::Directory {
                    name: "live".into(),
                    children: vec![file("encore.mp3", 1_000, H2, 1)],
                },
            ],
        }
    }

    #[test]
    fn test_revision_gate() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);

        assert_eq!(share.bump_revision(1), Some(None));
        assert_eq!(share.bump_revision(1), None);
        assert_eq!(share.bump_revision(0), None);
        assert_eq!(share.bump_revision(2), Some(Some(1)));
        assert_eq!(share.revision(), Some(2));
    }

    #[test]
    fn test_rollback_only_restores_own_bump() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);

        share.bump_revision(1);
        share.bump_revision(2);
        share.bump_revision(3);
        assert!(!share.rollback_revision(2, Some(1)));
        assert_eq!(share.revision(), Some(3));
        assert!(share.rollback_revision(3, Some(2)));
        assert_eq!(share.revision(), Some(2));
    }

    #[test]
    fn test_import_updates_aggregates() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);

        let (files, size) = share.import(&fs, client.root(), &music()).unwrap();
        assert_eq!(files, 2);
        assert_eq!(size, 4_001_000);
        assert_eq!(fs.total_size(), 4_001_000);
        assert_eq!(client.root().size(), 4_001_000);
        assert_eq!(client.root().link_count(), 3);
        assert_eq!(share.entry().unwrap().link_count(), 3);
        assert_eq!(fs.count_files(), 2);
        assert!(fs.verify().is_empty(), "{:?}", fs.verify());
    }

    #[test]
    fn test_reimport_replaces_subtree() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);

        share.import(&fs, client.root(), &music()).unwrap();
        let smaller = FileListing {
            children: vec![file("only.mp3", 10, H2, 1)],
        };
        share.import(&fs, client.root(), &smaller).unwrap();

        assert_eq!(fs.total_size(), 10);
        assert_eq!(fs.count_files(), 1);
        assert!(fs.search_for_hash(H1).is_empty());
        assert!(fs.verify().is_empty(), "{:?}", fs.verify());
    }

    #[test]
    fn test_import_skips_unusable_hashes() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);

        let listing = FileListing {
            children: vec![
                file("future.mp3", 5, H1, 2),
                file("bad.mp3", 5, "H1", 1),
                file("good.mp3", 7, &H2.to_uppercase(), 1),
                file("../escape", 5, H1, 1),
            ],
        };
        let (files, size) = share.import(&fs, client.root(), &listing).unwrap();
        assert_eq!((files, size), (1, 7));
        assert_eq!(fs.search_for_hash(H2).len(), 1);
        assert!(fs.verify().is_empty(), "{:?}", fs.verify());
    }

    #[test]
    fn test_delist_restores_aggregates() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);
        share.import(&fs, client.root(), &music()).unwrap();

        share.delist(&fs);

        assert!(share.is_delisted());
        assert_eq!(fs.total_size(), 0);
        assert_eq!(client.root().size(), 0);
        assert_eq!(client.root().link_count(), DIR_LINK_COUNT);
        assert!(fs.search_for_hash(H1).is_empty());
        assert!(fs.search_for_name("encore").is_empty());
        assert!(fs.verify().is_empty(), "{:?}", fs.verify());

        assert!(share.import(&fs, client.root(), &music()).is_none());
        assert_eq!(fs.count_files(), 0);
    }

    #[test]
    fn test_import_skips_oversized_files() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Flat);

        let listing = FileListing {
            children: vec![
                file("huge.bin", u64::MAX, H1, 1),
                file("half.bin", MAX_FILE_SIZE + 1, H1, 1),
                file("small.bin", 7, H2, 1),
            ],
        };
        let (files, size) = share.import(&fs, client.root(), &listing).unwrap();
        assert_eq!((files, size), (1, 7));
        assert!(fs.search_for_hash(H1).is_empty());

        share.delist(&fs);
        assert_eq!(fs.total_size(), 0);
        assert!(fs.verify().is_empty(), "{:?}", fs.verify());
    }

    #[test]
    fn test_huge_totals_saturate_and_delist_cleanly() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Flat);

        let listing = FileListing {
            children: vec![
                file("a.bin", MAX_FILE_SIZE, H1, 1),
                file("b.bin", MAX_FILE_SIZE, H1, 1),
                file("c.bin", MAX_FILE_SIZE, H2, 1),
            ],
        };
        let (files, size) = share.import(&fs, client.root(), &listing).unwrap();
        assert_eq!(files, 3);
        assert_eq!(size, u64::MAX);
        assert_eq!(fs.total_size(), u64::MAX);
        assert!(fs.verify().is_empty(), "{:?}", fs.verify());

        share.delist(&fs);
        assert_eq!(fs.total_size(), 0);
        assert_eq!(client.root().size(), 0);
        assert_eq!(fs.count_files(), 0);
        assert!(fs.verify().is_empty(), "{:?}", fs.verify());
    }

    #[test]
    fn test_entries_point_back_to_share() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);
        share.import(&fs, client.root(), &music()).unwrap();

        let track = fs.search_for_hash(H1).pop().unwrap();
        let owner = track.share().unwrap().owner().unwrap();
        assert_eq!(owner.alias(), "alice");
        assert!(client.root().share().is_none());
    }

    #[test]
    fn test_download_url() {
        let fs = Filesystem::new();
        let client = make_client(&fs);
        let share = Share::new("music", &client, ShareType::Tree);
        share.import(&fs, client.root(), &music()).unwrap();

        let encore = fs.lookup("/alice/music/live/encore.mp3").unwrap();
        assert_eq!(
            share.download_url(&encore).unwrap(),
            "http://10.0.0.1:41234/shares/music/live/encore.mp3"
        );
    }
}
