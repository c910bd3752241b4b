//! In-memory filesystem index.
//!
//! The index is a tree of [`Entry`] nodes rooted at [`Filesystem::root`], plus
//! two secondary indices over the same entries: content hash to files, and
//! filename keyword to entries. The tree owns its entries through the
//! `children` maps; both secondary indices only hold extra references that
//! are removed explicitly by [`Filesystem::erase`].
//!
//! Directory aggregates (`size`, `link_count`) are maintained incrementally by
//! callers. [`Filesystem::create_child_entry`] and [`Filesystem::erase`] never
//! touch ancestors; see [`Filesystem::add_size_upward`].
//!
//! Locking is per map: each directory's children map, the hash index, and the
//! keyword index each have their own lock. A children lock is never acquired
//! while an index lock is held.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::IndexError;
use crate::keywords::keywords;
use crate::share::Share;

/// Link count of an empty directory.
pub const DIR_LINK_COUNT: u64 = 2;
/// Link count of every file.
pub const FILE_LINK_COUNT: u64 = 1;

/// Identity of an entry within one [`Filesystem`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A directory or file in the index.
///
/// Equality and hashing use the entry's identity, not its contents, so two
/// clients sharing the same file yield two distinct entries in one hash bucket.
pub struct Entry {
    id: EntryId,
    name: RwLock<String>,
    hash: String,
    size: AtomicU64,
    link_count: AtomicU64,
    parent: Weak<Entry>,
    children: RwLock<BTreeMap<String, Arc<Entry>>>,
    share: Option<Weak<Share>>,
}

impl Entry {
    fn new(
        id: EntryId,
        name: String,
        hash: String,
        size: u64,
        link_count: u64,
        parent: Weak<Entry>,
        share: Option<Weak<Share>>,
    ) -> Self {
        Self {
            id,
            name: RwLock::new(name),
            hash,
            size: AtomicU64::new(size),
            link_count: AtomicU64::new(link_count),
            parent,
            children: RwLock::new(BTreeMap::new()),
            share,
        }
    }

    /// Returns the entry's identity.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Returns the entry's current name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Returns the content hash; empty for directories.
    pub fn content_hash(&self) -> &str {
        &self.hash
    }

    /// Returns true if this entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.hash.is_empty()
    }

    /// Size in bytes; for directories the sum over all descendant files.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Two plus the number of child directories, or one for files.
    pub fn link_count(&self) -> u64 {
        self.link_count.load(Ordering::Acquire)
    }

    /// Cheap check for child directories using the link count.
    pub fn has_child_directories(&self) -> bool {
        self.is_directory() && self.link_count() > DIR_LINK_COUNT
    }

    /// Returns the parent entry, or `None` for the root or a detached entry.
    pub fn parent(&self) -> Option<Arc<Entry>> {
        self.parent.upgrade()
    }

    /// Looks up a direct child by name.
    pub fn child(&self, name: &str) -> Option<Arc<Entry>> {
        self.children.read().get(name).cloned()
    }

    /// Returns the direct children sorted by name.
    pub fn children(&self) -> Vec<Arc<Entry>> {
        self.children.read().values().cloned().collect()
    }

    /// Number of direct children.
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Returns the share this entry was imported from.
    ///
    /// `None` for the root, per-client directories, and entries whose share
    /// has already been dropped.
    pub fn share(&self) -> Option<Arc<Share>> {
        self.share.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_aggregates(&self, size: u64, link_count: u64) {
        self.size.store(size, Ordering::Release);
        self.link_count.store(link_count, Ordering::Release);
    }

    // Sizes are client-reported; aggregates saturate instead of wrapping.
    pub(crate) fn grow(&self, bytes: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(s.saturating_add(bytes)));
    }

    pub(crate) fn shrink(&self, bytes: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(s.saturating_sub(bytes)));
    }

    pub(crate) fn add_link(&self) {
        self.link_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_link(&self) {
        let _ = self
            .link_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("hash", &self.hash)
            .field("size", &self.size())
            .field("link_count", &self.link_count())
            .finish()
    }
}

/// One hash bucket as reported by [`Filesystem::popular_files`].
#[derive(Clone, Debug)]
pub struct PopularFile {
    /// Representative entry of the bucket.
    pub entry: Arc<Entry>,
    /// Number of entries sharing this hash.
    pub alternatives: usize,
}

type EntrySet = HashSet<Arc<Entry>>;

/// The indexnode's aggregated namespace.
pub struct Filesystem {
    root: Arc<Entry>,
    next_id: AtomicU64,
    hash_index: RwLock<HashMap<String, EntrySet>>,
    keyword_index: RwLock<HashMap<String, EntrySet>>,
    file_count: AtomicU64,
}

impl Filesystem {
    /// Creates an empty index containing only the root directory.
    pub fn new() -> Self {
        let root = Arc::new(Entry::new(
            EntryId(0),
            String::new(),
            String::new(),
            0,
            DIR_LINK_COUNT,
            Weak::new(),
            None,
        ));
        Self {
            root,
            next_id: AtomicU64::new(1),
            hash_index: RwLock::new(HashMap::new()),
            keyword_index: RwLock::new(HashMap::new()),
            file_count: AtomicU64::new(0),
        }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Arc<Entry> {
        &self.root
    }

    /// Inserts a new child under `parent` and registers it in the secondary
    /// indices. An empty `hash` makes a directory.
    ///
    /// Ancestor aggregates are left untouched.
    pub fn create_child_entry(
        &self,
        parent: &Arc<Entry>,
        name: &str,
        hash: &str,
        size: u64,
        link_count: u64,
        share: Option<&Arc<Share>>,
    ) -> Result<Arc<Entry>, IndexError> {
        if !parent.is_directory() {
            return Err(IndexError::NotADirectory(parent.name()));
        }

        let entry = Arc::new(Entry::new(
            EntryId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            name.to_string(),
            hash.to_string(),
            size,
            link_count,
            Arc::downgrade(parent),
            share.map(Arc::downgrade),
        ));

        {
            let mut children = parent.children.write();
            if children.contains_key(name) {
                return Err(IndexError::DuplicateName {
                    parent: parent.name(),
                    name: name.to_string(),
                });
            }
            children.insert(name.to_string(), entry.clone());
        }

        if !entry.is_directory() {
            self.hash_index
                .write()
                .entry(entry.hash.clone())
                .or_default()
                .insert(entry.clone());
            self.file_count.fetch_add(1, Ordering::AcqRel);
        }

        self.index_keywords(&entry, name);
        Ok(entry)
    }

    /// Removes `entry` and its whole subtree from the tree and both indices.
    ///
    /// The (former) parent's aggregates are not adjusted; callers do that
    /// before erasing.
    pub fn erase(&self, entry: &Arc<Entry>) {
        if let Some(parent) = entry.parent() {
            let mut children = parent.children.write();
            let name = entry.name.read();
            if children.get(name.as_str()).is_some_and(|c| c.id == entry.id) {
                children.remove(name.as_str());
            }
        }

        let mut doomed = Vec::new();
        let mut stack = vec![entry.clone()];
        while let Some(next) = stack.pop() {
            let children = std::mem::take(&mut *next.children.write());
            stack.extend(children.into_values());
            doomed.push(next);
        }

        {
            let mut keyword_index = self.keyword_index.write();
            for e in &doomed {
                for kw in keywords(&e.name.read()) {
                    if let Some(set) = keyword_index.get_mut(&kw) {
                        set.remove(e);
                        if set.is_empty() {
                            keyword_index.remove(&kw);
                        }
                    }
                }
            }
        }

        let mut hash_index = self.hash_index.write();
        for e in doomed.iter().filter(|e| !e.is_directory()) {
            if let Some(set) = hash_index.get_mut(&e.hash) {
                if set.remove(e) {
                    self.file_count.fetch_sub(1, Ordering::AcqRel);
                }
                if set.is_empty() {
                    hash_index.remove(&e.hash);
                }
            }
        }
    }

    /// Renames `entry` within its parent and re-indexes its keywords.
    pub fn rename(&self, entry: &Arc<Entry>, new_name: &str) -> Result<(), IndexError> {
        let old_name = entry.name();
        if old_name == new_name {
            return Ok(());
        }

        if let Some(parent) = entry.parent() {
            let mut children = parent.children.write();
            if children.contains_key(new_name) {
                return Err(IndexError::DuplicateName {
                    parent: parent.name(),
                    name: new_name.to_string(),
                });
            }
            if children.get(&old_name).is_some_and(|c| c.id == entry.id) {
                children.remove(&old_name);
            }
            children.insert(new_name.to_string(), entry.clone());
            *entry.name.write() = new_name.to_string();
        } else {
            *entry.name.write() = new_name.to_string();
        }

        {
            let mut keyword_index = self.keyword_index.write();
            for kw in keywords(&old_name) {
                if let Some(set) = keyword_index.get_mut(&kw) {
                    set.remove(entry);
                    if set.is_empty() {
                        keyword_index.remove(&kw);
                    }
                }
            }
        }
        self.index_keywords(entry, new_name);
        Ok(())
    }

    fn index_keywords(&self, entry: &Arc<Entry>, name: &str) {
        let mut keyword_index = self.keyword_index.write();
        for kw in keywords(name) {
            keyword_index.entry(kw).or_default().insert(entry.clone());
        }
    }

    /// Adds `bytes` to the size of `from` and of every ancestor up to the root.
    pub fn add_size_upward(&self, from: &Arc<Entry>, bytes: u64) {
        self.walk_upward(from, bytes, Entry::grow);
    }

    /// Takes `bytes` off the size of `from` and of every ancestor up to the root.
    pub fn sub_size_upward(&self, from: &Arc<Entry>, bytes: u64) {
        self.walk_upward(from, bytes, Entry::shrink);
    }

    fn walk_upward(&self, from: &Arc<Entry>, bytes: u64, apply: fn(&Entry, u64)) {
        if bytes == 0 {
            return;
        }
        let mut cursor = Some(from.clone());
        while let Some(entry) = cursor {
            apply(&entry, bytes);
            cursor = entry.parent();
        }
    }

    /// Returns every file with the given content hash, ordered by identity.
    pub fn search_for_hash(&self, hash: &str) -> Vec<Arc<Entry>> {
        let mut found: Vec<Arc<Entry>> = self
            .hash_index
            .read()
            .get(hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        found.sort_by_key(|e| e.id);
        found
    }

    /// Number of entries sharing `hash`.
    pub fn alternatives_count(&self, hash: &str) -> usize {
        self.hash_index.read().get(hash).map_or(0, HashSet::len)
    }

    /// Returns entries whose names contain every keyword of `query`.
    pub fn search_for_name(&self, query: &str) -> Vec<Arc<Entry>> {
        let tokens = keywords(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let keyword_index = self.keyword_index.read();
        let mut sets = Vec::with_capacity(tokens.len());
        for token in &tokens {
            match keyword_index.get(token) {
                Some(set) => sets.push(set),
                None => return Vec::new(),
            }
        }
        sets.sort_by_key(|s| s.len());

        let (smallest, rest) = sets.split_at(1);
        let mut found: Vec<Arc<Entry>> = smallest[0]
            .iter()
            .filter(|e| rest.iter().all(|s| s.contains(*e)))
            .cloned()
            .collect();
        drop(keyword_index);

        found.sort_by_key(|e| e.id);
        found
    }

    /// Returns up to `limit` hash buckets, largest first, one entry each.
    ///
    /// This scans and sorts the whole hash index; callers cache the result.
    pub fn popular_files(&self, limit: usize) -> Vec<PopularFile> {
        let mut buckets: Vec<(usize, Arc<Entry>)> = self
            .hash_index
            .read()
            .values()
            .filter_map(|set| {
                set.iter()
                    .min_by_key(|e| e.id)
                    .map(|rep| (set.len(), rep.clone()))
            })
            .collect();
        buckets.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.hash.cmp(&b.1.hash)));
        buckets
            .into_iter()
            .take(limit)
            .map(|(alternatives, entry)| PopularFile {
                entry,
                alternatives,
            })
            .collect()
    }

    /// Number of file entries in the index.
    pub fn count_files(&self) -> u64 {
        self.file_count.load(Ordering::Acquire)
    }

    /// Number of distinct content hashes.
    pub fn count_unique_files(&self) -> u64 {
        self.hash_index.read().len() as u64
    }

    /// Total bytes across all files, duplicates included.
    pub fn total_size(&self) -> u64 {
        self.root.size()
    }

    /// Bytes across distinct content hashes.
    pub fn unique_size(&self) -> u64 {
        self.hash_index
            .read()
            .values()
            .filter_map(|set| set.iter().next().map(|e| e.size()))
            .fold(0u64, u64::saturating_add)
    }

    /// Resolves a `/`-separated path from the root.
    pub fn lookup(&self, path: &str) -> Option<Arc<Entry>> {
        let mut cursor = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            cursor = cursor.child(segment)?;
        }
        Some(cursor)
    }

    /// Returns the absolute path of `entry`, e.g. `/alice/music/track.mp3`.
    pub fn path_of(&self, entry: &Arc<Entry>) -> String {
        let mut segments = Vec::new();
        let mut cursor = Some(entry.clone());
        while let Some(e) = cursor {
            if e.id == self.root.id {
                break;
            }
            segments.push(e.name());
            cursor = e.parent();
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Walks the whole tree and both indices and reports every inconsistency.
    ///
    /// Expensive; intended for tests and diagnostics.
    pub fn verify(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut live = HashSet::new();
        let mut files = 0u64;
        self.verify_dir(&self.root, &mut live, &mut files, &mut problems);

        if files != self.count_files() {
            problems.push(format!(
                "file counter {} but tree holds {} files",
                self.count_files(),
                files
            ));
        }

        let hash_index = self.hash_index.read();
        for e in live.iter().filter(|e| !e.is_directory()) {
            if !hash_index.get(&e.hash).is_some_and(|s| s.contains(e)) {
                problems.push(format!("file {:?} missing from hash index", e.id));
            }
        }
        for (hash, set) in hash_index.iter() {
            for e in set {
                if !live.contains(e) {
                    problems.push(format!("hash {hash} references erased {:?}", e.id));
                }
            }
        }
        drop(hash_index);

        let keyword_index = self.keyword_index.read();
        for e in &live {
            for kw in keywords(&e.name()) {
                if !keyword_index.get(&kw).is_some_and(|s| s.contains(e)) {
                    problems.push(format!("{:?} missing from keyword '{kw}'", e.id));
                }
            }
        }
        for (kw, set) in keyword_index.iter() {
            for e in set {
                if !live.contains(e) {
                    problems.push(format!("keyword '{kw}' references erased {:?}", e.id));
                }
            }
        }

        problems
    }

    fn verify_dir(
        &self,
        dir: &Arc<Entry>,
        live: &mut HashSet<Arc<Entry>>,
        files: &mut u64,
        problems: &mut Vec<String>,
    ) {
        let mut size = 0u64;
        let mut links = DIR_LINK_COUNT;
        for child in dir.children() {
            if child.parent().map(|p| p.id) != Some(dir.id) {
                problems.push(format!("{:?} has a stale parent link", child.id));
            }
            if child.is_directory() {
                links += 1;
                self.verify_dir(&child, live, files, problems);
            } else {
                *files += 1;
                if child.link_count() != FILE_LINK_COUNT {
                    problems.push(format!("file {:?} has link count {}", child.id, child.link_count()));
                }
            }
            size = size.saturating_add(child.size());
            live.insert(child);
        }
        if dir.size() != size {
            problems.push(format!("{:?} size {} but children sum to {size}", dir.id, dir.size()));
        }
        if dir.link_count() != links {
            problems.push(format!("{:?} link count {} but expected {links}", dir.id, dir.link_count()));
        }
    }
}

impl Default for Filesystem {
    fn default() -> Self {
        Self::new()
    }
}
