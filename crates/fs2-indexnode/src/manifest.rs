//! Wire formats clients use to describe their shares.
//!
//! A client publishes a small share manifest (one [`ShareDescriptor`] per
//! share) and, per share, a full file list in one of two formats:
//!
//! - [`ShareType::Tree`]: a nested document of `directory` and `file`
//!   elements, the outermost element being the share root directory.
//! - [`ShareType::Flat`]: an object keyed by `/`-separated path relative to the
//!   share root. Intermediate directories are implied; a key ending in `/`
//!   declares an (otherwise empty) directory.
//!
//! Both parse into the same [`FileListing`], which is all the importer sees.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PeerError;

/// Digest algorithm version the indexnode understands.
pub const EXPECTED_HASH_VERSION: u32 = 1;

/// Length of a well-formed hex digest.
pub const HASH_HEX_LEN: usize = 32;

/// Largest file size accepted from a client listing.
pub const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// File list format of one share.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    /// Nested directory/file document.
    Tree,
    /// Path-keyed flattened document.
    Flat,
}

/// One row of a client's share manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareDescriptor {
    /// Share name, unique per client.
    pub name: String,
    /// Client-side revision of the share.
    pub revision: u64,
    /// Format of the share's file list.
    #[serde(rename = "type")]
    pub share_type: ShareType,
}

/// A node of a parsed file list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListingNode {
    /// A directory and its contents.
    Directory {
        /// Directory name.
        name: String,
        /// Contents in document order.
        children: Vec<ListingNode>,
    },
    /// A file.
    File {
        /// File name.
        name: String,
        /// Size in bytes.
        size: u64,
        /// Content digest as hex.
        hash: String,
        /// Digest algorithm version tag.
        hash_version: u32,
    },
}

impl ListingNode {
    /// Returns the node's name.
    pub fn name(&self) -> &str {
        match self {
            ListingNode::Directory { name, .. } | ListingNode::File { name, .. } => name,
        }
    }
}

/// The contents of one share's root directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileListing {
    /// Top-level entries of the share.
    pub children: Vec<ListingNode>,
}

/// Returns true for a 32 character hexadecimal digest.
pub fn is_well_formed_hash(hash: &str) -> bool {
    hash.len() == HASH_HEX_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns true if `name` can be used as a single path component.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Parses the share manifest served by a client.
pub fn parse_share_manifest(body: &[u8]) -> Result<Vec<ShareDescriptor>, PeerError> {
    Ok(serde_json::from_slice(body)?)
}

/// Parses a file list in the given format.
pub fn parse_file_list(share_type: ShareType, body: &[u8]) -> Result<FileListing, PeerError> {
    match share_type {
        ShareType::Tree => parse_tree(body),
        ShareType::Flat => parse_flat(body),
    }
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum TreeElement {
    Directory {
        #[serde(default)]
        name: String,
        #[serde(default)]
        children: Vec<TreeElement>,
    },
    File {
        name: String,
        size: u64,
        hash: String,
        #[serde(rename = "hash-version")]
        hash_version: u32,
    },
}

impl From<TreeElement> for ListingNode {
    fn from(element: TreeElement) -> Self {
        match element {
            TreeElement::Directory { name, children } => ListingNode::Directory {
                name,
                children: children.into_iter().map(ListingNode::from).collect(),
            },
            TreeElement::File {
                name,
                size,
                hash,
                hash_version,
            } => ListingNode::File {
                name,
                size,
                hash,
                hash_version,
            },
        }
    }
}

fn parse_tree(body: &[u8]) -> Result<FileListing, PeerError> {
    match serde_json::from_slice::<TreeElement>(body)? {
        TreeElement::Directory { children, .. } => Ok(FileListing {
            children: children.into_iter().map(ListingNode::from).collect(),
        }),
        TreeElement::File { .. } => Err(PeerError::Malformed(
            "tree file list root must be a directory".to_string(),
        )),
    }
}

#[derive(Deserialize)]
struct FlatRecord {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    hash: String,
    #[serde(rename = "hash-version", default)]
    hash_version: u32,
}

enum FlatNode {
    Dir(BTreeMap<String, FlatNode>),
    File(FlatRecord),
}

fn parse_flat(body: &[u8]) -> Result<FileListing, PeerError> {
    let records: BTreeMap<String, FlatRecord> = serde_json::from_slice(body)?;

    let mut root: BTreeMap<String, FlatNode> = BTreeMap::new();
    for (path, record) in records {
        let is_dir = path.ends_with('/');
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, parents)) = segments.split_last() else {
            continue;
        };

        let Some(dir) = descend(&mut root, parents) else {
            debug!(path = %path, "skipping flat file list entry below a file");
            continue;
        };
        if dir.contains_key(*leaf) {
            debug!(path = %path, "skipping duplicate flat file list entry");
            continue;
        }

        let node = if is_dir {
            FlatNode::Dir(BTreeMap::new())
        } else {
            FlatNode::File(record)
        };
        dir.insert(leaf.to_string(), node);
    }

    Ok(FileListing {
        children: flat_to_nodes(root),
    })
}

fn descend<'a>(
    mut dir: &'a mut BTreeMap<String, FlatNode>,
    parents: &[&str],
) -> Option<&'a mut BTreeMap<String, FlatNode>> {
    for segment in parents {
        let node = dir
            .entry(segment.to_string())
            .or_insert_with(|| FlatNode::Dir(BTreeMap::new()));
        match node {
            FlatNode::Dir(children) => dir = children,
            FlatNode::File(_) => return None,
        }
    }
    Some(dir)
}

fn flat_to_nodes(dir: BTreeMap<String, FlatNode>) -> Vec<ListingNode> {
    dir.into_iter()
        .map(|(name, node)| match node {
            FlatNode::Dir(children) => ListingNode::Directory {
                name,
                children: flat_to_nodes(children),
            },
            FlatNode::File(record) => ListingNode::File {
                name,
                size: record.size,
                hash: record.hash,
                hash_version: record.hash_version,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const H1: &str = "0123456789abcdef0123456789abcdef";

    fn file(name: &str, size: u64) -> ListingNode {
        ListingNode::File {
            name: name.to_string(),
            size,
            hash: H1.to_string(),
            hash_version: 1,
        }
    }

    #[test]
    fn test_parse_share_manifest() {
        let body = br#"[
            {"name": "music", "revision": 3, "type": "tree"},
            {"name": "films", "revision": 1, "type": "flat"}
        ]"#;
        let shares = parse_share_manifest(body).unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].name, "music");
        assert_eq!(shares[0].revision, 3);
        assert_eq!(shares[1].share_type, ShareType::Flat);
    }

    #[test]
    fn test_parse_share_manifest_rejects_unknown_type() {
        let body = br#"[{"name": "music", "revision": 3, "type": "xml"}]"#;
        assert!(matches!(
            parse_share_manifest(body),
            Err(PeerError::Malformed(_))
        ));
    }

    #[test]
    fn test_tree_and_flat_agree() {
        let tree = format!(
            r#"{{"directory": {{"name": "music", "children": [
                {{"file": {{"name": "a.mp3", "size": 10, "hash": "{H1}", "hash-version": 1}}}},
                {{"directory": {{"name": "live", "children": [
                    {{"file": {{"name": "b.mp3", "size": 20, "hash": "{H1}", "hash-version": 1}}}}
                ]}}}}
            ]}}}}"#
        );
        let flat = format!(
            r#"{{
                "a.mp3": {{"size": 10, "hash": "{H1}", "hash-version": 1}},
                "live/b.mp3": {{"size": 20, "hash": "{H1}", "hash-version": 1}}
            }}"#
        );

        let from_tree = parse_file_list(ShareType::Tree, tree.as_bytes()).unwrap();
        let from_flat = parse_file_list(ShareType::Flat, flat.as_bytes()).unwrap();

        let expected = FileListing {
            children: vec![
                file("a.mp3", 10),
                ListingNode::Directory {
                    name: "live".into(),
                    children: vec![file("b.mp3", 20)],
                },
            ],
        };
        assert_eq!(from_tree, expected);
        assert_eq!(from_flat, expected);
    }

    #[test]
    fn test_flat_explicit_empty_directory() {
        let listing = parse_file_list(ShareType::Flat, br#"{"empty/": {}}"#).unwrap();
        assert_eq!(
            listing.children,
            vec![ListingNode::Directory {
                name: "empty".into(),
                children: vec![]
            }]
        );
    }

    #[test]
    fn test_flat_collision_skipped() {
        let body = format!(
            r#"{{
                "a": {{"size": 1, "hash": "{H1}", "hash-version": 1}},
                "a/b": {{"size": 2, "hash": "{H1}", "hash-version": 1}}
            }}"#
        );
        let listing = parse_file_list(ShareType::Flat, body.as_bytes()).unwrap();
        assert_eq!(listing.children, vec![file("a", 1)]);
    }

    #[test]
    fn test_tree_root_must_be_directory() {
        let body = format!(r#"{{"file": {{"name": "x", "size": 1, "hash": "{H1}", "hash-version": 1}}}}"#);
        assert!(matches!(
            parse_file_list(ShareType::Tree, body.as_bytes()),
            Err(PeerError::Malformed(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_file_list(ShareType::Tree, b"<filelist>"),
            Err(PeerError::Malformed(_))
        ));
    }

    #[test]
    fn test_hash_well_formedness() {
        assert!(is_well_formed_hash(H1));
        assert!(is_well_formed_hash(&H1.to_uppercase()));
        assert!(!is_well_formed_hash("H1"));
        assert!(!is_well_formed_hash(""));
        assert!(!is_well_formed_hash(&"g".repeat(32)));
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("music"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("a/b"));
    }
}
