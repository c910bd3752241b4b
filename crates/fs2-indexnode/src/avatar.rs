//! Avatar images submitted by clients, keyed by alias.

use std::fmt::Write as _;
use std::time::SystemTime;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reasons an avatar is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AvatarError {
    /// The body was empty.
    #[error("avatar is empty")]
    Empty,

    /// The body exceeded the configured limit.
    #[error("avatar is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Submitted size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// A stored avatar.
#[derive(Debug, Clone)]
pub struct Avatar {
    /// Image bytes as submitted.
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`, usable as an ETag.
    pub hash: String,
    /// Submission time.
    pub updated_at: SystemTime,
}

/// In-memory avatar store.
#[derive(Debug)]
pub struct AvatarStore {
    max_bytes: usize,
    avatars: DashMap<String, Avatar>,
}

impl AvatarStore {
    /// Creates a store accepting avatars of up to `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            avatars: DashMap::new(),
        }
    }

    /// Stores `data` as the avatar of `alias`, replacing any previous one.
    /// Returns the content hash.
    pub fn submit(&self, alias: &str, data: Vec<u8>) -> Result<String, AvatarError> {
        if data.is_empty() {
            return Err(AvatarError::Empty);
        }
        if data.len() > self.max_bytes {
            return Err(AvatarError::TooLarge {
                size: data.len(),
                limit: self.max_bytes,
            });
        }

        let hash = Sha256::digest(&data).iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        });
        self.avatars.insert(
            alias.to_string(),
            Avatar {
                data,
                hash: hash.clone(),
                updated_at: SystemTime::now(),
            },
        );
        Ok(hash)
    }

    /// Returns the avatar of `alias`.
    pub fn get(&self, alias: &str) -> Option<Avatar> {
        self.avatars.get(alias).map(|a| a.value().clone())
    }

    /// Drops avatars whose alias is no longer live. Returns how many.
    pub fn retain_aliases<F>(&self, mut is_live: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.avatars.len();
        self.avatars.retain(|alias, _| is_live(alias));
        before - self.avatars.len()
    }

    /// Number of stored avatars.
    pub fn len(&self) -> usize {
        self.avatars.len()
    }

    /// True if no avatar is stored.
    pub fn is_empty(&self) -> bool {
        self.avatars.is_empty()
    }
}
