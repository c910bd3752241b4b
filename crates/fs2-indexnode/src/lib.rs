#![warn(missing_docs)]

//! FS2 indexnode: client registry, revision-gated share refresh, and the
//! in-memory filesystem index they feed.

pub mod api;
pub mod avatar;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod keywords;
pub mod liveness;
pub mod manifest;
pub mod peer;
pub mod refresh;
pub mod registry;
pub mod service;
pub mod share;
pub mod stats;
pub mod users;

pub use api::IndexnodeApi;
pub use chat::{Chat, ChatCommandable, ChatLog, ChatMessage, ChatOutcome};
pub use client::Client;
pub use config::IndexnodeConfig;
pub use error::{HelloError, IndexError, PeerError};
pub use filesystem::{Entry, EntryId, Filesystem};
pub use peer::{HttpPeerTransport, PeerTransport};
pub use refresh::{RefreshJob, RefreshPipeline};
pub use registry::{ClientRegistry, HelloRequest};
pub use service::{AdvertInfo, IndexNode};
pub use share::{RefreshOutcome, Share};
pub use stats::IndexStats;
pub use users::{StaticUserDirectory, UserDirectory};
