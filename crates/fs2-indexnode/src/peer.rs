//! Outbound calls from the indexnode to registered clients.
//!
//! Everything the indexnode needs from a client goes through
//! [`PeerTransport`]: the reachability probe, the share manifest and the per
//! share file list. [`HttpPeerTransport`] is the production implementation;
//! tests substitute an in-process one.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use crate::error::PeerError;

/// Protocol version sent in the `fs2-version` header.
pub const PROTOCOL_VERSION: &str = "fs2protocol-0.13";

/// Client-side requests the indexnode performs.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Confirms the client at `peer` is reachable.
    async fn ping(&self, peer: SocketAddr, cltoken: &str) -> Result<(), PeerError>;

    /// Fetches the raw share manifest.
    async fn fetch_manifest(&self, peer: SocketAddr) -> Result<Vec<u8>, PeerError>;

    /// Fetches the raw file list of one share.
    async fn fetch_file_list(&self, peer: SocketAddr, share: &str) -> Result<Vec<u8>, PeerError>;
}

/// Builds `http://{peer}/{segments...}` with each segment percent-encoded.
pub fn peer_url<'a, I>(peer: SocketAddr, segments: I) -> Result<Url, PeerError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut url = Url::parse(&format!("http://{peer}/"))
        .map_err(|e| PeerError::Malformed(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| PeerError::Malformed(format!("cannot build path for {peer}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// URL a downloader fetches a file from, given its path inside the share.
pub fn download_url(peer: SocketAddr, share: &str, path: &[String]) -> Option<String> {
    let segments = std::iter::once("shares")
        .chain(std::iter::once(share))
        .chain(path.iter().map(String::as_str));
    peer_url(peer, segments).ok().map(String::from)
}

/// [`PeerTransport`] over plain HTTP with bounded timeouts.
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    /// Creates a transport whose every request is bounded by `timeout`.
    ///
    /// Fails if the HTTP client cannot be built; there is no unbounded
    /// fallback.
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, peer: SocketAddr, url: Url, cltoken: Option<&str>) -> Result<Vec<u8>, PeerError> {
        let mut request = self
            .client
            .get(url.clone())
            .header("fs2-version", PROTOCOL_VERSION);
        if let Some(token) = cltoken {
            request = request.header("fs2-cltoken", token);
        }

        let response = request.send().await.map_err(|e| classify(peer, e))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(PeerError::NotFound {
                url: url.to_string(),
            }),
            status if !status.is_success() => Err(PeerError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
            _ => Ok(response
                .bytes()
                .await
                .map_err(|e| classify(peer, e))?
                .to_vec()),
        }
    }
}

fn classify(peer: SocketAddr, e: reqwest::Error) -> PeerError {
    if e.is_timeout() {
        PeerError::Timeout {
            addr: peer.to_string(),
        }
    } else {
        PeerError::Io {
            addr: peer.to_string(),
            msg: e.to_string(),
        }
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn ping(&self, peer: SocketAddr, cltoken: &str) -> Result<(), PeerError> {
        let url = peer_url(peer, ["ping"])?;
        self.get(peer, url, Some(cltoken)).await.map(|_| ())
    }

    async fn fetch_manifest(&self, peer: SocketAddr) -> Result<Vec<u8>, PeerError> {
        let url = peer_url(peer, ["shares"])?;
        self.get(peer, url, None).await
    }

    async fn fetch_file_list(&self, peer: SocketAddr, share: &str) -> Result<Vec<u8>, PeerError> {
        let url = peer_url(peer, ["filelists", share])?;
        self.get(peer, url, None).await
    }
}
