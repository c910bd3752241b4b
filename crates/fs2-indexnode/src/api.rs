use crate::avatar::AvatarError;
use crate::chat::{ChatMessage, ChatOutcome};
use crate::client::Client;
use crate::error::HelloError;
use crate::filesystem::Entry;
use crate::registry::HelloRequest;
use crate::service::IndexNode;
use crate::stats::IndexStats;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Body returned by a successful hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    /// Effective alias after collision handling.
    pub alias: String,
    /// How often the indexnode will ping the client.
    pub ping_interval_secs: u64,
    /// Whether the registration is considered secure.
    pub secure: bool,
}

/// One index entry as shown to browsers and searchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryInfo {
    /// Entry name.
    pub name: String,
    /// Absolute path from the index root.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Unix-style link count.
    pub link_count: u64,
    /// True for directories.
    pub is_directory: bool,
    /// Content hash, files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Number of entries sharing the hash, files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<usize>,
    /// Alias of the owning client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Where the file can be fetched from its owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// A directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseResponse {
    /// The browsed entry itself.
    pub entry: EntryInfo,
    /// Its direct children, sorted by name.
    pub children: Vec<EntryInfo>,
}

/// Query string of `/search`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    /// Free-text query.
    #[serde(default)]
    pub q: String,
}

/// Query string of `GET /chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatParams {
    /// Only messages with a larger id are returned.
    #[serde(default)]
    pub since: u64,
}

/// Result of posting to `/chat`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatResponse {
    /// The message was appended to the log.
    Posted(ChatMessage),
    /// Private reply to a slash command.
    Reply(String),
}

/// HTTP front end of an [`IndexNode`].
#[derive(Clone)]
pub struct IndexnodeApi {
    node: Arc<IndexNode>,
}

impl IndexnodeApi {
    /// Wraps `node`.
    pub fn new(node: Arc<IndexNode>) -> Self {
        Self { node }
    }

    /// Builds the router with every handler mounted.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/hello", get(hello_handler).post(hello_handler))
            .route("/browse", get(browse_root_handler))
            .route("/browse/*path", get(browse_handler))
            .route("/search", get(search_handler))
            .route("/alternatives/:hash", get(alternatives_handler))
            .route("/download/:hash", get(download_handler))
            .route("/chat", get(chat_history_handler).post(chat_handler))
            .route("/submitavatar", post(submit_avatar_handler))
            .route("/avatars/:alias", get(avatar_handler))
            .route("/stats", get(stats_handler))
            .with_state(self)
    }

    /// Listens on the configured bind address until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.node.config().bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("indexnode listening on {}", addr);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

fn hello_status(e: &HelloError) -> StatusCode {
    match e {
        HelloError::MissingHeader(_) | HelloError::InvalidHeader { .. } => StatusCode::BAD_REQUEST,
        HelloError::Unreachable { .. } => StatusCode::PRECONDITION_FAILED,
        HelloError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        HelloError::Index(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, HelloError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.trim()))
            .map_err(|_| HelloError::InvalidHeader {
                name,
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            }),
    }
}

fn required_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, HelloError> {
    match header_str(headers, name)? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(HelloError::MissingHeader(name)),
    }
}

fn declared_port(headers: &HeaderMap) -> Result<u16, HelloError> {
    let raw = required_header(headers, "fs2-port")?;
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(HelloError::InvalidHeader {
            name: "fs2-port",
            value: raw.to_string(),
        }),
    }
}

fn parse_hello(remote: SocketAddr, headers: &HeaderMap, secure: bool) -> Result<HelloRequest, HelloError> {
    required_header(headers, "fs2-version")?;
    let cltoken = required_header(headers, "fs2-cltoken")?.to_string();
    let port = declared_port(headers)?;
    let alias = header_str(headers, "fs2-alias")?.unwrap_or_default().to_string();
    Ok(HelloRequest {
        remote: remote.ip(),
        port,
        cltoken,
        alias,
        secure,
    })
}

/// Resolves the registered client a request comes from.
fn requester(node: &IndexNode, remote: SocketAddr, headers: &HeaderMap) -> Result<Arc<Client>, Response> {
    let port = declared_port(headers).map_err(|e| error_response(StatusCode::BAD_REQUEST, e))?;
    node.registry()
        .lookup(remote.ip(), port)
        .ok_or_else(|| error_response(StatusCode::FORBIDDEN, "not a registered client"))
}

fn entry_info(node: &IndexNode, entry: &Arc<Entry>) -> EntryInfo {
    let fs = node.filesystem();
    let is_directory = entry.is_directory();
    let share = entry.share();
    EntryInfo {
        name: entry.name(),
        path: fs.path_of(entry),
        size: entry.size(),
        link_count: entry.link_count(),
        is_directory,
        hash: (!is_directory).then(|| entry.content_hash().to_string()),
        alternatives: (!is_directory).then(|| fs.alternatives_count(entry.content_hash())),
        owner: share.as_ref().and_then(|s| s.owner()).map(|c| c.alias()),
        download_url: if is_directory {
            None
        } else {
            share.and_then(|s| s.download_url(entry))
        },
    }
}

async fn hello_handler(
    State(state): State<Arc<IndexnodeApi>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let request = match parse_hello(remote, &headers, state.node.is_secure_mode()) {
        Ok(request) => request,
        Err(e) => return error_response(hello_status(&e), e),
    };

    match state.node.hello(request).await {
        Ok(client) => Json(HelloResponse {
            alias: client.alias(),
            ping_interval_secs: state.node.config().ping_interval_secs,
            secure: client.is_secure(),
        })
        .into_response(),
        Err(e) => {
            tracing::debug!(%remote, error = %e, "hello rejected");
            error_response(hello_status(&e), e)
        }
    }
}

fn browse_path(node: &IndexNode, path: &str) -> Response {
    let Some(entry) = node.filesystem().lookup(path) else {
        return error_response(StatusCode::NOT_FOUND, format!("no such path: {path}"));
    };
    let children = entry
        .children()
        .iter()
        .map(|child| entry_info(node, child))
        .collect();
    Json(BrowseResponse {
        entry: entry_info(node, &entry),
        children,
    })
    .into_response()
}

async fn browse_root_handler(State(state): State<Arc<IndexnodeApi>>) -> Response {
    browse_path(&state.node, "/")
}

async fn browse_handler(State(state): State<Arc<IndexnodeApi>>, Path(path): Path<String>) -> Response {
    browse_path(&state.node, &path)
}

async fn search_handler(
    State(state): State<Arc<IndexnodeApi>>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<EntryInfo>> {
    let hits = state.node.search(&params.q);
    Json(hits.iter().map(|e| entry_info(&state.node, e)).collect())
}

async fn alternatives_handler(
    State(state): State<Arc<IndexnodeApi>>,
    Path(hash): Path<String>,
) -> Json<Vec<EntryInfo>> {
    let entries = state
        .node
        .filesystem()
        .search_for_hash(&hash.to_ascii_lowercase());
    Json(entries.iter().map(|e| entry_info(&state.node, e)).collect())
}

async fn download_handler(State(state): State<Arc<IndexnodeApi>>, Path(hash): Path<String>) -> Response {
    match state.node.download_url(&hash) {
        Some(url) => Redirect::temporary(&url).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no live source for {hash}")),
    }
}

async fn chat_handler(
    State(state): State<Arc<IndexnodeApi>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let client = match requester(&state.node, remote, &headers) {
        Ok(client) => client,
        Err(response) => return response,
    };
    let text = body.trim();
    if text.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty message");
    }
    match state.node.chat().submit(&client, text) {
        ChatOutcome::Posted(message) => Json(ChatResponse::Posted(message)).into_response(),
        ChatOutcome::Reply(reply) => Json(ChatResponse::Reply(reply)).into_response(),
    }
}

async fn chat_history_handler(
    State(state): State<Arc<IndexnodeApi>>,
    Query(params): Query<ChatParams>,
) -> Json<Vec<ChatMessage>> {
    Json(state.node.chat().log().messages_since(params.since))
}

async fn submit_avatar_handler(
    State(state): State<Arc<IndexnodeApi>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client = match requester(&state.node, remote, &headers) {
        Ok(client) => client,
        Err(response) => return response,
    };
    match state.node.avatars().submit(&client.alias(), body.to_vec()) {
        Ok(hash) => Json(serde_json::json!({ "hash": hash })).into_response(),
        Err(e @ AvatarError::TooLarge { .. }) => error_response(StatusCode::PAYLOAD_TOO_LARGE, e),
        Err(e @ AvatarError::Empty) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn avatar_handler(State(state): State<Arc<IndexnodeApi>>, Path(alias): Path<String>) -> Response {
    match state.node.avatars().get(&alias) {
        Some(avatar) => (
            [
                (header::CONTENT_TYPE, "image/png".to_string()),
                (header::ETAG, format!("\"{}\"", avatar.hash)),
            ],
            avatar.data,
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no avatar for {alias}")),
    }
}

async fn stats_handler(State(state): State<Arc<IndexnodeApi>>) -> Json<IndexStats> {
    Json(state.node.stats().as_ref().clone())
}
