//! Chat log and slash-command dispatch.
//!
//! Plain messages are appended to a bounded log every client can poll.
//! Messages starting with `/` are commands: they are offered to each
//! registered [`ChatCommandable`] in turn and the reply goes only to the
//! issuer.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::info;

use crate::client::Client;
use crate::registry::ClientRegistry;

/// One posted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Monotonic message id.
    pub id: u64,
    /// Alias of the sender at the time of posting.
    pub alias: String,
    /// Message text.
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Result of submitting a line of chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    /// The message was appended to the log.
    Posted(ChatMessage),
    /// A command ran; the reply is for the issuer only.
    Reply(String),
}

/// Extension point for slash commands.
pub trait ChatCommandable: Send + Sync {
    /// Handles `/command args` from `client`, or returns `None` if the
    /// command is not one of ours.
    fn do_command(&self, client: &Arc<Client>, command: &str, args: &str) -> Option<String>;
}

/// Bounded, append-only message history.
#[derive(Debug)]
pub struct ChatLog {
    capacity: usize,
    inner: Mutex<LogInner>,
}

#[derive(Debug)]
struct LogInner {
    next_id: u64,
    messages: VecDeque<ChatMessage>,
}

impl ChatLog {
    /// Creates a log keeping the last `capacity` messages (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(LogInner {
                next_id: 1,
                messages: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Appends a message and returns it with its assigned id.
    pub fn append(&self, alias: &str, message: &str) -> ChatMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut inner = self.inner.lock();
        let entry = ChatMessage {
            id: inner.next_id,
            alias: alias.to_string(),
            message: message.to_string(),
            timestamp,
        };
        inner.next_id += 1;
        if inner.messages.len() == self.capacity {
            inner.messages.pop_front();
        }
        inner.messages.push_back(entry.clone());
        entry
    }

    /// Returns retained messages with an id greater than `since`, oldest first.
    pub fn messages_since(&self, since: u64) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.id > since)
            .cloned()
            .collect()
    }

    /// Id of the newest message, or 0 if none was posted yet.
    pub fn last_id(&self) -> u64 {
        self.inner.lock().next_id - 1
    }
}

/// The chat log plus the registered command handlers.
pub struct Chat {
    log: ChatLog,
    commandables: RwLock<Vec<Arc<dyn ChatCommandable>>>,
}

impl Chat {
    /// Creates a chat with a log of `capacity` messages and no commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            log: ChatLog::new(capacity),
            commandables: RwLock::new(Vec::new()),
        }
    }

    /// Adds a command handler after the ones already registered.
    pub fn register_commandable(&self, commandable: Arc<dyn ChatCommandable>) {
        self.commandables.write().push(commandable);
    }

    /// The message history.
    pub fn log(&self) -> &ChatLog {
        &self.log
    }

    /// Posts `text` from `client` or runs it as a command.
    pub fn submit(&self, client: &Arc<Client>, text: &str) -> ChatOutcome {
        let Some(line) = text.strip_prefix('/') else {
            return ChatOutcome::Posted(self.log.append(&client.alias(), text));
        };

        let (command, args) = match line.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (line, ""),
        };
        let commandables = self.commandables.read().clone();
        let reply = commandables
            .iter()
            .find_map(|c| c.do_command(client, command, args))
            .unwrap_or_else(|| format!("Unknown command: /{command}"));
        ChatOutcome::Reply(reply)
    }
}

/// Built-in commands operating on the client registry: `/who` and `/kick`.
pub struct RegistryCommands {
    registry: Weak<ClientRegistry>,
    secure_mode: bool,
}

impl RegistryCommands {
    /// Creates the handler. In secure mode `/kick` also requires the issuer
    /// to be connected securely.
    pub fn new(registry: &Arc<ClientRegistry>, secure_mode: bool) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            secure_mode,
        }
    }

    fn kick(&self, registry: &ClientRegistry, issuer: &Arc<Client>, target: &str) -> String {
        let issuer_alias = issuer.alias();
        if !registry.users().is_admin(&issuer_alias) || (self.secure_mode && !issuer.is_secure()) {
            return "Permission denied".to_string();
        }
        if target.is_empty() {
            return "Usage: /kick <alias>".to_string();
        }
        match registry.find_by_alias(target) {
            Some(victim) => {
                info!(issuer = %issuer_alias, target, "kicking client");
                registry.destroy(&victim);
                format!("Kicked {target}")
            }
            None => format!("No such client: {target}"),
        }
    }
}

impl ChatCommandable for RegistryCommands {
    fn do_command(&self, client: &Arc<Client>, command: &str, args: &str) -> Option<String> {
        let registry = self.registry.upgrade()?;
        match command {
            "who" => {
                let aliases: Vec<String> = registry.clients().iter().map(|c| c.alias()).collect();
                Some(format!("{} online: {}", aliases.len(), aliases.join(", ")))
            }
            "kick" => Some(self.kick(&registry, client, args)),
            _ => None,
        }
    }
}
