//! Push transport abstraction

use crate::utils::errors::{ResilienceError, ResilienceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Kind of row change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl FromStr for ChangeKind {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(ResilienceError::Validation(format!("unknown change kind '{}'", other))),
        }
    }
}

/// Which change kinds a subscription wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventFilter {
    #[default]
    All,
    Insert,
    Update,
    Delete,
}

impl EventFilter {
    pub fn matches(self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (EventFilter::All, _)
                | (EventFilter::Insert, ChangeKind::Insert)
                | (EventFilter::Update, ChangeKind::Update)
                | (EventFilter::Delete, ChangeKind::Delete)
        )
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::All => write!(f, "*"),
            EventFilter::Insert => write!(f, "insert"),
            EventFilter::Update => write!(f, "update"),
            EventFilter::Delete => write!(f, "delete"),
        }
    }
}

/// What a transport channel listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelTopic {
    pub table: String,
    pub filter: EventFilter,
}

impl ChannelTopic {
    pub fn new(table: impl Into<String>, filter: EventFilter) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }

    pub fn accepts(&self, table: &str, kind: ChangeKind) -> bool {
        self.table == table && self.filter.matches(kind)
    }
}

impl fmt::Display for ChannelTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.filter)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Opaque handle for an open channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Delivery callback installed on a channel
pub type EventHandler = Arc<dyn Fn(RealtimeEvent) + Send + Sync>;

/// Push transport supplied by the host application
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a channel for `topic`; `handler` receives every matching event
    async fn subscribe(&self, topic: &ChannelTopic, handler: EventHandler) -> ResilienceResult<ChannelHandle>;

    /// Close a channel. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: ChannelHandle) -> ResilienceResult<()>;
}

/// In-process transport. Events are injected with [`InMemoryTransport::publish`]
/// and delivered synchronously to every matching channel.
#[derive(Default)]
pub struct InMemoryTransport {
    channels: DashMap<ChannelHandle, (ChannelTopic, EventHandler)>,
    next_id: AtomicU64,
    opened: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a change event. Returns the number of channels it reached.
    pub fn publish(&self, table: &str, kind: ChangeKind, payload: serde_json::Value) -> usize {
        let handlers: Vec<EventHandler> = self
            .channels
            .iter()
            .filter(|entry| entry.value().0.accepts(table, kind))
            .map(|entry| entry.value().1.clone())
            .collect();

        let event = RealtimeEvent {
            table: table.to_string(),
            kind,
            payload,
            received_at: Utc::now(),
        };
        for handler in &handlers {
            handler(event.clone());
        }
        handlers.len()
    }

    /// Channels currently open
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Channels opened over the transport's lifetime
    pub fn opened_total(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn topics(&self) -> Vec<ChannelTopic> {
        self.channels.iter().map(|entry| entry.value().0.clone()).collect()
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryTransport {
    async fn subscribe(&self, topic: &ChannelTopic, handler: EventHandler) -> ResilienceResult<ChannelHandle> {
        let handle = ChannelHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.channels.insert(handle, (topic.clone(), handler));
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!("In-memory channel {} opened for {}", handle.0, topic);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: ChannelHandle) -> ResilienceResult<()> {
        if self.channels.remove(&handle).is_some() {
            debug!("In-memory channel {} closed", handle.0);
        }
        Ok(())
    }
}
