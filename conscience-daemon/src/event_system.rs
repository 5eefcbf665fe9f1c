#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ty: String,
    pub detail: String,
}

impl Event {
    pub fn service(detail: impl Into<String>) -> Self {
        Self { ty: "service".into(), detail: detail.into() }
    }
    pub fn persistence(detail: impl Into<String>) -> Self {
        Self { ty: "persistence".into(), detail: detail.into() }
    }
    pub fn system(detail: impl Into<String>) -> Self {
        Self { ty: "system".into(), detail: detail.into() }
    }
}

/// Simple pub/sub for daemon events over a broadcast channel.
#[derive(Clone)]
pub struct EventSystem {
    tx: broadcast::Sender<Event>,
    default_types: Vec<String>,
}

impl EventSystem {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer);
        Self {
            tx,
            default_types: vec!["service".into(), "persistence".into(), "system".into()],
        }
    }

    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.tx.clone()
    }
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscriber filter: an explicit type list, else the built-in defaults.
    pub fn matches(&self, ev: &Event, filter: &Option<Vec<String>>) -> bool {
        let allow = filter.as_deref().unwrap_or(&self.default_types);
        allow.iter().any(|t| t == &ev.ty)
    }
}
