// Copyright (c) 2026 Roman Barinov <rbarinov@gmail.com>
// Licensed under the FSL-1.1-NC.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};

pub type AckSender = oneshot::Sender<Vec<Value>>;
pub type AckReceiver = oneshot::Receiver<Vec<Value>>;

/// Requests waiting for an acknowledgement from the relay.
pub struct PendingAcks {
    next_id: AtomicU64,
    requests: Arc<RwLock<HashMap<u64, AckSender>>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self) -> (u64, AckReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut requests = self.requests.write().await;
        requests.insert(id, tx);
        (id, rx)
    }

    pub async fn complete(&self, id: u64, args: Vec<Value>) -> bool {
        let mut requests = self.requests.write().await;
        if let Some(sender) = requests.remove(&id) {
            sender.send(args).is_ok()
        } else {
            false
        }
    }

    pub async fn cancel(&self, id: u64) {
        let mut requests = self.requests.write().await;
        requests.remove(&id);
    }

    /// Drops every waiter; their receivers observe a closed channel.
    pub async fn cancel_all(&self) {
        let mut requests = self.requests.write().await;
        requests.clear();
    }

    #[cfg(test)]
    async fn count(&self) -> usize {
        let requests = self.requests.read().await;
        requests.len()
    }
}

impl Default for PendingAcks {
    fn default() -> Self {
        Self::new()
    }
}
