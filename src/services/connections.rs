//! Registry of live-update subscribers.
//!
//! Each SSE connection registers a bounded channel under its user id. The
//! registration lives as long as the returned [`Subscription`]; dropping it
//! (when the response stream ends) removes the entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::TransferEvent;

/// Events buffered per connection before new ones are dropped for it.
pub const CONNECTION_BUFFER: usize = 64;

struct Connection {
    user_id: Uuid,
    sender: mpsc::Sender<TransferEvent>,
}

#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<Mutex<HashMap<Uuid, Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Connection>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, user_id: Uuid) -> Subscription {
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        let id = Uuid::new_v4();
        self.lock().insert(id, Connection { user_id, sender });
        tracing::debug!(connection_id = %id, user_id = %user_id, "Live-update subscriber registered");

        Subscription {
            id,
            receiver,
            manager: self.clone(),
        }
    }

    pub fn unsubscribe(&self, connection_id: Uuid) {
        if self.lock().remove(&connection_id).is_some() {
            tracing::debug!(connection_id = %connection_id, "Live-update subscriber removed");
        }
    }

    /// Sends `event` to every connection of the given users without waiting.
    /// Returns the number of connections that accepted it.
    pub fn broadcast(&self, event: &TransferEvent, audience: &[Uuid]) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let connections = self.lock();
            for (id, connection) in connections.iter() {
                if !audience.contains(&connection.user_id) {
                    continue;
                }
                match connection.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(connection_id = %id, "Subscriber is lagging, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            self.unsubscribe(id);
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }
}

/// A registered connection. Unsubscribes on drop.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<TransferEvent>,
    manager: ConnectionManager,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<TransferEvent> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.manager.unsubscribe(self.id);
    }
}
