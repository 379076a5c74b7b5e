//! Channel message routing for wssocks
//!
//! Inbound `data` and `connect_response` frames are routed from the
//! WebSocket dispatcher to the relay task that is waiting on them, keyed by
//! channel id. Connect ids and channel ids share the same map.

use crate::message::Envelope;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// ChannelBus routes inbound frames to per-channel queues
pub struct ChannelBus {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl ChannelBus {
    /// Create a new ChannelBus
    pub fn new() -> Self {
        ChannelBus {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Register a queue for the given channel id
    ///
    /// The queue lives until the returned subscription is dropped. Frames
    /// delivered for ids without a registered queue are discarded.
    pub fn register(self: &Arc<Self>, id: &str) -> ChannelSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.lock().unwrap().insert(id.to_string(), tx.clone());
        ChannelSubscription {
            id: id.to_string(),
            bus: self.clone(),
            tx,
            rx,
        }
    }

    /// Deliver a frame to the queue registered for `id`, if any
    pub fn deliver(&self, id: &str, msg: Envelope) {
        let queues = self.queues.lock().unwrap();
        match queues.get(id) {
            Some(tx) => {
                // Receiver can only be gone if the subscription is mid-drop
                let _ = tx.send(msg);
            }
            None => debug!("Received message for unknown channel: {}", id),
        }
    }

    fn unregister(&self, id: &str, tx: &mpsc::UnboundedSender<Envelope>) {
        let mut queues = self.queues.lock().unwrap();
        // Only remove our own registration; the id may have been re-registered
        if queues.get(id).is_some_and(|cur| cur.same_channel(tx)) {
            queues.remove(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn channel_count(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a registered channel queue; unregisters on drop
pub struct ChannelSubscription {
    id: String,
    bus: Arc<ChannelBus>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelSubscription {
    /// The channel id this subscription receives for
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next frame delivered to this channel
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.bus.unregister(&self.id, &self.tx);
    }
}
