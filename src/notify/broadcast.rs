//! WebSocket Broadcast Notifier
//!
//! Publishes each event as a JSON text frame on a tokio broadcast channel.
//! A WebSocket layer subscribes and forwards frames to its clients.

use serde_json::json;
use tokio::sync::broadcast;

use super::Notifier;

pub struct BroadcastNotifier {
    sender: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver for frames sent after this call
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait::async_trait]
impl Notifier for BroadcastNotifier {
    fn name(&self) -> &str {
        "websocket"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn send(&self, message: &str, data: &serde_json::Value) -> bool {
        let frame = json!({ "message": message, "data": data }).to_string();
        // Err only means there are no subscribers right now
        let _ = self.sender.send(frame);
        true
    }
}
