//! Operational Notifications
//!
//! The WAL reports poisoning, torn-tail repair and rotation as `WalEvent`s.
//! Events go into an unbounded channel so emitting never blocks the write
//! path; an `EventDispatcher` drains the channel and fans each event out to
//! the configured notifiers. Delivery is best-effort.

mod broadcast;
mod http;

pub use broadcast::BroadcastNotifier;
pub use http::{SlackNotifier, TelegramNotifier, WebhookNotifier};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::wal::Lsn;

/// A destination for operational messages
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Whether this notifier has everything it needs to deliver
    fn is_configured(&self) -> bool;

    /// Deliver one message; returns false on any failure
    async fn send(&self, message: &str, data: &serde_json::Value) -> bool;
}

/// Notifier settings as they appear in the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierConfig {
    Webhook {
        url: String,
    },
    Slack {
        webhook_url: String,
    },
    Telegram {
        bot_token: String,
        chat_id: String,
    },
    /// Fan-out to in-process subscribers such as a WebSocket layer
    WebsocketBroadcast {
        #[serde(default = "default_broadcast_capacity")]
        capacity: usize,
    },
}

fn default_broadcast_capacity() -> usize {
    256
}

/// Build notifiers from config
pub fn build_notifiers(configs: &[NotifierConfig]) -> Vec<Arc<dyn Notifier>> {
    configs
        .iter()
        .map(|config| -> Arc<dyn Notifier> {
            match config {
                NotifierConfig::Webhook { url } => Arc::new(WebhookNotifier::new(url.clone())),
                NotifierConfig::Slack { webhook_url } => {
                    Arc::new(SlackNotifier::new(webhook_url.clone()))
                }
                NotifierConfig::Telegram { bot_token, chat_id } => {
                    Arc::new(TelegramNotifier::new(bot_token.clone(), chat_id.clone()))
                }
                NotifierConfig::WebsocketBroadcast { capacity } => {
                    Arc::new(BroadcastNotifier::new(*capacity))
                }
            }
        })
        .collect()
}

/// Operational events raised by the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEvent {
    /// The writer hit an I/O error and refuses further writes
    Poisoned { dir: PathBuf, error: String },
    /// A torn tail was cut from the active segment at open
    TornTailTruncated {
        segment: PathBuf,
        offset: u64,
        bytes_discarded: u64,
    },
    /// The active segment was sealed and a new one opened
    SegmentRotated {
        sealed: PathBuf,
        sealed_last_lsn: Lsn,
        active_first_lsn: Lsn,
    },
}

impl WalEvent {
    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            WalEvent::Poisoned { .. } => "wal.poisoned",
            WalEvent::TornTailTruncated { .. } => "wal.torn_tail_truncated",
            WalEvent::SegmentRotated { .. } => "wal.segment_rotated",
        }
    }

    /// Human-readable one-liner
    pub fn message(&self) -> String {
        match self {
            WalEvent::Poisoned { dir, error } => {
                format!("WAL writer for {} poisoned: {}", dir.display(), error)
            }
            WalEvent::TornTailTruncated {
                segment,
                offset,
                bytes_discarded,
            } => format!(
                "Truncated {} torn bytes from {} at offset {}",
                bytes_discarded,
                segment.display(),
                offset
            ),
            WalEvent::SegmentRotated {
                sealed,
                sealed_last_lsn,
                active_first_lsn,
            } => format!(
                "Sealed {} at LSN {}, next segment starts at {}",
                sealed.display(),
                sealed_last_lsn,
                active_first_lsn
            ),
        }
    }

    /// Structured payload for notifiers
    pub fn data(&self) -> serde_json::Value {
        let mut data = match self {
            WalEvent::Poisoned { dir, error } => json!({
                "dir": dir,
                "error": error,
            }),
            WalEvent::TornTailTruncated {
                segment,
                offset,
                bytes_discarded,
            } => json!({
                "segment": segment,
                "offset": offset,
                "bytes_discarded": bytes_discarded,
            }),
            WalEvent::SegmentRotated {
                sealed,
                sealed_last_lsn,
                active_first_lsn,
            } => json!({
                "sealed": sealed,
                "sealed_last_lsn": sealed_last_lsn,
                "active_first_lsn": active_first_lsn,
            }),
        };
        data["event"] = json!(self.name());
        data["at"] = json!(chrono::Utc::now().to_rfc3339());
        data
    }
}

/// Non-blocking handle for emitting events
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<WalEvent>,
}

impl EventSink {
    /// A sink plus the receiving end, for callers that drain events themselves
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WalEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queue an event; dropped silently once the dispatcher is gone
    pub fn emit(&self, event: WalEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Event dispatcher gone, dropping WAL event");
        }
    }
}

/// Drains WAL events and forwards them to notifiers
pub struct EventDispatcher;

impl EventDispatcher {
    /// Start delivering events to `notifiers`
    ///
    /// Runs on the current tokio runtime when called inside one, otherwise
    /// on a dedicated thread with its own runtime. Delivery stops once every
    /// clone of the returned sink is dropped.
    pub fn start(notifiers: Vec<Arc<dyn Notifier>>) -> Result<EventSink> {
        let (sink, receiver) = EventSink::channel();
        let active: Vec<Arc<dyn Notifier>> = notifiers
            .into_iter()
            .filter(|n| {
                let configured = n.is_configured();
                if !configured {
                    tracing::warn!(notifier = n.name(), "Notifier is not configured, skipping");
                }
                configured
            })
            .collect();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::run(active, receiver));
            }
            Err(_) => {
                std::thread::Builder::new()
                    .name("wal-events".into())
                    .spawn(move || {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(e) => {
                                tracing::error!("Failed to start event runtime: {}", e);
                                return;
                            }
                        };
                        runtime.block_on(Self::run(active, receiver));
                    })
                    .map_err(Error::Io)?;
            }
        }

        Ok(sink)
    }

    async fn run(notifiers: Vec<Arc<dyn Notifier>>, mut receiver: mpsc::UnboundedReceiver<WalEvent>) {
        while let Some(event) = receiver.recv().await {
            let message = event.message();
            let data = event.data();
            for notifier in &notifiers {
                if !notifier.send(&message, &data).await {
                    tracing::warn!(
                        notifier = notifier.name(),
                        event = event.name(),
                        "Notifier delivery failed"
                    );
                }
            }
        }
        tracing::debug!("WAL event dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingNotifier {
        seen: Arc<Mutex<Vec<String>>>,
        done: mpsc::UnboundedSender<()>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn send(&self, _message: &str, data: &serde_json::Value) -> bool {
            self.seen
                .lock()
                .unwrap()
                .push(data["event"].as_str().unwrap_or_default().to_string());
            let _ = self.done.send(());
            true
        }
    }

    #[test]
    fn test_event_names_and_data() {
        let event = WalEvent::SegmentRotated {
            sealed: PathBuf::from("/wal/00000000000000000001.wal"),
            sealed_last_lsn: 400,
            active_first_lsn: 401,
        };
        assert_eq!(event.name(), "wal.segment_rotated");

        let data = event.data();
        assert_eq!(data["event"], "wal.segment_rotated");
        assert_eq!(data["sealed_last_lsn"], 400);
        assert_eq!(data["active_first_lsn"], 401);
        assert!(data["at"].is_string());
        assert!(event.message().contains("401"));
    }

    #[test]
    fn test_sink_channel() {
        let (sink, mut receiver) = EventSink::channel();
        sink.emit(WalEvent::Poisoned {
            dir: PathBuf::from("/wal"),
            error: "disk full".into(),
        });

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.name(), "wal.poisoned");
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, receiver) = EventSink::channel();
        drop(receiver);
        sink.emit(WalEvent::Poisoned {
            dir: PathBuf::from("/wal"),
            error: "gone".into(),
        });
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_on_current_runtime() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(RecordingNotifier {
            seen: Arc::clone(&seen),
            done: done_tx,
        });

        let sink = EventDispatcher::start(vec![notifier]).unwrap();
        sink.emit(WalEvent::TornTailTruncated {
            segment: PathBuf::from("/wal/00000000000000000001.wal"),
            offset: 120,
            bytes_discarded: 7,
        });

        done_rx.recv().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["wal.torn_tail_truncated"]);
    }

    #[test]
    fn test_dispatcher_without_runtime() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let notifier = Arc::new(RecordingNotifier {
            seen: Arc::clone(&seen),
            done: done_tx,
        });

        let sink = EventDispatcher::start(vec![notifier]).unwrap();
        sink.emit(WalEvent::Poisoned {
            dir: PathBuf::from("/wal"),
            error: "eio".into(),
        });

        done_rx.blocking_recv().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["wal.poisoned"]);
    }

    #[test]
    fn test_build_notifiers() {
        let configs = vec![
            NotifierConfig::Webhook { url: "http://localhost:1/hook".into() },
            NotifierConfig::Slack { webhook_url: String::new() },
            NotifierConfig::Telegram { bot_token: "t".into(), chat_id: "42".into() },
            NotifierConfig::WebsocketBroadcast { capacity: 8 },
        ];
        let notifiers = build_notifiers(&configs);
        let names: Vec<&str> = notifiers.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["webhook", "slack", "telegram", "websocket"]);
        assert!(notifiers[0].is_configured());
        assert!(!notifiers[1].is_configured());
    }

    #[test]
    fn test_notifier_config_parse() {
        let config: NotifierConfig =
            toml::from_str("kind = \"telegram\"\nbot_token = \"abc\"\nchat_id = \"-100\"\n").unwrap();
        assert_eq!(
            config,
            NotifierConfig::Telegram { bot_token: "abc".into(), chat_id: "-100".into() }
        );

        let ws: NotifierConfig = toml::from_str("kind = \"websocket_broadcast\"\n").unwrap();
        assert_eq!(ws, NotifierConfig::WebsocketBroadcast { capacity: 256 });
    }
}
