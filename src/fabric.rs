// =============================================================================
// Broadcast Fabric — multiplexed, sequence-numbered push to subscribers
// =============================================================================
//
// One transport connection per subscriber, a mutable set of subscribed
// channels, and a single fabric-owned sequence counter. Invariants:
//
//   - `seq` is strictly increasing across the whole fabric, never reused and
//     never decreasing; every outbound message carries it. Only the fabric
//     reads-modifies-writes the counter.
//   - every broadcast caches the last payload per channel, replayed to late
//     subscribers immediately after their SUBSCRIBED ack.
//   - a failed or overflowing send evicts that one subscriber; everyone else
//     is unaffected. Outbound queues are bounded: a slow consumer is
//     disconnected, never allowed to stall the fabric.
//   - timestamps are UTC with a "Z" suffix.
//
// The fabric core is transport-agnostic (plain mpsc queues); api.rs binds it
// to WebSockets.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::ENGINE_PROCESS;
use crate::storage::StateStore;

/// Outbound queue depth per subscriber. Overflow = eviction.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Sampler cadence and error backoff.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Messages the fabric sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "HANDSHAKE")]
    Handshake {
        session_id: String,
        server_time: String,
        seq: u64,
    },
    #[serde(rename = "SUBSCRIBED")]
    Subscribed { channels: Vec<String>, seq: u64 },
    #[serde(rename = "DATA")]
    Data {
        seq: u64,
        ts: String,
        channel: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "SNAPSHOT")]
    Snapshot {
        seq: u64,
        ts: String,
        payload: serde_json::Value,
    },
}

impl ServerMessage {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Handshake { seq, .. }
            | Self::Subscribed { seq, .. }
            | Self::Data { seq, .. }
            | Self::Snapshot { seq, .. } => *seq,
        }
    }
}

/// Messages clients send. Anything else is logged and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { channels: Vec<String> },
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe { channels: Vec<String> },
    #[serde(rename = "RESYNC")]
    Resync { from_seq: u64 },
    #[serde(rename = "PING")]
    Ping,
}

struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    subscriptions: HashSet<String>,
    last_seq_sent: u64,
}

fn utc_now_z() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The fabric.
pub struct BroadcastFabric {
    seq: AtomicU64,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    last_payload: RwLock<HashMap<String, serde_json::Value>>,
    cache: Arc<dyn StateStore>,
}

impl BroadcastFabric {
    pub fn new(cache: Arc<dyn StateStore>) -> Self {
        info!("broadcast fabric initialised");
        Self {
            seq: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
            last_payload: RwLock::new(HashMap::new()),
            cache,
        }
    }

    /// Single-writer discipline: every outbound message takes its seq here.
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // -------------------------------------------------------------------------
    // Subscriber lifecycle
    // -------------------------------------------------------------------------

    /// Accept a new subscriber. The HANDSHAKE is already queued on the
    /// returned receiver.
    pub fn accept(&self) -> (String, mpsc::Receiver<ServerMessage>) {
        let session_id = format!("session_{}", Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);

        let handshake = ServerMessage::Handshake {
            session_id: session_id.clone(),
            server_time: utc_now_z(),
            seq: self.next_seq(),
        };
        let seq = handshake.seq();
        // A freshly-created queue cannot be full.
        let _ = tx.try_send(handshake);

        self.subscribers.write().insert(
            session_id.clone(),
            Subscriber {
                tx,
                subscriptions: HashSet::new(),
                last_seq_sent: seq,
            },
        );

        info!(session_id = %session_id, "subscriber accepted");
        (session_id, rx)
    }

    pub fn disconnect(&self, session_id: &str) {
        if self.subscribers.write().remove(session_id).is_some() {
            info!(session_id, "subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn any_subscribed_to(&self, channel: &str) -> bool {
        self.subscribers
            .read()
            .values()
            .any(|s| s.subscriptions.contains(channel))
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Handle one raw client message. Unknown types are logged and ignored,
    /// never an error.
    pub fn handle_client_text(&self, session_id: &str, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe { channels }) => self.subscribe(session_id, &channels),
            Ok(ClientMessage::Unsubscribe { channels }) => {
                self.unsubscribe(session_id, &channels)
            }
            Ok(ClientMessage::Resync { from_seq }) => self.resync(session_id, from_seq),
            Ok(ClientMessage::Ping) => {
                debug!(session_id, "ping");
            }
            Err(e) => {
                warn!(session_id, error = %e, text, "unknown client message ignored");
            }
        }
    }

    fn subscribe(&self, session_id: &str, channels: &[String]) {
        let ack = {
            let mut subscribers = self.subscribers.write();
            let Some(subscriber) = subscribers.get_mut(session_id) else {
                return;
            };
            subscriber
                .subscriptions
                .extend(channels.iter().cloned());

            let mut all: Vec<String> = subscriber.subscriptions.iter().cloned().collect();
            all.sort();
            ServerMessage::Subscribed {
                channels: all,
                seq: self.next_seq(),
            }
        };
        debug!(session_id, channels = ?channels, "subscribed");
        self.deliver(session_id, ack);

        // Immediate replay of the last cached payload per channel, so a late
        // subscriber starts from current state instead of silence.
        for channel in channels {
            let cached = self.last_payload.read().get(channel).cloned();
            if let Some(payload) = cached {
                let message = ServerMessage::Data {
                    seq: self.next_seq(),
                    ts: utc_now_z(),
                    channel: channel.clone(),
                    payload,
                };
                self.deliver(session_id, message);
            }
        }
    }

    fn unsubscribe(&self, session_id: &str, channels: &[String]) {
        let mut subscribers = self.subscribers.write();
        if let Some(subscriber) = subscribers.get_mut(session_id) {
            for channel in channels {
                subscriber.subscriptions.remove(channel);
            }
            debug!(session_id, channels = ?channels, "unsubscribed");
        }
    }

    /// A subscriber detected a gap: send a full state snapshot.
    fn resync(&self, session_id: &str, from_seq: u64) {
        info!(session_id, from_seq, "resync requested");

        let mut payload = serde_json::Map::new();
        if let Ok(positions) = self.cache.all_positions() {
            payload.insert(
                "positions".into(),
                serde_json::to_value(positions).unwrap_or_default(),
            );
        }
        if let Ok(history) = self.cache.equity_history() {
            payload.insert("equity".into(), serde_json::json!(history));
        }
        if let Ok(Some(regime)) = self.cache.get_state("current_regime") {
            payload.insert("regime".into(), regime);
        }

        let message = ServerMessage::Snapshot {
            seq: self.next_seq(),
            ts: utc_now_z(),
            payload: serde_json::Value::Object(payload),
        };
        self.deliver(session_id, message);
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Broadcast a payload on a channel to every subscriber holding it.
    pub fn broadcast(&self, channel: &str, payload: serde_json::Value) {
        self.last_payload
            .write()
            .insert(channel.to_string(), payload.clone());

        let message = ServerMessage::Data {
            seq: self.next_seq(),
            ts: utc_now_z(),
            channel: channel.to_string(),
            payload,
        };

        let targets: Vec<String> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, s)| s.subscriptions.contains(channel))
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in targets {
            self.deliver(&session_id, message.clone());
        }
    }

    /// Queue a message for one subscriber; a full or closed queue evicts
    /// them. Other subscribers never notice.
    fn deliver(&self, session_id: &str, message: ServerMessage) {
        let seq = message.seq();
        let result = {
            let subscribers = self.subscribers.read();
            match subscribers.get(session_id) {
                Some(subscriber) => subscriber.tx.try_send(message),
                None => return,
            }
        };

        match result {
            Ok(()) => {
                if let Some(subscriber) = self.subscribers.write().get_mut(session_id) {
                    subscriber.last_seq_sent = seq;
                }
            }
            Err(e) => {
                warn!(session_id, error = %e, "send failed, evicting subscriber");
                self.disconnect(session_id);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Background sampler
    // -------------------------------------------------------------------------

    /// Every 2 s, sample the cache and broadcast each channel that has at
    /// least one subscriber. Errors back off 5 s.
    pub async fn run_sampler(self: Arc<Self>) {
        info!("broadcast sampler running");
        loop {
            match self.sample_once() {
                Ok(()) => tokio::time::sleep(SAMPLE_INTERVAL).await,
                Err(e) => {
                    warn!(error = %e, "sampler error, backing off");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn sample_once(&self) -> anyhow::Result<()> {
        if self.subscriber_count() == 0 {
            return Ok(());
        }

        if self.any_subscribed_to("positions") {
            let positions = self.cache.all_positions()?;
            self.broadcast("positions", serde_json::to_value(positions)?);
        }

        if self.any_subscribed_to("equity") {
            if let Some(latest) = self.cache.equity_history()?.last() {
                self.broadcast("equity", serde_json::json!(latest));
            }
        }

        if self.any_subscribed_to("regime") {
            if let Some(regime) = self.cache.get_state("current_regime")? {
                self.broadcast("regime", regime);
            }
        }

        if self.any_subscribed_to("health") {
            let alive = self
                .cache
                .is_process_alive(ENGINE_PROCESS, std::time::Duration::from_secs(120))?;
            self.broadcast(
                "health",
                serde_json::json!({
                    "engine_alive": alive,
                    "timestamp": utc_now_z(),
                }),
            );
        }

        Ok(())
    }
}
