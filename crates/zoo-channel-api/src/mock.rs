//! Mock channel client for testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use zoo_api::ChannelStatus;
use zoo_util::PresenceKey;

use crate::{
    ChannelClient, ChannelError, ChannelEvent, ChannelOptions, ChannelResult, PresenceChannel,
    PresenceState,
};

/// In-process pub/sub hub
///
/// Channels opened with the same name share one topic, so several handles
/// from one client behave like several tabs on the same transport. Every
/// presence mutation fans a `PresenceSync` out to all subscribed handles.
/// Clones share the same hub.
#[derive(Clone)]
pub struct MockChannelClient {
    hub: Arc<MockHub>,
}

struct MockHub {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, MockTopic>>,
    auto_subscribe: AtomicBool,
    fail_track: AtomicBool,
    fail_untrack: AtomicBool,
    channels_opened: AtomicUsize,
    unsubscribes: AtomicUsize,
}

#[derive(Default)]
struct MockTopic {
    entries: Vec<MockEntry>,
    members: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
}

struct MockEntry {
    /// `None` for participants injected with `join_remote`
    channel_id: Option<u64>,
    key: String,
    meta: serde_json::Value,
}

impl MockTopic {
    fn state(&self) -> PresenceState {
        let mut state = PresenceState::new();
        for entry in &self.entries {
            state
                .entry(entry.key.clone())
                .or_default()
                .push(entry.meta.clone());
        }
        state
    }

    fn broadcast(&self, event: ChannelEvent) {
        for tx in self.members.values() {
            let _ = tx.send(event);
        }
    }
}

impl MockHub {
    fn with_topic<R>(&self, name: &str, f: impl FnOnce(&mut MockTopic) -> R) -> R {
        let mut topics = self.topics.lock().unwrap();
        f(topics.entry(name.to_string()).or_default())
    }
}

impl MockChannelClient {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(MockHub {
                next_id: AtomicU64::new(1),
                topics: Mutex::new(HashMap::new()),
                auto_subscribe: AtomicBool::new(true),
                fail_track: AtomicBool::new(false),
                fail_untrack: AtomicBool::new(false),
                channels_opened: AtomicUsize::new(0),
                unsubscribes: AtomicUsize::new(0),
            }),
        }
    }

    /// When set (the default), `subscribe()` immediately reports `SUBSCRIBED`
    pub fn set_auto_subscribe(&self, enabled: bool) {
        self.hub.auto_subscribe.store(enabled, Ordering::SeqCst);
    }

    /// Configure `track()` to fail
    pub fn set_fail_track(&self, fail: bool) {
        self.hub.fail_track.store(fail, Ordering::SeqCst);
    }

    /// Configure `untrack()` to fail
    pub fn set_fail_untrack(&self, fail: bool) {
        self.hub.fail_untrack.store(fail, Ordering::SeqCst);
    }

    /// Deliver a status to every subscribed handle on `topic`
    pub fn emit_status(&self, topic: &str, status: ChannelStatus) {
        self.hub
            .with_topic(topic, |t| t.broadcast(ChannelEvent::Status(status)));
    }

    /// Deliver a sync without changing state
    pub fn emit_sync(&self, topic: &str) {
        self.hub
            .with_topic(topic, |t| t.broadcast(ChannelEvent::PresenceSync));
    }

    /// Add a participant that does not belong to any local handle
    pub fn join_remote(&self, topic: &str, key: &str, meta: serde_json::Value) {
        self.hub.with_topic(topic, |t| {
            t.entries.push(MockEntry {
                channel_id: None,
                key: key.to_string(),
                meta,
            });
            t.broadcast(ChannelEvent::PresenceSync);
        });
    }

    /// Remove every remote participant tracked under `key`
    pub fn leave_remote(&self, topic: &str, key: &str) {
        self.hub.with_topic(topic, |t| {
            t.entries
                .retain(|e| !(e.channel_id.is_none() && e.key == key));
            t.broadcast(ChannelEvent::PresenceSync);
        });
    }

    /// Current presence state of a topic
    pub fn topic_state(&self, topic: &str) -> PresenceState {
        self.hub.with_topic(topic, |t| t.state())
    }

    /// Number of handles currently subscribed to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.hub.with_topic(topic, |t| t.members.len())
    }

    /// Number of `channel()` calls so far
    pub fn channels_opened(&self) -> usize {
        self.hub.channels_opened.load(Ordering::SeqCst)
    }

    /// Number of `unsubscribe()` calls so far
    pub fn unsubscribe_count(&self) -> usize {
        self.hub.unsubscribes.load(Ordering::SeqCst)
    }
}

impl Default for MockChannelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelClient for MockChannelClient {
    fn channel(&self, name: &str, options: ChannelOptions) -> Arc<dyn PresenceChannel> {
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        self.hub.channels_opened.fetch_add(1, Ordering::SeqCst);
        debug!(channel = name, id, key = %options.presence_key, "Mock channel opened");

        Arc::new(MockChannel {
            id,
            name: name.to_string(),
            key: options.presence_key,
            hub: self.hub.clone(),
        })
    }
}

/// A handle opened on `MockChannelClient`
pub struct MockChannel {
    id: u64,
    name: String,
    key: PresenceKey,
    hub: Arc<MockHub>,
}

#[async_trait]
impl PresenceChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn presence_key(&self) -> &PresenceKey {
        &self.key
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.hub.auto_subscribe.load(Ordering::SeqCst) {
            let _ = tx.send(ChannelEvent::Status(ChannelStatus::Subscribed));
        }
        self.hub.with_topic(&self.name, |t| {
            t.members.insert(self.id, tx);
        });
        rx
    }

    async fn track(&self, payload: serde_json::Value) -> ChannelResult<()> {
        if self.hub.fail_track.load(Ordering::SeqCst) {
            return Err(ChannelError::TrackRejected("Mock track failure".into()));
        }

        self.hub.with_topic(&self.name, |t| {
            if !t.members.contains_key(&self.id) {
                return Err(ChannelError::NotSubscribed(self.name.clone()));
            }

            match t
                .entries
                .iter_mut()
                .find(|e| e.channel_id == Some(self.id))
            {
                Some(entry) => entry.meta = payload,
                None => t.entries.push(MockEntry {
                    channel_id: Some(self.id),
                    key: self.key.as_str().to_string(),
                    meta: payload,
                }),
            }
            t.broadcast(ChannelEvent::PresenceSync);
            Ok(())
        })
    }

    async fn untrack(&self) -> ChannelResult<()> {
        if self.hub.fail_untrack.load(Ordering::SeqCst) {
            return Err(ChannelError::UntrackRejected("Mock untrack failure".into()));
        }

        self.hub.with_topic(&self.name, |t| {
            t.entries.retain(|e| e.channel_id != Some(self.id));
            t.broadcast(ChannelEvent::PresenceSync);
        });
        Ok(())
    }

    async fn unsubscribe(&self) -> ChannelResult<()> {
        self.hub.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.hub.with_topic(&self.name, |t| {
            t.members.remove(&self.id);
            let before = t.entries.len();
            t.entries.retain(|e| e.channel_id != Some(self.id));
            if t.entries.len() != before {
                t.broadcast(ChannelEvent::PresenceSync);
            }
        });
        Ok(())
    }

    fn presence_state(&self) -> PresenceState {
        self.hub.with_topic(&self.name, |t| t.state())
    }
}
