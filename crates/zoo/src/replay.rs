//! `zoo replay`: drive the presence service from a script
//!
//! A script is a JSON object with a `steps` array. Each step is tagged by
//! `op`:
//!
//! ```json
//! {"steps": [
//!   {"op": "observe", "id": "a", "user": "u1"},
//!   {"op": "join", "key": "tab-2", "user": "u2"},
//!   {"op": "status", "status": "CHANNEL_ERROR"},
//!   {"op": "resubscribe"},
//!   {"op": "identify", "id": "a", "user": "u3"},
//!   {"op": "leave", "key": "tab-2"},
//!   {"op": "unobserve", "id": "a"},
//!   {"op": "shutdown"}
//! ]}
//! ```
//!
//! Steps run against an in-process channel. Every snapshot delivered to an
//! observer is reported with the local time it arrived.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use zoo_api::{ChannelStatus, PresenceMeta, PresenceSnapshot};
use zoo_channel_api::MockChannelClient;
use zoo_config::{PoolMode, PresenceSettings};
use zoo_core::{ANY_ROOM_LABEL, PresenceService, Readable, Subscription};
use zoo_util::{RoomKey, UserId};

/// Time allowed for channel events to propagate after each step
const SETTLE: Duration = Duration::from_millis(20);

#[derive(Debug, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Start observing presence; no room means the global pool
    Observe {
        id: String,
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        user: Option<UserId>,
    },
    /// Drop an observer
    Unobserve { id: String },
    /// Re-observe under a new identity, keeping the room open
    Identify {
        id: String,
        #[serde(default)]
        user: Option<UserId>,
    },
    /// A foreign session tracks itself
    Join {
        key: String,
        #[serde(default)]
        user: Option<UserId>,
        #[serde(default)]
        room: Option<String>,
    },
    /// A foreign session leaves
    Leave {
        key: String,
        #[serde(default)]
        room: Option<String>,
    },
    /// The transport reports a status
    Status {
        status: ChannelStatus,
        #[serde(default)]
        room: Option<String>,
    },
    /// Subscribe a room again
    Resubscribe {
        #[serde(default)]
        room: Option<String>,
    },
    /// Let time pass
    Wait { ms: u64 },
    /// Untrack and unsubscribe everything
    Shutdown,
}

/// One snapshot delivered to one observer
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub at: DateTime<Local>,
    pub observer: String,
    pub snapshot: PresenceSnapshot,
}

impl Published {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "at": zoo_util::format_local_timestamp(&self.at),
            "observer": self.observer,
            "tabs": self.snapshot.tabs,
            "unique": self.snapshot.unique,
            "connected": self.snapshot.connected,
        })
    }
}

struct Observer {
    room: Option<String>,
    subscription: Subscription,
}

pub fn load_script(path: &Path) -> Result<Script> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script from {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid script in {:?}", path))
}

/// A presence service wired to an in-process channel
pub struct Replay {
    mock: MockChannelClient,
    service: Arc<PresenceService>,
    default_room: Option<String>,
    observers: HashMap<String, Observer>,
    published_tx: mpsc::UnboundedSender<Published>,
    published_rx: mpsc::UnboundedReceiver<Published>,
}

impl Replay {
    /// Must be called within a tokio runtime.
    pub fn new(settings: PresenceSettings, default_room: Option<String>) -> Self {
        let mock = MockChannelClient::new();
        let service = PresenceService::new(Arc::new(mock.clone()), settings);
        let (published_tx, published_rx) = mpsc::unbounded_channel();

        Self {
            mock,
            service,
            default_room,
            observers: HashMap::new(),
            published_tx,
            published_rx,
        }
    }

    pub fn service(&self) -> &Arc<PresenceService> {
        &self.service
    }

    pub fn mock(&self) -> &MockChannelClient {
        &self.mock
    }

    /// Apply one step and collect what observers saw
    pub async fn step(&mut self, step: Step) -> Result<Vec<Published>> {
        debug!(?step, "Replay step");

        match step {
            Step::Observe { id, room, user } => {
                if self.observers.contains_key(&id) {
                    bail!("Observer '{}' already exists", id);
                }
                let room = room.or_else(|| self.default_room.clone());
                let observer = self.observer(&id, room, user);
                self.observers.insert(id, observer);
            }
            Step::Unobserve { id } => {
                let Some(observer) = self.observers.remove(&id) else {
                    bail!("No observer '{}'", id);
                };
                observer.subscription.unsubscribe();
            }
            Step::Identify { id, user } => {
                let Some(previous) = self.observers.remove(&id) else {
                    bail!("No observer '{}'", id);
                };
                // Subscribe first so the room stays open across the swap
                let observer = self.observer(&id, previous.room.clone(), user);
                previous.subscription.unsubscribe();
                self.observers.insert(id, observer);
            }
            Step::Join { key, user, room } => {
                let room = room.or_else(|| self.default_room.clone());
                let meta = PresenceMeta {
                    user_id: user,
                    room: room.clone().unwrap_or_else(|| ANY_ROOM_LABEL.to_string()),
                    ts: zoo_util::unix_millis(&zoo_util::now()),
                };
                let topic = self.topic(room.as_deref());
                self.mock.join_remote(&topic, &key, serde_json::to_value(&meta)?);
            }
            Step::Leave { key, room } => {
                let topic = self.topic(room.or_else(|| self.default_room.clone()).as_deref());
                self.mock.leave_remote(&topic, &key);
            }
            Step::Status { status, room } => {
                let topic = self.topic(room.or_else(|| self.default_room.clone()).as_deref());
                self.mock.emit_status(&topic, status);
            }
            Step::Resubscribe { room } => {
                let room = self.room_key(room.or_else(|| self.default_room.clone()).as_deref());
                self.service.resubscribe(&room)?;
            }
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
            Step::Shutdown => self.service.shutdown().await,
        }

        Ok(self.settle().await)
    }

    /// Run every step, handing each batch of snapshots to `report`
    pub async fn run(
        &mut self,
        steps: Vec<Step>,
        mut report: impl FnMut(&Published),
    ) -> Result<()> {
        for step in steps {
            for published in self.step(step).await? {
                report(&published);
            }
        }
        Ok(())
    }

    /// Shut the service down and report the final snapshots
    pub async fn finish(&mut self) -> Vec<Published> {
        self.service.shutdown().await;
        let published = self.settle().await;
        self.observers.clear();
        published
    }

    fn observer(&self, id: &str, room: Option<String>, user: Option<UserId>) -> Observer {
        let readable: Readable<PresenceSnapshot> = match &room {
            Some(room) => self.service.presence(&RoomKey::new(room.as_str()), user),
            None => self.service.global_presence(user),
        };

        let tx = self.published_tx.clone();
        let observer = id.to_string();
        let subscription = readable.subscribe(move |snapshot| {
            let _ = tx.send(Published {
                at: zoo_util::now(),
                observer: observer.clone(),
                snapshot: *snapshot,
            });
        });

        Observer { room, subscription }
    }

    /// Room key a step addresses, following the pool mode
    fn room_key(&self, room: Option<&str>) -> RoomKey {
        match (self.service.settings().pool, room) {
            (PoolMode::PerRoom, Some(room)) => RoomKey::new(room),
            _ => self.service.settings().global_room.clone(),
        }
    }

    fn topic(&self, room: Option<&str>) -> String {
        self.room_key(room).channel_name()
    }

    async fn settle(&mut self) -> Vec<Published> {
        tokio::time::sleep(SETTLE).await;
        let mut published = Vec::new();
        while let Ok(p) = self.published_rx.try_recv() {
            published.push(p);
        }
        published
    }
}
