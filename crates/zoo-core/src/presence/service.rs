//! Presence service: one channel per room, shared by every observer

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zoo_api::{ChannelStatus, PresenceSnapshot};
use zoo_channel_api::ChannelClient;
use zoo_config::{PoolMode, PresenceSettings, ReleasePolicy};
use zoo_util::{PresenceKey, Result, RoomKey, UserId, ZooError};

use super::room::{RoomHandle, RoomSpec};
use crate::observable::{Readable, Teardown};

/// Room label tracked by sessions in the global pool
pub const ANY_ROOM_LABEL: &str = "__any__";

/// Owns every presence channel of this process.
///
/// Rooms open lazily when their first observer subscribes. Each room is
/// tracked once under the session key no matter how many observers it has.
/// Room drivers run on the runtime the service was created in, so observers
/// may subscribe from any thread.
pub struct PresenceService {
    client: Arc<dyn ChannelClient>,
    runtime: Handle,
    settings: PresenceSettings,
    session_key: PresenceKey,
    rooms: Mutex<HashMap<RoomKey, RoomHandle>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl PresenceService {
    /// Must be called within a tokio runtime.
    pub fn new(client: Arc<dyn ChannelClient>, settings: PresenceSettings) -> Arc<Self> {
        let session_key = settings
            .session_key
            .clone()
            .unwrap_or_else(PresenceKey::generate);
        debug!(key = %session_key, "Presence session key");

        Arc::new(Self {
            client,
            runtime: Handle::current(),
            settings,
            session_key,
            rooms: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn session_key(&self) -> &PresenceKey {
        &self.session_key
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    /// Presence for `room`, or for the global pool when pooling is global
    pub fn presence(self: &Arc<Self>, room: &RoomKey, user_id: Option<UserId>) -> Readable<PresenceSnapshot> {
        match self.settings.pool {
            PoolMode::Global => self.global_presence(user_id),
            PoolMode::PerRoom => self.observe(room.clone(), room.as_str().to_string(), user_id),
        }
    }

    /// Presence for the global pool
    pub fn global_presence(self: &Arc<Self>, user_id: Option<UserId>) -> Readable<PresenceSnapshot> {
        self.observe(
            self.settings.global_room.clone(),
            ANY_ROOM_LABEL.to_string(),
            user_id,
        )
    }

    fn observe(
        self: &Arc<Self>,
        room: RoomKey,
        label: String,
        user_id: Option<UserId>,
    ) -> Readable<PresenceSnapshot> {
        let service = Arc::downgrade(self);

        Readable::with_start(PresenceSnapshot::disconnected(), move |set| {
            let Some(this) = service.upgrade() else {
                return noop_teardown();
            };

            let store = match this.acquire(&room, &label, user_id.clone()) {
                Ok(store) => store,
                Err(e) => {
                    warn!(room = %room, error = %e, "Cannot observe presence");
                    set.set(PresenceSnapshot::disconnected());
                    return noop_teardown();
                }
            };

            let forward = store.subscribe(move |snapshot| set.set(*snapshot));
            let service: Weak<Self> = service.clone();
            let room = room.clone();

            Box::new(move || {
                forward.unsubscribe();
                if let Some(this) = service.upgrade() {
                    this.release(&room);
                }
            })
        })
    }

    fn acquire(
        &self,
        room: &RoomKey,
        label: &str,
        user_id: Option<UserId>,
    ) -> Result<Readable<PresenceSnapshot>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ZooError::ServiceShutDown);
        }

        let mut rooms = self.rooms();
        if let Some(handle) = rooms.get_mut(room) {
            handle.refs += 1;
            handle.retrack(user_id);
            debug!(room = %room, refs = handle.refs, "Presence room shared");
            return Ok(handle.store.clone());
        }

        let handle = RoomHandle::open(
            self.client.as_ref(),
            &self.runtime,
            RoomSpec {
                room: room.clone(),
                label: label.to_string(),
                user_id,
                presence_key: &self.session_key,
                unique: self.settings.unique,
            },
        );
        let store = handle.store.clone();
        rooms.insert(room.clone(), handle);
        Ok(store)
    }

    fn release(&self, room: &RoomKey) {
        let mut rooms = self.rooms();
        let Some(handle) = rooms.get_mut(room) else {
            return;
        };

        handle.refs = handle.refs.saturating_sub(1);
        debug!(room = %room, refs = handle.refs, "Presence room released");

        if handle.refs == 0
            && self.settings.release == ReleasePolicy::RefCounted
            && let Some(handle) = rooms.remove(room)
        {
            let task = handle.close();
            self.retired().push(task);
        }
    }

    /// Subscribe a room's channel again, e.g. after a transport error
    pub fn resubscribe(&self, room: &RoomKey) -> Result<()> {
        let rooms = self.rooms();
        let handle = rooms
            .get(room)
            .ok_or_else(|| ZooError::RoomNotOpen(room.clone()))?;
        handle.resubscribe();
        Ok(())
    }

    /// Latest snapshot published for an open room
    pub fn snapshot(&self, room: &RoomKey) -> Option<PresenceSnapshot> {
        self.rooms().get(room).map(|h| h.store.get())
    }

    /// Channel status of an open room
    pub fn room_status(&self, room: &RoomKey) -> Option<ChannelStatus> {
        self.rooms().get(room).map(|h| *h.status.borrow())
    }

    /// Rooms with a live channel, sorted
    pub fn open_rooms(&self) -> Vec<RoomKey> {
        let mut rooms: Vec<RoomKey> = self.rooms().keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Untrack and unsubscribe every room, then wait for the drivers.
    ///
    /// Observers still subscribed see a disconnected snapshot. Later
    /// subscriptions get a disconnected snapshot and open nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let rooms: Vec<(RoomKey, RoomHandle)> = self.rooms().drain().collect();
        let mut tasks: Vec<JoinHandle<()>> = rooms
            .into_iter()
            .map(|(room, handle)| {
                debug!(room = %room, "Closing presence room");
                handle.close()
            })
            .collect();
        tasks.append(&mut self.retired());

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Presence room driver failed");
            }
        }

        info!("Presence service shut down");
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomKey, RoomHandle>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retired(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn noop_teardown() -> Teardown {
    Box::new(|| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use zoo_channel_api::MockChannelClient;
    use zoo_config::UniquePolicy;

    const GLOBAL_TOPIC: &str = "presence:__global__";

    fn settings() -> PresenceSettings {
        PresenceSettings::default()
    }

    fn service_with(mock: &MockChannelClient, settings: PresenceSettings) -> Arc<PresenceService> {
        PresenceService::new(Arc::new(mock.clone()), settings)
    }

    fn observe(
        readable: &Readable<PresenceSnapshot>,
    ) -> (crate::observable::Subscription, mpsc::UnboundedReceiver<PresenceSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = readable.subscribe(move |s| {
            let _ = tx.send(*s);
        });
        (sub, rx)
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<PresenceSnapshot>,
        pred: impl Fn(&PresenceSnapshot) -> bool,
    ) -> PresenceSnapshot {
        timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = rx.recv().await.expect("observer channel closed");
                if pred(&snapshot) {
                    return snapshot;
                }
            }
        })
        .await
        .expect("timed out waiting for snapshot")
    }

    async fn eventually(cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[tokio::test]
    async fn observer_sees_itself_once_subscribed() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let readable = service.global_presence(Some(UserId::new("u1")));
        let (_sub, mut rx) = observe(&readable);

        assert_eq!(rx.recv().await, Some(PresenceSnapshot::disconnected()));
        let snapshot = wait_for(&mut rx, |s| s.connected && s.tabs == 1).await;
        assert_eq!(snapshot.unique, 1);

        let state = mock.topic_state(GLOBAL_TOPIC);
        let metas = &state[service.session_key().as_str()];
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0]["user_id"], json!("u1"));
        assert_eq!(metas[0]["room"], json!(ANY_ROOM_LABEL));
    }

    #[tokio::test]
    async fn many_observers_share_one_channel() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let a = service.global_presence(None);
        let b = service.presence(&RoomKey::new("lobby"), None);
        let (_sa, mut ra) = observe(&a);
        let (_sb, mut rb) = observe(&b);

        wait_for(&mut ra, |s| s.tabs == 1).await;
        wait_for(&mut rb, |s| s.tabs == 1).await;

        assert_eq!(mock.channels_opened(), 1);
        assert_eq!(mock.subscriber_count(GLOBAL_TOPIC), 1);
        assert_eq!(service.open_rooms(), vec![RoomKey::new("__global__")]);
    }

    #[tokio::test]
    async fn per_room_pool_opens_separate_channels() {
        let mock = MockChannelClient::new();
        let service = service_with(
            &mock,
            PresenceSettings {
                pool: PoolMode::PerRoom,
                ..settings()
            },
        );

        let lobby = service.presence(&RoomKey::new("lobby"), None);
        let board = service.presence(&RoomKey::new("board"), None);
        let (_s1, mut r1) = observe(&lobby);
        let (_s2, mut r2) = observe(&board);
        wait_for(&mut r1, |s| s.connected).await;
        wait_for(&mut r2, |s| s.connected).await;

        assert_eq!(mock.channels_opened(), 2);
        let state = mock.topic_state("presence:lobby");
        assert_eq!(state[service.session_key().as_str()][0]["room"], json!("lobby"));
    }

    #[tokio::test]
    async fn counts_other_sessions() {
        let mock = MockChannelClient::new();
        let service = service_with(
            &mock,
            PresenceSettings {
                unique: UniquePolicy::DistinctUser,
                ..settings()
            },
        );

        let readable = service.global_presence(Some(UserId::new("u1")));
        let (_sub, mut rx) = observe(&readable);
        wait_for(&mut rx, |s| s.tabs == 1).await;

        mock.join_remote(GLOBAL_TOPIC, "other-tab", json!({"user_id": "u1", "room": "__any__", "ts": 0}));
        let snapshot = wait_for(&mut rx, |s| s.tabs == 2).await;
        assert_eq!(snapshot.unique, 1);

        mock.join_remote(GLOBAL_TOPIC, "guest", json!({"user_id": null, "room": "__any__", "ts": 0}));
        mock.join_remote(GLOBAL_TOPIC, "u2", json!({"user_id": "u2", "room": "__any__", "ts": 0}));
        let snapshot = wait_for(&mut rx, |s| s.tabs == 4).await;
        assert_eq!(snapshot.unique, 2);

        mock.leave_remote(GLOBAL_TOPIC, "other-tab");
        let snapshot = wait_for(&mut rx, |s| s.tabs == 3).await;
        assert_eq!(snapshot.unique, 2);
    }

    #[tokio::test]
    async fn terminal_status_resets_and_resubscribe_recovers() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());
        let global = RoomKey::new("__global__");

        let readable = service.global_presence(None);
        let (_sub, mut rx) = observe(&readable);
        wait_for(&mut rx, |s| s.connected && s.tabs == 1).await;

        for status in [
            ChannelStatus::Closed,
            ChannelStatus::ChannelError,
            ChannelStatus::TimedOut,
        ] {
            mock.emit_status(GLOBAL_TOPIC, status);
            let snapshot = wait_for(&mut rx, |s| !s.connected).await;
            assert_eq!(snapshot, PresenceSnapshot::disconnected(), "{}", status);
            assert_eq!(service.room_status(&global), Some(status));

            service.resubscribe(&global).unwrap();
            wait_for(&mut rx, |s| s.connected && s.tabs == 1).await;
            assert_eq!(service.room_status(&global), Some(ChannelStatus::Subscribed));
        }
    }

    #[tokio::test]
    async fn sync_republishes_unchanged_snapshot() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let readable = service.global_presence(None);
        let (_sub, mut rx) = observe(&readable);
        let before = wait_for(&mut rx, |s| s.connected && s.tabs == 1).await;

        // Let the sync caused by our own track settle first
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}

        mock.emit_sync(GLOBAL_TOPIC);
        let again = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no snapshot after sync");
        assert_eq!(again, Some(before));
        assert_eq!(mock.channels_opened(), 1);
    }

    #[tokio::test]
    async fn observers_may_subscribe_off_runtime() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());
        let readable = service.global_presence(Some(UserId::new("u4")));

        let (sub, mut rx) = std::thread::spawn(move || observe(&readable))
            .join()
            .unwrap();
        wait_for(&mut rx, |s| s.connected && s.tabs == 1).await;

        drop(sub);
        assert!(service.open_rooms().is_empty());
        eventually(|| mock.unsubscribe_count() == 1).await;
    }

    #[tokio::test]
    async fn sync_after_terminal_keeps_disconnected() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let readable = service.global_presence(None);
        let (_sub, mut rx) = observe(&readable);
        wait_for(&mut rx, |s| s.connected).await;

        mock.emit_status(GLOBAL_TOPIC, ChannelStatus::TimedOut);
        wait_for(&mut rx, |s| !s.connected).await;

        mock.join_remote(GLOBAL_TOPIC, "late", json!({"user_id": "x"}));
        let snapshot = wait_for(&mut rx, |s| s.tabs == 2).await;
        assert!(!snapshot.connected);
    }

    #[tokio::test]
    async fn resubscribe_unknown_room_fails() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let result = service.resubscribe(&RoomKey::new("nowhere"));
        assert!(matches!(result, Err(ZooError::RoomNotOpen(_))));
    }

    #[tokio::test]
    async fn track_failure_still_publishes() {
        let mock = MockChannelClient::new();
        mock.set_fail_track(true);
        let service = service_with(&mock, settings());

        let readable = service.global_presence(None);
        let (_sub, mut rx) = observe(&readable);

        let snapshot = wait_for(&mut rx, |s| s.connected).await;
        assert_eq!(snapshot.tabs, 0);
    }

    #[tokio::test]
    async fn identity_change_retracks() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let anon = service.global_presence(None);
        let (_s1, mut r1) = observe(&anon);
        wait_for(&mut r1, |s| s.tabs == 1).await;

        let named = service.global_presence(Some(UserId::new("u9")));
        let _s2 = named.subscribe(|_| {});

        let key = service.session_key().as_str().to_string();
        eventually(|| mock.topic_state(GLOBAL_TOPIC)[&key][0]["user_id"] == json!("u9")).await;
        assert_eq!(mock.topic_state(GLOBAL_TOPIC)[&key].len(), 1);
    }

    #[tokio::test]
    async fn identity_change_before_subscribed_is_deferred() {
        let mock = MockChannelClient::new();
        mock.set_auto_subscribe(false);
        let service = service_with(&mock, settings());

        let anon = service.global_presence(None);
        let _s1 = anon.subscribe(|_| {});
        let named = service.global_presence(Some(UserId::new("u3")));
        let (_s2, mut rx) = observe(&named);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mock.topic_state(GLOBAL_TOPIC).is_empty());

        mock.emit_status(GLOBAL_TOPIC, ChannelStatus::Subscribed);
        wait_for(&mut rx, |s| s.tabs == 1).await;

        let key = service.session_key().as_str().to_string();
        eventually(|| {
            mock.topic_state(GLOBAL_TOPIC)
                .get(&key)
                .is_some_and(|metas| metas[0]["user_id"] == json!("u3"))
        })
        .await;
    }

    #[tokio::test]
    async fn last_observer_releases_room() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let readable = service.global_presence(None);
        let (a, mut rx) = observe(&readable);
        let b = readable.subscribe(|_| {});
        wait_for(&mut rx, |s| s.tabs == 1).await;

        drop(a);
        assert_eq!(service.open_rooms().len(), 1);
        drop(b);
        assert!(service.open_rooms().is_empty());

        eventually(|| mock.unsubscribe_count() == 1).await;
        assert!(mock.topic_state(GLOBAL_TOPIC).is_empty());
        assert_eq!(mock.subscriber_count(GLOBAL_TOPIC), 0);
    }

    #[tokio::test]
    async fn keep_alive_outlives_observers() {
        let mock = MockChannelClient::new();
        let service = service_with(
            &mock,
            PresenceSettings {
                release: ReleasePolicy::KeepAlive,
                ..settings()
            },
        );
        let global = RoomKey::new("__global__");

        let readable = service.global_presence(None);
        let (sub, mut rx) = observe(&readable);
        wait_for(&mut rx, |s| s.tabs == 1).await;
        drop(sub);

        assert_eq!(service.open_rooms(), vec![global.clone()]);
        assert_eq!(service.snapshot(&global).map(|s| s.tabs), Some(1));

        // A returning observer reuses the live channel
        let (_sub, mut rx) = observe(&service.global_presence(None));
        assert_eq!(rx.recv().await.map(|s| s.tabs), Some(1));
        assert_eq!(mock.channels_opened(), 1);

        service.shutdown().await;
        assert_eq!(mock.unsubscribe_count(), 1);
        assert!(mock.topic_state(GLOBAL_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn repeated_cycles_leave_no_trace() {
        let mock = MockChannelClient::new();
        let watcher = service_with(&mock, settings());
        let tab = service_with(&mock, settings());

        let (_watch_sub, mut watch_rx) = observe(&watcher.global_presence(None));
        let baseline = wait_for(&mut watch_rx, |s| s.connected && s.tabs == 1).await;

        for _ in 0..2 {
            let sub = tab.global_presence(Some(UserId::new("u1"))).subscribe(|_| {});
            wait_for(&mut watch_rx, |s| s.tabs == 2).await;
            drop(sub);
            let after = wait_for(&mut watch_rx, |s| s.tabs == 1).await;
            assert_eq!(after, baseline);
        }

        assert_eq!(mock.channels_opened(), 3);
    }

    #[tokio::test]
    async fn shutdown_untracks_everything() {
        let mock = MockChannelClient::new();
        let service = service_with(
            &mock,
            PresenceSettings {
                pool: PoolMode::PerRoom,
                ..settings()
            },
        );

        let (_s1, mut r1) = observe(&service.presence(&RoomKey::new("a"), None));
        let (_s2, mut r2) = observe(&service.presence(&RoomKey::new("b"), None));
        wait_for(&mut r1, |s| s.tabs == 1).await;
        wait_for(&mut r2, |s| s.tabs == 1).await;

        service.shutdown().await;

        assert!(service.is_shut_down());
        assert!(service.open_rooms().is_empty());
        assert_eq!(mock.unsubscribe_count(), 2);
        assert!(mock.topic_state("presence:a").is_empty());
        wait_for(&mut r1, |s| !s.connected).await;

        // Nothing reopens after shutdown
        let (_s3, mut r3) = observe(&service.presence(&RoomKey::new("c"), None));
        assert_eq!(r3.recv().await, Some(PresenceSnapshot::disconnected()));
        assert_eq!(mock.channels_opened(), 2);
    }

    #[tokio::test]
    async fn untrack_failure_still_unsubscribes() {
        let mock = MockChannelClient::new();
        let service = service_with(&mock, settings());

        let (_sub, mut rx) = observe(&service.global_presence(None));
        wait_for(&mut rx, |s| s.tabs == 1).await;

        mock.set_fail_untrack(true);
        service.shutdown().await;
        assert_eq!(mock.unsubscribe_count(), 1);
        assert_eq!(mock.subscriber_count(GLOBAL_TOPIC), 0);
    }

    #[tokio::test]
    async fn configured_session_key_is_used() {
        let mock = MockChannelClient::new();
        let service = service_with(
            &mock,
            PresenceSettings {
                session_key: Some(PresenceKey::new("tab-1")),
                ..settings()
            },
        );
        assert_eq!(service.session_key().as_str(), "tab-1");
    }
}
