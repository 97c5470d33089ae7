//! Per-player online/away/offline status
//!
//! Each of a player's sessions tracks `{user_id, active, updated_at}` in the
//! player's own channel through a [`PlayerPresenceTracker`]. Anyone can watch
//! that channel with [`watch_player_status`]: no entries means offline, any
//! active entry means online, otherwise away.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zoo_api::{ChannelStatus, PlayerPresenceMeta, PlayerStatus};
use zoo_channel_api::{ChannelClient, ChannelEvent, ChannelOptions, PresenceChannel, PresenceState};
use zoo_util::{PresenceKey, UserId};

use crate::observable::{Readable, Setter};

/// Channel carrying one player's presence
pub fn player_channel_name(user_id: &UserId) -> String {
    format!("presence:player:{}", user_id)
}

/// Reduce a player channel's presence state to a status
pub fn player_status(state: &PresenceState) -> PlayerStatus {
    let mut metas = state.values().flatten().peekable();
    if metas.peek().is_none() {
        return PlayerStatus::Offline;
    }

    if metas.any(|meta| meta.get("active").and_then(Value::as_bool) == Some(true)) {
        PlayerStatus::Online
    } else {
        PlayerStatus::Away
    }
}

/// Watch a player's status.
///
/// Without a user the status is permanently offline. Otherwise the first
/// observer opens `presence:player:{id}` under a fresh presence key and the
/// last one closes it, resetting the status to offline.
///
/// With a user this must be called within a tokio runtime; observers may
/// subscribe from any thread afterwards.
pub fn watch_player_status(
    client: Arc<dyn ChannelClient>,
    user_id: Option<UserId>,
) -> Readable<PlayerStatus> {
    let Some(user_id) = user_id else {
        return Readable::constant(PlayerStatus::Offline);
    };

    let runtime = Handle::current();
    // Each start owns one generation; a retired watcher never writes again
    let generation = Arc::new(AtomicU64::new(0));

    Readable::with_start(PlayerStatus::Offline, move |set| {
        let live = generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = client.channel(
            &player_channel_name(&user_id),
            ChannelOptions::new(PresenceKey::generate()),
        );
        let events = channel.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();

        debug!(user = %user_id, generation = live, "Watching player status");
        let slot = WatcherSlot {
            set: set.clone(),
            generation: generation.clone(),
            live,
        };
        runtime.spawn(run_watcher(channel, events, stop_rx, slot));

        let generation = generation.clone();
        Box::new(move || {
            let _ = stop_tx.send(());
            // Fails when a restart already took over the store
            let retired = live + 1;
            if generation
                .compare_exchange(live, retired, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                set.set_if(PlayerStatus::Offline, || {
                    generation.load(Ordering::SeqCst) == retired
                });
            }
        })
    })
}

/// Write access for one watcher generation
struct WatcherSlot {
    set: Setter<PlayerStatus>,
    generation: Arc<AtomicU64>,
    live: u64,
}

impl WatcherSlot {
    fn publish(&self, status: PlayerStatus) {
        self.set
            .set_if(status, || self.generation.load(Ordering::SeqCst) == self.live);
    }
}

async fn run_watcher(
    channel: Arc<dyn PresenceChannel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut stop: oneshot::Receiver<()>,
    slot: WatcherSlot,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            event = events.recv() => match event {
                Some(ChannelEvent::Status(ChannelStatus::Subscribed) | ChannelEvent::PresenceSync) => {
                    slot.publish(player_status(&channel.presence_state()));
                }
                Some(ChannelEvent::Status(status)) => {
                    debug!(channel = channel.name(), %status, "Player channel status");
                }
                None => {
                    // Stream gone; nothing more will change until teardown
                    let _ = (&mut stop).await;
                    break;
                }
            },
        }
    }

    // Teardown already reset the status
    if let Err(e) = channel.unsubscribe().await {
        warn!(channel = channel.name(), error = %e, "Channel unsubscribe failed");
    }
}

/// Whether the tracking session is visible to the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Activity changes that re-broadcast the tracked state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    Visibility(Visibility),
    Focus,
    Blur,
}

enum TrackerCommand {
    Signal(ActivitySignal),
    Cleanup,
}

/// Tracks this session in its player's channel
///
/// Dropping the tracker cleans up in the background; [`cleanup`](Self::cleanup)
/// waits for it.
pub struct PlayerPresenceTracker {
    commands: Option<mpsc::UnboundedSender<TrackerCommand>>,
    task: Option<JoinHandle<()>>,
}

impl PlayerPresenceTracker {
    /// Start tracking. Without a user the tracker does nothing.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        client: &dyn ChannelClient,
        user_id: Option<UserId>,
        visibility: Visibility,
    ) -> Self {
        let Some(user_id) = user_id else {
            return Self::inert();
        };

        let channel = client.channel(
            &player_channel_name(&user_id),
            ChannelOptions::new(PresenceKey::generate()),
        );
        let events = channel.subscribe();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = TrackerDriver {
            channel,
            user_id,
            visibility,
            subscribed: false,
        };

        Self {
            commands: Some(commands),
            task: Some(tokio::spawn(driver.run(events, command_rx))),
        }
    }

    /// A tracker with no channel
    pub fn inert() -> Self {
        Self {
            commands: None,
            task: None,
        }
    }

    pub fn is_inert(&self) -> bool {
        self.commands.is_none()
    }

    pub fn signal(&self, signal: ActivitySignal) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(TrackerCommand::Signal(signal));
        }
    }

    /// Untrack (if subscribed) and unsubscribe
    pub async fn cleanup(mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(TrackerCommand::Cleanup);
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Player presence tracker failed");
        }
    }
}

impl Drop for PlayerPresenceTracker {
    fn drop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(TrackerCommand::Cleanup);
        }
    }
}

struct TrackerDriver {
    channel: Arc<dyn PresenceChannel>,
    user_id: UserId,
    visibility: Visibility,
    subscribed: bool,
}

impl TrackerDriver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<TrackerCommand>,
    ) {
        let mut events_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(ChannelEvent::Status(ChannelStatus::Subscribed)) => {
                        self.subscribed = true;
                        self.broadcast().await;
                    }
                    Some(_) => {}
                    None => events_open = false,
                },
                command = commands.recv() => match command {
                    Some(TrackerCommand::Signal(signal)) => {
                        if let ActivitySignal::Visibility(visibility) = signal {
                            self.visibility = visibility;
                        }
                        self.broadcast().await;
                    }
                    Some(TrackerCommand::Cleanup) | None => {
                        self.cleanup().await;
                        break;
                    }
                },
            }
        }
    }

    async fn broadcast(&self) {
        if !self.subscribed {
            return;
        }

        let meta = PlayerPresenceMeta {
            user_id: self.user_id.clone(),
            active: self.visibility == Visibility::Visible,
            updated_at: zoo_util::unix_millis(&zoo_util::now()),
        };

        let result = match serde_json::to_value(&meta) {
            Ok(payload) => self.channel.track(payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(user = %self.user_id, error = %e, "Player presence track failed");
        }
    }

    async fn cleanup(&mut self) {
        if self.subscribed {
            self.subscribed = false;
            if let Err(e) = self.channel.untrack().await {
                warn!(user = %self.user_id, error = %e, "Player presence untrack failed");
            }
        }
        if let Err(e) = self.channel.unsubscribe().await {
            warn!(user = %self.user_id, error = %e, "Channel unsubscribe failed");
        }
        debug!(user = %self.user_id, "Player presence tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;
    use zoo_channel_api::MockChannelClient;

    fn state(metas: &[Value]) -> PresenceState {
        let mut state = PresenceState::new();
        for (i, meta) in metas.iter().enumerate() {
            state.insert(format!("k{}", i), vec![meta.clone()]);
        }
        state
    }

    fn observe(readable: &Readable<PlayerStatus>) -> (crate::observable::Subscription, mpsc::UnboundedReceiver<PlayerStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = readable.subscribe(move |s| {
            let _ = tx.send(*s);
        });
        (sub, rx)
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<PlayerStatus>, want: PlayerStatus) {
        timeout(Duration::from_secs(2), async {
            while rx.recv().await.expect("observer channel closed") != want {}
        })
        .await
        .expect("timed out waiting for status");
    }

    #[test]
    fn reduce_status() {
        assert_eq!(player_status(&PresenceState::new()), PlayerStatus::Offline);
        assert_eq!(
            player_status(&state(&[json!({"active": false}), json!({"active": true})])),
            PlayerStatus::Online
        );
        assert_eq!(
            player_status(&state(&[json!({"active": false}), json!({})])),
            PlayerStatus::Away
        );
        // Present but malformed still counts as there
        assert_eq!(player_status(&state(&[json!("?")])), PlayerStatus::Away);
    }

    #[test]
    fn channel_name() {
        assert_eq!(player_channel_name(&UserId::new("p1")), "presence:player:p1");
    }

    #[tokio::test]
    async fn no_user_is_always_offline() {
        let mock = MockChannelClient::new();
        let readable = watch_player_status(Arc::new(mock.clone()), None);
        let (_sub, mut rx) = observe(&readable);

        assert_eq!(rx.recv().await, Some(PlayerStatus::Offline));
        assert_eq!(mock.channels_opened(), 0);

        let tracker = PlayerPresenceTracker::start(&mock, None, Visibility::Visible);
        assert!(tracker.is_inert());
        tracker.signal(ActivitySignal::Focus);
        tracker.cleanup().await;
        assert_eq!(mock.channels_opened(), 0);
    }

    #[tokio::test]
    async fn tracker_drives_watcher() {
        let mock = MockChannelClient::new();
        let user = UserId::new("p1");

        let readable = watch_player_status(Arc::new(mock.clone()), Some(user.clone()));
        let (_sub, mut rx) = observe(&readable);
        wait_for(&mut rx, PlayerStatus::Offline).await;

        let tracker = PlayerPresenceTracker::start(&mock, Some(user.clone()), Visibility::Visible);
        wait_for(&mut rx, PlayerStatus::Online).await;

        tracker.signal(ActivitySignal::Visibility(Visibility::Hidden));
        wait_for(&mut rx, PlayerStatus::Away).await;

        tracker.signal(ActivitySignal::Focus);
        tracker.signal(ActivitySignal::Visibility(Visibility::Visible));
        wait_for(&mut rx, PlayerStatus::Online).await;

        tracker.cleanup().await;
        wait_for(&mut rx, PlayerStatus::Offline).await;
        assert_eq!(mock.subscriber_count("presence:player:p1"), 1);
    }

    #[tokio::test]
    async fn any_active_session_is_online() {
        let mock = MockChannelClient::new();
        let user = UserId::new("p2");

        let readable = watch_player_status(Arc::new(mock.clone()), Some(user.clone()));
        let (_sub, mut rx) = observe(&readable);

        let hidden = PlayerPresenceTracker::start(&mock, Some(user.clone()), Visibility::Hidden);
        wait_for(&mut rx, PlayerStatus::Away).await;

        let visible = PlayerPresenceTracker::start(&mock, Some(user.clone()), Visibility::Visible);
        wait_for(&mut rx, PlayerStatus::Online).await;

        visible.cleanup().await;
        wait_for(&mut rx, PlayerStatus::Away).await;
        drop(hidden);
        wait_for(&mut rx, PlayerStatus::Offline).await;
    }

    #[tokio::test]
    async fn signals_before_subscribed_are_not_broadcast() {
        let mock = MockChannelClient::new();
        mock.set_auto_subscribe(false);
        let user = UserId::new("p3");
        let topic = player_channel_name(&user);

        let tracker = PlayerPresenceTracker::start(&mock, Some(user), Visibility::Visible);
        tracker.signal(ActivitySignal::Visibility(Visibility::Hidden));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mock.topic_state(&topic).is_empty());

        mock.emit_status(&topic, ChannelStatus::Subscribed);
        timeout(Duration::from_secs(2), async {
            while mock.topic_state(&topic).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let state = mock.topic_state(&topic);
        let meta = state.values().flatten().next().unwrap();
        assert_eq!(meta["active"], json!(false));
        assert_eq!(meta["user_id"], json!("p3"));

        tracker.cleanup().await;
        assert!(mock.topic_state(&topic).is_empty());
        assert_eq!(mock.unsubscribe_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resubscribe_after_teardown_keeps_live_status() {
        let mock = MockChannelClient::new();

        for round in 0..50 {
            let user = UserId::new(format!("cycle-{}", round));
            let tracker =
                PlayerPresenceTracker::start(&mock, Some(user.clone()), Visibility::Visible);
            let readable = watch_player_status(Arc::new(mock.clone()), Some(user));

            let (first, mut rx) = observe(&readable);
            wait_for(&mut rx, PlayerStatus::Online).await;

            // The retired watcher is still winding down while the next one starts
            drop(first);
            let (_second, mut rx) = observe(&readable);
            wait_for(&mut rx, PlayerStatus::Online).await;

            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(readable.get(), PlayerStatus::Online, "round {}", round);

            tracker.cleanup().await;
        }
    }

    #[tokio::test]
    async fn observers_may_subscribe_off_runtime() {
        let mock = MockChannelClient::new();
        let user = UserId::new("p5");
        let readable = watch_player_status(Arc::new(mock.clone()), Some(user.clone()));
        let tracker = PlayerPresenceTracker::start(&mock, Some(user), Visibility::Visible);

        let (sub, mut rx) = std::thread::spawn(move || observe(&readable))
            .join()
            .unwrap();
        wait_for(&mut rx, PlayerStatus::Online).await;

        drop(sub);
        tracker.cleanup().await;
    }

    #[tokio::test]
    async fn watcher_teardown_unsubscribes() {
        let mock = MockChannelClient::new();
        let user = UserId::new("p4");
        let topic = player_channel_name(&user);

        let readable = watch_player_status(Arc::new(mock.clone()), Some(user.clone()));
        let tracker = PlayerPresenceTracker::start(&mock, Some(user), Visibility::Visible);

        let (sub, mut rx) = observe(&readable);
        wait_for(&mut rx, PlayerStatus::Online).await;
        drop(sub);

        assert_eq!(readable.get(), PlayerStatus::Offline);
        timeout(Duration::from_secs(2), async {
            while mock.unsubscribe_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // Only the tracker is left on the topic
        assert_eq!(mock.subscriber_count(&topic), 1);

        tracker.cleanup().await;
    }
}
