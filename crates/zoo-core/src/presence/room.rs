//! Per-room channel handle and its driver task

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zoo_api::{ChannelStatus, PresenceMeta, PresenceSnapshot};
use zoo_channel_api::{ChannelClient, ChannelEvent, ChannelOptions, PresenceChannel};
use zoo_config::UniquePolicy;
use zoo_util::{PresenceKey, RoomKey, UserId};

use super::aggregate::aggregate;
use crate::observable::{Readable, Setter};

/// Instructions from the service to a room's driver
#[derive(Debug)]
pub(crate) enum RoomCommand {
    /// Track again with a new identity
    Retrack(Option<UserId>),
    /// Subscribe again after a terminal status
    Resubscribe,
    /// Untrack, unsubscribe and stop
    Shutdown,
}

/// Service-side view of an open room
pub(crate) struct RoomHandle {
    pub(crate) store: Readable<PresenceSnapshot>,
    pub(crate) status: watch::Receiver<ChannelStatus>,
    pub(crate) refs: usize,
    user_id: Option<UserId>,
    commands: mpsc::UnboundedSender<RoomCommand>,
    task: JoinHandle<()>,
}

/// Everything needed to open a room
pub(crate) struct RoomSpec<'a> {
    pub room: RoomKey,
    pub label: String,
    pub user_id: Option<UserId>,
    pub presence_key: &'a PresenceKey,
    pub unique: UniquePolicy,
}

impl RoomHandle {
    /// Open the room's channel, subscribe, and spawn its driver on `runtime`
    pub(crate) fn open(client: &dyn ChannelClient, runtime: &Handle, spec: RoomSpec<'_>) -> Self {
        let channel = client.channel(
            &spec.room.channel_name(),
            ChannelOptions::new(spec.presence_key.clone()),
        );
        let events = channel.subscribe();

        let (store, snapshot) = Readable::writable(PresenceSnapshot::disconnected());
        let (status_tx, status) = watch::channel(ChannelStatus::Subscribing);
        let (commands, command_rx) = mpsc::unbounded_channel();

        info!(room = %spec.room, channel = channel.name(), "Presence room opened");

        let driver = RoomDriver {
            room: spec.room,
            label: spec.label,
            channel,
            user_id: spec.user_id.clone(),
            unique: spec.unique,
            connected: false,
            status: status_tx,
            snapshot,
        };
        let task = runtime.spawn(driver.run(events, command_rx));

        Self {
            store,
            status,
            refs: 1,
            user_id: spec.user_id,
            commands,
            task,
        }
    }

    /// Ask the driver to re-track if the identity changed
    pub(crate) fn retrack(&mut self, user_id: Option<UserId>) {
        if self.user_id != user_id {
            self.user_id = user_id.clone();
            self.send(RoomCommand::Retrack(user_id));
        }
    }

    pub(crate) fn resubscribe(&self) {
        self.send(RoomCommand::Resubscribe);
    }

    /// Tell the driver to leave; returns the task to await
    pub(crate) fn close(self) -> JoinHandle<()> {
        self.send(RoomCommand::Shutdown);
        self.task
    }

    fn send(&self, command: RoomCommand) {
        if self.commands.send(command).is_err() {
            debug!("Room driver already stopped");
        }
    }
}

struct RoomDriver {
    room: RoomKey,
    label: String,
    channel: Arc<dyn PresenceChannel>,
    user_id: Option<UserId>,
    unique: UniquePolicy,
    connected: bool,
    status: watch::Sender<ChannelStatus>,
    snapshot: Setter<PresenceSnapshot>,
}

impl RoomDriver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<RoomCommand>,
    ) {
        let mut events_open = true;

        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!(room = %self.room, "Channel event stream ended");
                        events_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(RoomCommand::Retrack(user_id)) => {
                        self.user_id = user_id;
                        // Not yet subscribed: the SUBSCRIBED handler tracks the new identity
                        if *self.status.borrow() == ChannelStatus::Subscribed {
                            self.track().await;
                        }
                    }
                    Some(RoomCommand::Resubscribe) => {
                        debug!(room = %self.room, "Resubscribing");
                        events = self.channel.subscribe();
                        events_open = true;
                        self.status.send_replace(ChannelStatus::Subscribing);
                    }
                    Some(RoomCommand::Shutdown) | None => {
                        self.close().await;
                        break;
                    }
                },
            }
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Status(status) => {
                debug!(room = %self.room, %status, "Channel status");
                self.status.send_replace(status);

                if status == ChannelStatus::Subscribed {
                    self.connected = true;
                    self.track().await;
                    self.publish();
                } else if status.is_terminal() {
                    warn!(room = %self.room, %status, "Presence channel lost");
                    self.connected = false;
                    self.snapshot.set(PresenceSnapshot::disconnected());
                }
            }
            ChannelEvent::PresenceSync => self.publish(),
        }
    }

    fn publish(&self) {
        let snapshot = aggregate(&self.channel.presence_state(), self.unique, self.connected);
        self.snapshot.set(snapshot);
    }

    async fn track(&self) {
        let meta = PresenceMeta {
            user_id: self.user_id.clone(),
            room: self.label.clone(),
            ts: zoo_util::unix_millis(&zoo_util::now()),
        };

        let payload = match serde_json::to_value(&meta) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(room = %self.room, error = %e, "Failed to encode presence metadata");
                return;
            }
        };

        if let Err(e) = self.channel.track(payload).await {
            warn!(room = %self.room, error = %e, "Presence track failed");
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.untrack().await {
            warn!(room = %self.room, error = %e, "Presence untrack failed");
        }
        if let Err(e) = self.channel.unsubscribe().await {
            warn!(room = %self.room, error = %e, "Channel unsubscribe failed");
        }

        self.connected = false;
        self.status.send_replace(ChannelStatus::Unsubscribed);
        self.snapshot.set(PresenceSnapshot::disconnected());
        info!(room = %self.room, "Presence room closed");
    }
}
