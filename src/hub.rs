//! Hub actor implementation
//!
//! The single coordination point for registry mutation and fan-out.
//! All registry access happens inside `Hub::run`, one command at a time,
//! so register, unregister and broadcast never interleave. Producers talk
//! to it through a cloneable [`HubHandle`].
//!
//! Delivery onto a connection's queue never waits: a full queue means the
//! connection is not keeping up, and it is pruned on the spot.

use std::collections::HashSet;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::HubConfig;
use crate::connection::{Connection, ConnectionInfo, Registration};
use crate::dispatch::{self, Route};
use crate::error::{FrameError, HubError, SendError};
use crate::message::{ClientMessage, Event, PresenceStatus};
use crate::registry::Registry;
use crate::types::{ConnectionId, UserId};

/// Commands sent from handles to the Hub actor
#[derive(Debug)]
pub enum HubCommand {
    /// New transport connection for a user
    Register {
        user_id: UserId,
        reply: oneshot::Sender<Registration>,
    },
    /// Connection is going away (may arrive more than once)
    Unregister { connection_id: ConnectionId },
    /// Deliver to every connection of one user
    SendToUser { user_id: UserId, event: Event },
    /// Deliver to every connection of each listed user, once per connection
    SendToUsers { user_ids: Vec<UserId>, event: Event },
    /// Deliver to one connection
    SendToConnection {
        connection_id: ConnectionId,
        event: Event,
    },
    /// Deliver to every connection
    Broadcast { event: Event },
    /// Deliver to every connection except one
    BroadcastExcluding {
        connection_id: ConnectionId,
        event: Event,
    },
    /// Frame read from a client, decoded or not
    Inbound {
        connection_id: ConnectionId,
        frame: Result<ClientMessage, FrameError>,
    },
    /// Snapshot of one user's connections
    LookupByUser {
        user_id: UserId,
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    /// Distinct online users
    OnlineUsers { reply: oneshot::Sender<Vec<UserId>> },
    /// Whether a user has at least one connection
    UserOnline {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    /// Counters
    Stats { reply: oneshot::Sender<HubStats> },
    /// Stop the actor and close every queue
    Shutdown,
}

/// Registry counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
}

/// The Hub actor
///
/// Owns the registry. Processes commands from handles until shut down or
/// until every handle is dropped.
pub struct Hub {
    /// Live connections and the by-user index
    registry: Registry,
    /// Connections pruned during the current command, awaiting their
    /// offline announcement
    departed: Vec<ConnectionInfo>,
    /// Outbound queue size for new connections
    queue_capacity: usize,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a Hub with the given command receiver
    pub fn new(receiver: mpsc::Receiver<HubCommand>, queue_capacity: usize) -> Self {
        Self {
            registry: Registry::new(),
            departed: Vec::new(),
            queue_capacity,
            receiver,
        }
    }

    /// Start a Hub on the current runtime
    ///
    /// The returned task finishes after [`HubHandle::stop`] or once every
    /// handle has been dropped.
    pub fn spawn(config: &HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.command_buffer.max(1));
        let hub = Hub::new(receiver, config.queue_capacity);
        let task = tokio::spawn(hub.run());
        (HubHandle::new(sender), task)
    }

    /// Run the Hub event loop
    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(cmd) = self.receiver.recv().await {
            if !self.handle_command(cmd) {
                break;
            }
        }

        self.receiver.close();
        let remaining = self.registry.drain();
        info!("Hub shutting down, closing {} connections", remaining.len());
        for connection in remaining {
            connection.close();
        }
    }

    /// Process a single command
    ///
    /// Returns false when the actor should stop.
    fn handle_command(&mut self, cmd: HubCommand) -> bool {
        let keep_running = self.apply(cmd);
        debug_assert!(self.registry.is_consistent(), "registry maps out of sync");
        keep_running
    }

    fn apply(&mut self, cmd: HubCommand) -> bool {
        match cmd {
            HubCommand::Register { user_id, reply } => {
                self.handle_register(user_id, reply);
            }
            HubCommand::Unregister { connection_id } => {
                self.handle_unregister(connection_id);
            }
            HubCommand::SendToUser { user_id, event } => {
                self.send_to_user(user_id, event);
            }
            HubCommand::SendToUsers { user_ids, event } => {
                self.send_to_users(user_ids, event);
            }
            HubCommand::SendToConnection {
                connection_id,
                event,
            } => {
                self.fan_out(vec![connection_id], event);
            }
            HubCommand::Broadcast { event } => {
                self.broadcast_excluding(None, event);
            }
            HubCommand::BroadcastExcluding {
                connection_id,
                event,
            } => {
                self.broadcast_excluding(Some(connection_id), event);
            }
            HubCommand::Inbound {
                connection_id,
                frame,
            } => {
                self.handle_inbound(connection_id, frame);
            }
            HubCommand::LookupByUser { user_id, reply } => {
                let _ = reply.send(self.registry.lookup_by_user(user_id));
            }
            HubCommand::OnlineUsers { reply } => {
                let _ = reply.send(self.registry.online_users());
            }
            HubCommand::UserOnline { user_id, reply } => {
                let _ = reply.send(self.registry.is_user_online(user_id));
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    connections: self.registry.len(),
                    users: self.registry.user_count(),
                });
            }
            HubCommand::Shutdown => return false,
        }
        true
    }

    /// Handle new connection registration
    fn handle_register(&mut self, user_id: UserId, reply: oneshot::Sender<Registration>) {
        let (connection, registration) = Connection::open(user_id, self.queue_capacity);
        self.admit(connection, registration, reply);
    }

    /// Insert a freshly opened connection and hand its queue to the registrant
    ///
    /// An id already in the registry is refused: the reply is dropped, so
    /// the registrant sees [`HubError::Stopped`], and the existing entry is
    /// left alone. Returns whether the connection was admitted.
    fn admit(
        &mut self,
        connection: Connection,
        registration: Registration,
        reply: oneshot::Sender<Registration>,
    ) -> bool {
        let id = connection.id;
        let user_id = connection.user_id;
        if !self.registry.add(connection) {
            warn!("Connection id {} already registered, refusing user {}", id, user_id);
            return false;
        }

        info!("Connection {} registered for user {}", id, user_id);
        debug!(
            "Total connections: {}, online users: {}",
            self.registry.len(),
            self.registry.user_count()
        );

        if reply.send(registration).is_err() {
            // Registrant gave up before taking its queue
            debug!("Registration for {} abandoned", id);
            self.registry.remove(&id);
            return false;
        }

        self.fan_out(vec![id], Event::connected(id));
        self.broadcast_excluding(Some(id), Event::presence(user_id, PresenceStatus::Online, id));
        true
    }

    /// Handle connection removal
    ///
    /// Only the first call for a connection does anything.
    fn handle_unregister(&mut self, id: ConnectionId) {
        if self.evict(id) {
            info!("Connection {} unregistered", id);
            self.settle();
        } else {
            trace!("Connection {} already removed", id);
        }
    }

    /// Handle a frame from a client
    fn handle_inbound(&mut self, id: ConnectionId, frame: Result<ClientMessage, FrameError>) {
        let Some(origin) = self.registry.get(&id).map(Connection::info) else {
            debug!("Ignoring frame from removed connection {}", id);
            return;
        };

        if let Err(err) = &frame {
            debug!("Rejected frame from {}: {}", id, err);
        }

        match dispatch::route(&origin, frame) {
            Route::User(user_id, event) => self.send_to_user(user_id, event),
            Route::All(event) => self.broadcast_excluding(None, event),
            Route::Reply(event) => self.fan_out(vec![origin.id], event),
            Route::Drop => {}
        }
    }

    fn send_to_user(&mut self, user_id: UserId, event: Event) {
        let targets: Vec<ConnectionId> = self
            .registry
            .lookup_by_user(user_id)
            .into_iter()
            .map(|c| c.id)
            .collect();

        if targets.is_empty() {
            trace!("User {} offline, dropping {} event", user_id, event.kind());
            return;
        }
        self.fan_out(targets, event);
    }

    /// One pass over a user list; repeated ids are delivered once
    fn send_to_users(&mut self, user_ids: Vec<UserId>, event: Event) {
        let mut seen = HashSet::with_capacity(user_ids.len());
        let targets: Vec<ConnectionId> = user_ids
            .into_iter()
            .filter(|user_id| seen.insert(*user_id))
            .flat_map(|user_id| self.registry.lookup_by_user(user_id))
            .map(|c| c.id)
            .collect();

        trace!(
            "Sending {} event to {} connections of {} users",
            event.kind(),
            targets.len(),
            seen.len()
        );
        self.fan_out(targets, event);
    }

    fn broadcast_excluding(&mut self, skip: Option<ConnectionId>, event: Event) {
        let targets: Vec<ConnectionId> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| Some(*id) != skip)
            .collect();
        self.fan_out(targets, event);
    }

    /// Enqueue to each target, then announce anything pruned on the way
    fn fan_out(&mut self, targets: Vec<ConnectionId>, event: Event) {
        for id in targets {
            self.enqueue(id, event.clone());
        }
        self.settle();
    }

    /// Non-blocking push onto one connection's queue
    fn enqueue(&mut self, id: ConnectionId, event: Event) {
        let Some(connection) = self.registry.get(&id) else {
            return;
        };

        match connection.try_send(event) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                warn!(
                    "Outbound queue full for connection {} (user {}), disconnecting",
                    id, connection.user_id
                );
                self.evict(id);
            }
            Err(SendError::ChannelClosed) => {
                debug!("Writer for connection {} is gone, removing", id);
                self.evict(id);
            }
        }
    }

    /// Remove from the registry and close the queue
    ///
    /// Returns false if the connection was already gone.
    fn evict(&mut self, id: ConnectionId) -> bool {
        match self.registry.remove(&id) {
            Some(connection) => {
                self.departed.push(connection.info());
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Broadcast one offline presence per pruned connection
    ///
    /// Broadcasting can prune more connections; the loop runs until none
    /// are left, which terminates because each pass removes from the
    /// registry.
    fn settle(&mut self) {
        while let Some(gone) = self.departed.pop() {
            let event = Event::presence(gone.user_id, PresenceStatus::Offline, gone.id);
            for id in self.registry.ids() {
                self.enqueue(id, event.clone());
            }
        }
    }
}

/// Handle to a running Hub
///
/// Fan-out submissions never wait: if the coordinator's queue is full
/// they fail with [`HubError::Saturated`] and the event is dropped.
/// Lifecycle calls and queries wait for queue space.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    fn new(commands: mpsc::Sender<HubCommand>) -> Self {
        Self { commands }
    }

    /// Register a connection for `user_id`
    ///
    /// The new connection receives an `info` welcome; every other
    /// connection receives `presence: online`.
    pub async fn register(&self, user_id: UserId) -> Result<Registration, HubError> {
        self.request(|reply| HubCommand::Register { user_id, reply })
            .await
    }

    /// Remove a connection; redundant calls are harmless
    pub async fn unregister(&self, connection_id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister { connection_id }).await
    }

    /// Hand a client frame to the dispatch policy
    pub async fn inbound(
        &self,
        connection_id: ConnectionId,
        frame: Result<ClientMessage, FrameError>,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Inbound {
            connection_id,
            frame,
        })
        .await
    }

    /// Deliver to every connection of a user; offline users are a no-op
    pub fn send_to_user(&self, user_id: UserId, event: Event) -> Result<(), HubError> {
        self.submit(HubCommand::SendToUser { user_id, event })
    }

    /// Deliver to every connection of each listed user as one submission
    ///
    /// Offline users are skipped and a repeated id is delivered once.
    pub fn send_to_users(&self, user_ids: Vec<UserId>, event: Event) -> Result<(), HubError> {
        self.submit(HubCommand::SendToUsers { user_ids, event })
    }

    pub fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        event: Event,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::SendToConnection {
            connection_id,
            event,
        })
    }

    pub fn broadcast(&self, event: Event) -> Result<(), HubError> {
        self.submit(HubCommand::Broadcast { event })
    }

    pub fn broadcast_excluding(
        &self,
        connection_id: ConnectionId,
        event: Event,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::BroadcastExcluding {
            connection_id,
            event,
        })
    }

    /// Snapshot of a user's live connections
    pub async fn lookup_by_user(&self, user_id: UserId) -> Result<Vec<ConnectionInfo>, HubError> {
        self.request(|reply| HubCommand::LookupByUser { user_id, reply })
            .await
    }

    pub async fn online_users(&self) -> Result<Vec<UserId>, HubError> {
        self.request(|reply| HubCommand::OnlineUsers { reply }).await
    }

    pub async fn is_user_online(&self, user_id: UserId) -> Result<bool, HubError> {
        self.request(|reply| HubCommand::UserOnline { user_id, reply })
            .await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(|reply| HubCommand::Stats { reply }).await
    }

    /// Ask the Hub to stop; every connection's queue is closed
    pub async fn stop(&self) -> Result<(), HubError> {
        self.send(HubCommand::Shutdown).await
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.commands.send(cmd).await.map_err(|_| HubError::Stopped)
    }

    fn submit(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.commands.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!("Hub command queue full, dropping submission");
                HubError::Saturated
            }
            TrySendError::Closed(_) => HubError::Stopped,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| HubError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EventBody, EventKind, TypingRequest};
    use crate::types::ConnectionState;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn config(queue_capacity: usize) -> HubConfig {
        HubConfig {
            queue_capacity,
            ..HubConfig::default()
        }
    }

    /// Wait until every earlier command has been processed
    async fn settle(hub: &HubHandle) {
        hub.stats().await.unwrap();
    }

    fn drain(registration: &mut Registration) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = registration.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn offline_count(events: &[Event], id: ConnectionId) -> usize {
        events
            .iter()
            .filter(|e| {
                matches!(&e.body, EventBody::Presence(p)
                    if p.client_id == id && p.status == PresenceStatus::Offline)
            })
            .count()
    }

    #[tokio::test]
    async fn test_register_welcomes_and_announces() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());

        let mut first = hub.register(UserId(1)).await.unwrap();
        let mut second = hub.register(UserId(2)).await.unwrap();
        settle(&hub).await;

        let first_events = drain(&mut first);
        let second_events = drain(&mut second);

        // Welcome for self, online presence for the later arrival
        assert_eq!(first_events.len(), 2);
        assert_eq!(first_events[0].kind(), EventKind::Info);
        match &first_events[1].body {
            EventBody::Presence(p) => {
                assert_eq!(p.user_id, UserId(2));
                assert_eq!(p.status, PresenceStatus::Online);
                assert_eq!(p.client_id, second.handle.id);
            }
            other => panic!("Expected presence, got {:?}", other),
        }

        // Newcomer does not see its own presence
        assert_eq!(second_events.len(), 1);
        assert_eq!(second_events[0].kind(), EventKind::Info);
    }

    #[tokio::test]
    async fn test_unregister_twice_announces_once() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut observer = hub.register(UserId(2)).await.unwrap();
        let c1 = hub.register(UserId(1)).await.unwrap();
        let id = c1.handle.id;

        hub.unregister(id).await.unwrap();
        hub.unregister(id).await.unwrap();
        settle(&hub).await;

        let events = drain(&mut observer);
        assert_eq!(offline_count(&events, id), 1);
        assert!(hub.lookup_by_user(UserId(1)).await.unwrap().is_empty());
        assert_eq!(c1.handle.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_send_to_offline_user_is_noop() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut c1 = hub.register(UserId(1)).await.unwrap();
        settle(&hub).await;
        drain(&mut c1);

        assert!(hub.send_to_user(UserId(42), Event::ping()).is_ok());
        settle(&hub).await;

        assert!(drain(&mut c1).is_empty());
        assert_eq!(hub.stats().await.unwrap().connections, 1);
    }

    #[tokio::test]
    async fn test_all_connections_of_user_receive_once() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut c1 = hub.register(UserId(3)).await.unwrap();
        let mut c2 = hub.register(UserId(3)).await.unwrap();
        settle(&hub).await;
        drain(&mut c1);
        drain(&mut c2);

        hub.send_to_user(UserId(3), Event::typing(UserId(8), true))
            .unwrap();
        settle(&hub).await;

        for registration in [&mut c1, &mut c2] {
            let events = drain(registration);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind(), EventKind::Typing);
        }
    }

    #[tokio::test]
    async fn test_send_to_users_dedupes_and_skips_offline() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut c1 = hub.register(UserId(1)).await.unwrap();
        let mut c2 = hub.register(UserId(2)).await.unwrap();
        let mut c3 = hub.register(UserId(3)).await.unwrap();
        settle(&hub).await;
        for registration in [&mut c1, &mut c2, &mut c3] {
            drain(registration);
        }

        hub.send_to_users(
            vec![UserId(1), UserId(2), UserId(1), UserId(77)],
            Event::ping(),
        )
        .unwrap();
        settle(&hub).await;

        assert_eq!(drain(&mut c1).len(), 1);
        assert_eq!(drain(&mut c2).len(), 1);
        assert!(drain(&mut c3).is_empty());
    }

    #[tokio::test]
    async fn test_send_to_many_users_is_one_submission() {
        let config = HubConfig {
            command_buffer: 4,
            ..HubConfig::default()
        };
        let (hub, _task) = Hub::spawn(&config);
        let mut last = hub.register(UserId(1999)).await.unwrap();
        settle(&hub).await;
        drain(&mut last);

        let everyone: Vec<UserId> = (0..2000).map(UserId).collect();
        assert!(hub.send_to_users(everyone, Event::ping()).is_ok());
        settle(&hub).await;

        let events = drain(&mut last);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::KeepalivePing);
    }

    #[tokio::test]
    async fn test_duplicate_connection_id_is_refused() {
        let (_sender, receiver) = mpsc::channel(8);
        let mut hub = Hub::new(receiver, 8);

        let (first, first_reg) = Connection::open(UserId(1), 8);
        let (reply, response) = oneshot::channel();
        assert!(hub.admit(first, first_reg, reply));
        let first_reg = response.await.unwrap();

        let (mut clash, clash_reg) = Connection::open(UserId(2), 8);
        clash.id = first_reg.handle.id;
        let (reply, response) = oneshot::channel();
        assert!(!hub.admit(clash, clash_reg, reply));
        assert!(response.await.is_err());

        assert_eq!(hub.registry.len(), 1);
        assert_eq!(
            hub.registry.lookup_by_user(UserId(1)),
            vec![ConnectionInfo {
                id: first_reg.handle.id,
                user_id: UserId(1)
            }]
        );
        assert!(hub.registry.lookup_by_user(UserId(2)).is_empty());
        assert!(hub.registry.is_consistent());
    }

    #[tokio::test]
    async fn test_broadcast_excluding_skips_sender() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut c1 = hub.register(UserId(1)).await.unwrap();
        let mut c2 = hub.register(UserId(2)).await.unwrap();
        settle(&hub).await;
        drain(&mut c1);
        drain(&mut c2);

        hub.broadcast_excluding(c1.handle.id, Event::ping()).unwrap();
        settle(&hub).await;

        assert!(drain(&mut c1).is_empty());
        let events = drain(&mut c2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::KeepalivePing);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut c1 = hub.register(UserId(1)).await.unwrap();
        let mut c2 = hub.register(UserId(2)).await.unwrap();
        settle(&hub).await;
        drain(&mut c1);
        drain(&mut c2);

        hub.broadcast(Event::ping()).unwrap();
        settle(&hub).await;

        assert_eq!(drain(&mut c1).len(), 1);
        assert_eq!(drain(&mut c2).len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_disconnects_connection() {
        let (hub, _task) = Hub::spawn(&config(4));
        let mut observer = hub.register(UserId(2)).await.unwrap();
        let mut slow = hub.register(UserId(1)).await.unwrap();
        let slow_id = slow.handle.id;

        // Welcome occupies one slot; fill the remaining three
        for _ in 0..3 {
            hub.send_to_user(UserId(1), Event::ping()).unwrap();
        }
        settle(&hub).await;
        assert_eq!(hub.lookup_by_user(UserId(1)).await.unwrap().len(), 1);

        // One more overflows
        hub.send_to_user(UserId(1), Event::pong()).unwrap();
        settle(&hub).await;

        assert!(hub.lookup_by_user(UserId(1)).await.unwrap().is_empty());
        assert_eq!(slow.handle.state(), ConnectionState::Closing);

        // Queued events are still drained, then the queue reports closed
        let mut received = 0;
        while slow.events.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 4);

        let events = drain(&mut observer);
        assert_eq!(offline_count(&events, slow_id), 1);

        // The writer's later unregister is a no-op
        hub.unregister(slow_id).await.unwrap();
        settle(&hub).await;
        assert!(drain(&mut observer).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let gone = hub.register(UserId(1)).await.unwrap();
        drop(gone);

        hub.send_to_user(UserId(1), Event::ping()).unwrap();
        settle(&hub).await;

        assert!(!hub.is_user_online(UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_fifo_across_concurrent_producers() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut c1 = hub.register(UserId(5)).await.unwrap();
        settle(&hub).await;
        drain(&mut c1);

        let a_sent = Arc::new(Notify::new());

        let producer_a = {
            let hub = hub.clone();
            let a_sent = Arc::clone(&a_sent);
            tokio::spawn(async move {
                hub.send_to_user(UserId(5), Event::typing(UserId(1), true))
                    .unwrap();
                a_sent.notify_one();
            })
        };
        let producer_b = {
            let hub = hub.clone();
            let a_sent = Arc::clone(&a_sent);
            tokio::spawn(async move {
                a_sent.notified().await;
                hub.send_to_user(UserId(5), Event::typing(UserId(1), false))
                    .unwrap();
            })
        };
        producer_a.await.unwrap();
        producer_b.await.unwrap();

        let a = c1.events.recv().await.unwrap();
        let b = c1.events.recv().await.unwrap();
        assert!(matches!(a.body, EventBody::Typing(ref t) if t.is_typing));
        assert!(matches!(b.body, EventBody::Typing(ref t) if !t.is_typing));
    }

    #[tokio::test]
    async fn test_inbound_typing_routes_to_target() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut sender = hub.register(UserId(1)).await.unwrap();
        let mut target = hub.register(UserId(2)).await.unwrap();
        settle(&hub).await;
        drain(&mut sender);
        drain(&mut target);

        let frame = Ok(ClientMessage::Typing(TypingRequest {
            to_user_id: UserId(2),
            is_typing: true,
        }));
        hub.inbound(sender.handle.id, frame).await.unwrap();
        settle(&hub).await;

        assert!(drain(&mut sender).is_empty());
        let events = drain(&mut target);
        assert_eq!(events.len(), 1);
        match &events[0].body {
            EventBody::Typing(t) => assert_eq!(t.from_user_id, UserId(1)),
            other => panic!("Expected typing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_unknown_kind_answers_sender_only() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut sender = hub.register(UserId(1)).await.unwrap();
        let mut other = hub.register(UserId(2)).await.unwrap();
        settle(&hub).await;
        drain(&mut sender);
        drain(&mut other);

        let frame = Err(FrameError::UnknownKind("delete_email".to_string()));
        hub.inbound(sender.handle.id, frame).await.unwrap();
        settle(&hub).await;

        let events = drain(&mut sender);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Error);
        assert!(drain(&mut other).is_empty());
        assert_eq!(hub.stats().await.unwrap().connections, 2);
    }

    #[tokio::test]
    async fn test_inbound_from_removed_connection_is_ignored() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let mut observer = hub.register(UserId(2)).await.unwrap();
        let c1 = hub.register(UserId(1)).await.unwrap();
        hub.unregister(c1.handle.id).await.unwrap();
        settle(&hub).await;
        drain(&mut observer);

        let frame = Ok(ClientMessage::Presence(crate::message::PresenceRequest {
            status: PresenceStatus::Online,
        }));
        hub.inbound(c1.handle.id, frame).await.unwrap();
        settle(&hub).await;

        assert!(drain(&mut observer).is_empty());
    }

    #[tokio::test]
    async fn test_online_users_and_stats() {
        let (hub, _task) = Hub::spawn(&HubConfig::default());
        let _a = hub.register(UserId(4)).await.unwrap();
        let _b = hub.register(UserId(4)).await.unwrap();
        let _c = hub.register(UserId(1)).await.unwrap();

        assert_eq!(
            hub.online_users().await.unwrap(),
            vec![UserId(1), UserId(4)]
        );
        assert_eq!(
            hub.stats().await.unwrap(),
            HubStats {
                connections: 3,
                users: 2
            }
        );
        assert!(hub.is_user_online(UserId(4)).await.unwrap());
        assert!(!hub.is_user_online(UserId(9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_closes_every_queue() {
        let (hub, task) = Hub::spawn(&HubConfig::default());
        let mut c1 = hub.register(UserId(1)).await.unwrap();

        hub.stop().await.unwrap();
        task.await.unwrap();

        while c1.events.recv().await.is_some() {}
        assert_eq!(c1.handle.state(), ConnectionState::Closing);
        assert_eq!(hub.register(UserId(2)).await.unwrap_err(), HubError::Stopped);
        assert_eq!(hub.broadcast(Event::ping()), Err(HubError::Stopped));
    }

    #[tokio::test]
    async fn test_saturated_hub_rejects_without_waiting() {
        // No actor draining the queue
        let (sender, _receiver) = mpsc::channel(1);
        let hub = HubHandle::new(sender);

        assert!(hub.broadcast(Event::ping()).is_ok());
        assert_eq!(hub.broadcast(Event::ping()), Err(HubError::Saturated));
    }
}
