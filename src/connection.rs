//! Connection definitions
//!
//! `Connection` is the hub-side registry entry: the only holder of the
//! connection's outbound queue sender. Dropping it closes the queue, which
//! is the stop signal for the connection's writer.
//!
//! `ConnectionHandle` and `Registration` are what the transport side gets
//! back from registering.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::Event;
use crate::types::{ConnectionId, ConnectionState, StateCell, UserId};

/// Registered connection
///
/// Owned by the registry. Never cloned, so its sender is the only one.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: ConnectionId,
    /// Owning user, immutable for the connection's lifetime
    pub user_id: UserId,
    /// Hub → Connection bounded queue
    sender: mpsc::Sender<Event>,
    /// Lifecycle shared with the transport tasks
    state: StateCell,
}

impl Connection {
    /// Create a connection entry with a fresh queue of `capacity` slots
    ///
    /// Returns the entry plus the handle and receiver for the transport side.
    pub fn open(user_id: UserId, capacity: usize) -> (Self, Registration) {
        let id = ConnectionId::new();
        let (sender, events) = mpsc::channel(capacity.max(1));
        let state = StateCell::new();

        let connection = Self {
            id,
            user_id,
            sender,
            state: state.clone(),
        };
        let registration = Registration {
            handle: ConnectionHandle { id, user_id, state },
            events,
        };
        (connection, registration)
    }

    /// Non-blocking enqueue
    ///
    /// Fails with `QueueFull` when the consumer has fallen `capacity` events
    /// behind, or `ChannelClosed` when its writer is gone.
    pub fn try_send(&self, event: Event) -> Result<(), SendError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            user_id: self.user_id,
        }
    }

    /// Mark closing and drop the sender, closing the outbound queue
    pub fn close(self) {
        self.state.advance(ConnectionState::Closing);
    }
}

/// Copyable identity pair returned by registry snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: UserId,
}

/// Transport-side view of a registered connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    state: StateCell,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Record a transport failure; the hub is told separately
    pub fn mark_closing(&self) {
        self.state.advance(ConnectionState::Closing);
    }

    /// Record that the transport has been shut down
    pub fn mark_closed(&self) {
        self.state.advance(ConnectionState::Closed);
    }
}

/// Result of registering with the hub
#[derive(Debug)]
pub struct Registration {
    pub handle: ConnectionHandle,
    /// Outbound queue consumer, drained by the connection's writer
    pub events: mpsc::Receiver<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_creation() {
        let (conn, registration) = Connection::open(UserId(7), 4);

        assert_eq!(conn.user_id, UserId(7));
        assert_eq!(conn.id, registration.handle.id);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(registration.handle.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        let (conn, mut registration) = Connection::open(UserId(1), 2);

        assert!(conn.try_send(Event::ping()).is_ok());
        assert!(conn.try_send(Event::ping()).is_ok());
        assert_eq!(conn.try_send(Event::ping()), Err(SendError::QueueFull));

        registration.events.recv().await.unwrap();
        assert!(conn.try_send(Event::pong()).is_ok());
    }

    #[tokio::test]
    async fn test_try_send_after_receiver_dropped() {
        let (conn, registration) = Connection::open(UserId(1), 2);
        drop(registration);
        assert_eq!(conn.try_send(Event::ping()), Err(SendError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_close_ends_queue_after_draining() {
        let (conn, mut registration) = Connection::open(UserId(1), 4);
        conn.try_send(Event::ping()).unwrap();
        conn.close();

        assert_eq!(registration.handle.state(), ConnectionState::Closing);
        assert!(registration.events.recv().await.is_some());
        assert!(registration.events.recv().await.is_none());
    }
}
