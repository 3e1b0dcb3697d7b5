//! Real-time Notification Hub for Webmail Clients
//!
//! Keeps a registry of live WebSocket connections, maps them to users, and
//! fans out mail events (new mail, read receipts, typing, presence, system
//! notices) without letting one slow client stall anyone else.
//!
//! # Features
//! - Multiple simultaneous connections per user
//! - Per-user, broadcast and broadcast-excluding delivery
//! - Bounded per-connection queues; a client that falls behind is dropped
//! - Keepalive pings on idle connections
//! - Typed JSON wire protocol shared with browser clients
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the single actor owning the `Registry`
//! - Each connection has a reader and a writer task talking to the hub
//!   through a cloneable `HubHandle`
//! - No locks around the registry - all access goes through the actor
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use mailhub_notify::{handle_connection, Hub, HubConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let config = HubConfig::default();
//!     let (hub, _task) = Hub::spawn(&config);
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, hub.clone(), config.clone()));
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod notify;
pub mod registry;
pub mod types;

// Re-export main types for convenience
pub use config::{Config, ConfigError, HubConfig, LoggingConfig, ServerConfig};
pub use connection::{Connection, ConnectionHandle, ConnectionInfo, Registration};
pub use dispatch::Route;
pub use error::{AppError, FrameError, HubError, SendError};
pub use handler::{handle_connection, serve, serve_registered};
pub use hub::{Hub, HubCommand, HubHandle, HubStats};
pub use message::{ClientMessage, ErrorCode, Event, EventBody, EventKind, PresenceStatus};
pub use notify::{
    Audience, DirectoryError, InMemoryDirectory, MailDirectory, MailSummary, Notifier,
    NotifyError, SystemNotice,
};
pub use registry::Registry;
pub use types::{ConnectionId, ConnectionState, UserId};
