//! Dispatch policy for inbound client frames
//!
//! Pure mapping from (sending connection, decoded frame) to a delivery
//! route. The hub actor applies the route; nothing here touches the
//! registry.

use crate::connection::ConnectionInfo;
use crate::error::FrameError;
use crate::message::{ClientMessage, Event};
use crate::types::UserId;

/// Where an outbound event should go
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Every connection of one user
    User(UserId, Event),
    /// Every live connection
    All(Event),
    /// Back to the sending connection only
    Reply(Event),
    /// Nothing to deliver
    Drop,
}

/// Decide what an inbound frame turns into
///
/// Identities in outbound events always come from `origin`, never from the
/// client payload. Anything the policy does not handle is answered on the
/// same connection and never forwarded.
pub fn route(origin: &ConnectionInfo, frame: Result<ClientMessage, FrameError>) -> Route {
    let message = match frame {
        Ok(message) => message,
        Err(err) => return Route::Reply(err.into()),
    };

    match message {
        ClientMessage::Typing(req) => {
            Route::User(req.to_user_id, Event::typing(origin.user_id, req.is_typing))
        }
        ClientMessage::Presence(req) => {
            Route::All(Event::presence(origin.user_id, req.status, origin.id))
        }
        ClientMessage::Ping => Route::Reply(Event::pong()),
        // Liveness only
        ClientMessage::Pong => Route::Drop,
    }
}
