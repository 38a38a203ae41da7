//! Hangar relay library
//!
//! WebSocket gateway over the messaging core, exposed for integration tests.

mod connection;
mod messages;
mod state;

pub use connection::{handle_connection, handle_request};
pub use messages::WsMessage;
pub use state::RelayState;
