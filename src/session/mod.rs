//! Connection and session lifecycle
//!
//! [`DialogClient`] drives the state machine
//! `Disconnected -> Connecting -> Connected -> SessionActive -> Closing -> Disconnected`,
//! owns the receive loop and the audio pumps, and publishes notifications
//! through an [`EventRegistry`].

mod client;
mod dispatch;
pub mod events;

pub use self::client::DialogClient;
pub use self::events::{AudioEvent, DialogEvent, ErrorEvent, EventRegistry, SubscriptionId};
