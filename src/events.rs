//! Connection state and the observers that watch it.
//!
//! A [`Client`] is anything that wants to hear about the session: state
//! transitions, broadcasts (and any other message nobody was waiting for),
//! and authentication failures. Clients are reference counted by the
//! session; while at least one is registered the session is "watched" and
//! keeps itself connected.
//!
//! Client callbacks run on the session's dispatch task. They must not block.
//! Posting further work to the session from inside a callback is fine, since
//! every session operation is queued rather than executed in place.
//!
//! # Example
//!
//! ```rust
//! use tether::events::{Event, EventClient, State};
//!
//! let (client, mut events) = EventClient::new();
//! // session.add_client(client.id(), client.clone());
//! # drop(client);
//! while let Some(event) = events.blocking_recv() {
//!     match event {
//!         Event::StateChanged { new: State::Connected, .. } => println!("connected"),
//!         Event::Message(message) => println!("{}", message.name()),
//!         _ => (),
//!     }
//! }
//! ```

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// State of the one logical session.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum State {
    /// No socket. A reconnect may be scheduled.
    #[default]
    Disconnected,

    /// A socket is being opened or authenticated.
    Connecting,

    /// Authenticated and heartbeating.
    Connected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Opaque identity of a registered client, used as the owner of requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

/// Ids start at one; zero is the session's own identity.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    /// Identity the session uses for its own requests, such as heartbeats.
    /// It is always considered registered.
    pub(crate) const INTERNAL: Self = Self(0);

    /// Allocates an id that no other client in this process has.
    #[must_use]
    #[expect(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client #{}", self.0)
    }
}

/// Observer of the session.
pub trait Client: Send + Sync {
    /// Called on every state transition, and once with `new == old` when
    /// the client is added.
    fn on_state_changed(&self, new: State, old: State) {
        let _ = (new, old);
    }

    /// Called for every inbound message that did not match a pending call.
    fn on_message_received(&self, message: &Envelope) {
        let _ = message;
    }

    /// Called when the server rejects the configured password.
    fn on_invalid_password(&self) {}
}

/// Everything a [`Client`] can be told, as a value.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    StateChanged { new: State, old: State },
    Message(Envelope),
    InvalidPassword,
}

/// A [`Client`] that forwards what it hears into a channel.
#[derive(Debug)]
pub struct EventClient {
    id: ClientId,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventClient {
    /// Returns the client together with the receiving end of its events.
    #[must_use]
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            id: ClientId::new(),
            tx,
        };
        (std::sync::Arc::new(client), rx)
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    fn forward(&self, event: Event) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl Client for EventClient {
    fn on_state_changed(&self, new: State, old: State) {
        self.forward(Event::StateChanged { new, old });
    }

    fn on_message_received(&self, message: &Envelope) {
        self.forward(Event::Message(message.clone()));
    }

    fn on_invalid_password(&self) {
        self.forward(Event::InvalidPassword);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_distinct_from_internal() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert_ne!(a, ClientId::INTERNAL);
    }

    #[test]
    fn event_client_forwards() {
        let (client, mut rx) = EventClient::new();
        client.on_state_changed(State::Connecting, State::Disconnected);
        client.on_invalid_password();

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::StateChanged {
                new: State::Connecting,
                old: State::Disconnected
            }
        );
        assert_eq!(rx.try_recv().unwrap(), Event::InvalidPassword);
    }
}
