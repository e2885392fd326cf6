//! Remote-control session client for networked media servers.
//!
//! One [`session::Session`] multiplexes many request/response exchanges and
//! server broadcasts over a single WebSocket, keeps it alive with heartbeats
//! and reconnects it when the network comes and goes. Observers register as
//! [`events::Client`]s; paginated collections are browsed through a
//! [`window::SlidingWindow`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate log;

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod signal;
pub mod timer;
pub mod transport;
pub mod window;
