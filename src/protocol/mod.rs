//! Wire protocol of the media server's remote-control socket.
//!
//! * [`envelope`] - the `{id, name, type, options}` message unit and its codec
//! * [`messages`] - request and broadcast names, option keys
//!
//! Every frame is one JSON envelope; there is no batching.

pub mod envelope;
pub mod messages;

pub use envelope::{Builder, Envelope, Kind, Options};
pub use messages::{key, Broadcast, Request};

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs JSON received from the server.
///
/// `origin` names what was being parsed, for the logs.
///
/// # Errors
///
/// Returns error if `body` is not valid JSON or does not match type `T`.
///
/// # Logging
///
/// * Success: parsed structure at TRACE level
/// * Valid JSON of the wrong shape: the JSON at TRACE level
/// * Invalid JSON: ERROR level, raw text at TRACE level
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing frame ({e})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
