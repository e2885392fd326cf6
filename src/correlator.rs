//! Request/response correlation.
//!
//! Every request sent with a [`Callback`] leaves a [`PendingCall`] behind,
//! keyed by the envelope id. An inbound envelope whose id matches is handed
//! to that callback and to nothing else; anything unmatched is for the
//! clients to see.
//!
//! A pending call is consumed at most once. It disappears when:
//! * its response arrives (the callback runs),
//! * its owner cancels it,
//! * it grows older than the call timeout and is swept, or
//! * the session disconnects.
//!
//! Only the first of these runs the response handler. The others drop the
//! call without a word, unless it was given a [`DropHandler`] through
//! [`Callback::on_dropped`].

use std::{collections::HashMap, fmt, time::Duration};

use tokio::time::Instant;

use crate::{
    error::Error,
    events::ClientId,
    protocol::{key, Envelope},
};

/// Runs with the matching response.
pub type ResponseHandler = Box<dyn FnOnce(Envelope) + Send>;

/// Runs instead of the [`ResponseHandler`] when the server answers with an
/// `error` option. Receives the error text and the full response.
pub type ErrorHandler = Box<dyn FnOnce(String, Envelope) + Send>;

/// Runs when the call goes away unanswered: cancelled, swept or lost to a
/// disconnect.
pub type DropHandler = Box<dyn FnOnce(Error) + Send>;

/// What to do when a request is answered.
pub struct Callback {
    on_response: ResponseHandler,
    on_error: Option<ErrorHandler>,
    on_dropped: Option<DropHandler>,
}

impl Callback {
    pub fn new<F>(on_response: F) -> Self
    where
        F: FnOnce(Envelope) + Send + 'static,
    {
        Self {
            on_response: Box::new(on_response),
            on_error: None,
            on_dropped: None,
        }
    }

    /// Routes server-reported errors to `on_error`. Without it, error
    /// responses go to the response handler like any other.
    #[must_use]
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: FnOnce(String, Envelope) + Send + 'static,
    {
        self.on_error = Some(Box::new(on_error));
        self
    }

    /// Reports calls that end without a response to `on_dropped`.
    #[must_use]
    pub fn on_dropped<F>(mut self, on_dropped: F) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.on_dropped = Some(Box::new(on_dropped));
        self
    }

    fn drop_with(self, reason: Error) {
        if let Some(on_dropped) = self.on_dropped {
            on_dropped(reason);
        }
    }

    fn invoke(self, response: Envelope) {
        let error = response
            .str_option(key::ERROR)
            .filter(|error| !error.is_empty())
            .map(str::to_owned);

        match (error, self.on_error) {
            (Some(error), Some(on_error)) => on_error(error, response),
            _ => (self.on_response)(response),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("on_error", &self.on_error.is_some())
            .field("on_dropped", &self.on_dropped.is_some())
            .finish_non_exhaustive()
    }
}

/// An outstanding request awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    pub id: String,
    pub owner: ClientId,
    pub enqueued_at: Instant,

    /// Answered locally by an interceptor rather than over the socket.
    /// Such calls survive a disconnect.
    pub intercepted: bool,

    callback: Callback,
}

/// Outcome of offering an inbound envelope to the correlator.
#[derive(Debug)]
pub enum Resolution {
    /// A pending call consumed the envelope.
    Dispatched,
    /// Nobody was waiting for it.
    Unmatched(Envelope),
}

/// Table of pending calls.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<String, PendingCall>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending call for the request with id `id`.
    ///
    /// Ids are never reused, so a collision means somebody re-sent an
    /// envelope built with [`Envelope::build_upon`] without a new id. The
    /// newer call wins and the older one is dropped.
    pub fn insert(&mut self, id: &str, owner: ClientId, callback: Callback, intercepted: bool) {
        let call = PendingCall {
            id: id.to_owned(),
            owner,
            enqueued_at: Instant::now(),
            intercepted,
            callback,
        };

        if self.pending.insert(id.to_owned(), call).is_some() {
            warn!("replacing pending call with duplicate id {id}");
        }
    }

    /// Hands `envelope` to the call waiting for its id, if any.
    pub fn resolve(&mut self, envelope: Envelope) -> Resolution {
        match self.pending.remove(envelope.id()) {
            Some(call) => {
                trace!("resolved {} for {}", call.id, call.owner);
                call.callback.invoke(envelope);
                Resolution::Dispatched
            }
            None => Resolution::Unmatched(envelope),
        }
    }

    /// Forgets every call owned by `owner`. Returns how many were dropped.
    pub fn cancel_owner(&mut self, owner: ClientId) -> usize {
        self.remove_where(
            |call| call.owner == owner,
            |call| Error::cancelled(format!("call {} was cancelled", call.id)),
        )
    }

    /// Forgets the call with id `id`. Returns whether it existed.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.pending.remove(id) {
            Some(call) => {
                call.callback
                    .drop_with(Error::cancelled(format!("call {id} was cancelled")));
                true
            }
            None => false,
        }
    }

    /// Forgets calls enqueued more than `timeout` ago.
    pub fn sweep(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        self.remove_where(
            |call| now.duration_since(call.enqueued_at) > timeout,
            |call| {
                Error::deadline_exceeded(format!(
                    "call {} went unanswered for {}s",
                    call.id,
                    timeout.as_secs()
                ))
            },
        )
    }

    /// Forgets every call that was sent over the socket.
    pub fn clear_remote(&mut self) -> usize {
        self.remove_where(
            |call| !call.intercepted,
            |call| Error::unavailable(format!("call {} was lost to a disconnect", call.id)),
        )
    }

    fn remove_where<P, R>(&mut self, predicate: P, reason: R) -> usize
    where
        P: Fn(&PendingCall) -> bool,
        R: Fn(&PendingCall) -> Error,
    {
        let ids: Vec<_> = self
            .pending
            .values()
            .filter(|call| predicate(call))
            .map(|call| call.id.clone())
            .collect();

        for id in &ids {
            if let Some(call) = self.pending.remove(id) {
                let reason = reason(&call);
                call.callback.drop_with(reason);
            }
        }

        ids.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use super::*;
    use crate::error::ErrorKind;

    fn counting(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = Arc::clone(counter);
        Callback::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn request(name: &str) -> Envelope {
        Envelope::request(name).build().unwrap()
    }

    #[test]
    fn response_goes_to_its_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut correlator = Correlator::new();
        let ping = request("ping");
        correlator.insert(ping.id(), ClientId::new(), counting(&calls), false);

        let response = Envelope::respond_to(&ping).build().unwrap();
        assert!(matches!(
            correlator.resolve(response.clone()),
            Resolution::Dispatched
        ));
        assert!(matches!(
            correlator.resolve(response),
            Resolution::Unmatched(_)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(correlator.is_empty());
    }

    #[test]
    fn broadcasts_are_unmatched() {
        let mut correlator = Correlator::new();
        let ping = request("ping");
        correlator.insert(ping.id(), ClientId::new(), Callback::new(|_| ()), false);

        let broadcast = Envelope::broadcast("play_queue_changed").build().unwrap();
        match correlator.resolve(broadcast) {
            Resolution::Unmatched(envelope) => assert_eq!(envelope.name(), "play_queue_changed"),
            Resolution::Dispatched => panic!("broadcast matched a pending call"),
        }
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn cancellation_never_invokes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let owner = ClientId::new();
        let other = ClientId::new();
        let mut correlator = Correlator::new();

        let a = request("query_tracks");
        let b = request("query_tracks");
        let c = request("query_tracks");
        correlator.insert(a.id(), owner, counting(&calls), false);
        correlator.insert(b.id(), owner, counting(&calls), false);
        correlator.insert(c.id(), other, counting(&calls), false);

        assert_eq!(correlator.cancel_owner(owner), 2);
        assert!(correlator.cancel(c.id()));
        assert!(!correlator.cancel(c.id()));

        // Late responses for cancelled calls fall through as unmatched.
        let late = Envelope::respond_to(&a).build().unwrap();
        assert!(matches!(correlator.resolve(late), Resolution::Unmatched(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_response_leaves_other_calls_alone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut correlator = Correlator::new();
        let cancelled = request("query_tracks");
        let live = request("query_tracks");
        correlator.insert(cancelled.id(), ClientId::new(), counting(&calls), false);
        correlator.insert(live.id(), ClientId::new(), counting(&calls), false);
        correlator.cancel(cancelled.id());

        let late = Envelope::respond_to(&cancelled).build().unwrap();
        let _ = correlator.resolve(late);
        assert_eq!(correlator.len(), 1);

        let response = Envelope::respond_to(&live).build().unwrap();
        let _ = correlator.resolve(response);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_only_stale_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut correlator = Correlator::new();
        let old = request("query_category");
        correlator.insert(old.id(), ClientId::new(), counting(&calls), false);

        tokio::time::advance(Duration::from_secs(20)).await;
        let young = request("query_category");
        correlator.insert(young.id(), ClientId::new(), counting(&calls), false);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(correlator.sweep(Duration::from_secs(30)), 1);
        assert_eq!(correlator.len(), 1);
        assert!(!correlator.cancel(old.id()));
        assert!(correlator.cancel(young.id()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_calls_can_report_why() {
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let reporting = || {
            let reasons = Arc::clone(&reasons);
            Callback::new(|_| panic!("no response was sent"))
                .on_dropped(move |e: Error| reasons.lock().unwrap().push(e.kind))
        };

        let mut correlator = Correlator::new();
        let owner = ClientId::new();
        let (a, b, c, d) = (
            request("query_tracks"),
            request("query_tracks"),
            request("query_tracks"),
            request("query_tracks"),
        );
        correlator.insert(a.id(), owner, reporting(), false);
        correlator.insert(b.id(), ClientId::new(), reporting(), false);
        correlator.insert(c.id(), ClientId::new(), reporting(), false);

        assert_eq!(correlator.cancel_owner(owner), 1);
        assert!(correlator.cancel(b.id()));

        tokio::time::advance(Duration::from_secs(31)).await;
        correlator.insert(d.id(), ClientId::new(), reporting(), false);
        assert_eq!(correlator.sweep(Duration::from_secs(30)), 1);
        assert_eq!(correlator.clear_remote(), 1);
        assert_eq!(correlator.len(), 0);

        assert_eq!(
            *reasons.lock().unwrap(),
            [
                ErrorKind::Cancelled,
                ErrorKind::Cancelled,
                ErrorKind::DeadlineExceeded,
                ErrorKind::Unavailable,
            ]
        );
    }

    #[test]
    fn clear_remote_keeps_intercepted_calls() {
        let mut correlator = Correlator::new();
        let remote = request("query_tracks");
        let local = request("query_tracks");
        correlator.insert(remote.id(), ClientId::new(), Callback::new(|_| ()), false);
        correlator.insert(local.id(), ClientId::new(), Callback::new(|_| ()), true);

        assert_eq!(correlator.clear_remote(), 1);
        assert!(correlator.cancel(local.id()));
    }

    #[test]
    fn server_errors_prefer_the_error_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut correlator = Correlator::new();

        let failing = request("seek_to");
        let (ok, err) = (Arc::clone(&seen), Arc::clone(&seen));
        correlator.insert(
            failing.id(),
            ClientId::new(),
            Callback::new(move |_| ok.lock().unwrap().push(String::from("response")))
                .on_error(move |error, _| err.lock().unwrap().push(error)),
            false,
        );
        let response = Envelope::respond_to(&failing)
            .option(key::ERROR, "invalid index")
            .build()
            .unwrap();
        let _ = correlator.resolve(response);

        // Without an error handler, the response handler sees the error.
        let plain = request("seek_to");
        let ok = Arc::clone(&seen);
        correlator.insert(
            plain.id(),
            ClientId::new(),
            Callback::new(move |response| {
                let error = response.str_option(key::ERROR).unwrap_or_default().to_owned();
                ok.lock().unwrap().push(format!("response: {error}"));
            }),
            false,
        );
        let response = Envelope::respond_to(&plain)
            .option(key::ERROR, "boom")
            .build()
            .unwrap();
        let _ = correlator.resolve(response);

        assert_eq!(
            *seen.lock().unwrap(),
            ["invalid index", "response: boom"]
        );
    }
}
