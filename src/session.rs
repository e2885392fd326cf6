//! The one logical session with a media server.
//!
//! A [`Session`] is a cheap, cloneable handle to a dispatch task that owns
//! everything stateful: the socket, the connection state, the pending-call
//! table, the registered clients and all timers. Every operation on the
//! handle posts a task to that loop, so nothing is ever mutated from two
//! places at once. The socket I/O runs on tasks of its own and only ever
//! posts decoded envelopes back.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect--> Connecting --authenticated--> Connected
//!       ^                        |                             |
//!       +------------------------+--- failure or disconnect ---+
//! ```
//!
//! The session connects itself while at least one [`Client`] is registered.
//! The first client starts a connection (and a failsafe retry in case that
//! stalls); the last one leaving schedules a disconnect after a grace period
//! that a newly added client cancels.
//!
//! Once connected, a heartbeat is sent periodically. A heartbeat that goes
//! unanswered for a full interval means the socket is dead even if it looks
//! open: the session disconnects and retries.
//!
//! # Example
//!
//! ```rust
//! use tether::{
//!     config::Config,
//!     correlator::Callback,
//!     events::EventClient,
//!     protocol::{Envelope, Request},
//!     session::Session,
//! };
//!
//! let session = Session::new(&Config::default())?;
//! let (client, mut events) = EventClient::new();
//! session.add_client(client.id(), client.clone());
//!
//! let request = Envelope::request(Request::GetPlaybackOverview).build()?;
//! session.post(request, Some(client.id()), Some(Callback::new(|response| {
//!     println!("{response}");
//! })));
//! ```

use std::{
    collections::BTreeMap,
    convert, fmt,
    ops::ControlFlow,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::{
    config::{Config, Timings},
    correlator::{Callback, Correlator, Resolution},
    error::{Error, Result},
    events::{Client, ClientId, State},
    protocol::{key, Envelope, Request},
    timer::{self, Timer, Timers},
    transport::{Connector, Inbound, Link, WebSocketConnector},
};

/// Close code the server uses to reject a password.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Oldest server API this client fully supports.
pub const MINIMUM_SUPPORTED_API_VERSION: i64 = 15;

/// Answers requests locally instead of sending them to the server.
///
/// Interceptors are asked in the order they were added. The first to return
/// `true` owns the request and is expected to answer it through the
/// [`Responder`], now or later.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, request: &Envelope, responder: &Responder) -> bool;
}

impl<F> Interceptor for F
where
    F: Fn(&Envelope, &Responder) -> bool + Send + Sync,
{
    fn intercept(&self, request: &Envelope, responder: &Responder) -> bool {
        self(request, responder)
    }
}

/// Delivers locally produced responses as if they came from the server.
#[derive(Clone)]
pub struct Responder {
    tx: mpsc::WeakUnboundedSender<Task>,
}

impl Responder {
    /// Queues `response` behind everything already pending on the session.
    pub fn respond(&self, response: Envelope) {
        post(&self.tx, Task::Local(response));
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

/// Work for the dispatch loop.
enum Task {
    AddClient(ClientId, Arc<dyn Client>),
    RemoveClient(ClientId),
    HasClient(ClientId, oneshot::Sender<bool>),
    AddInterceptor(Arc<dyn Interceptor>),
    Send {
        envelope: Envelope,
        owner: Option<ClientId>,
        callback: Option<Callback>,
        reply: Option<oneshot::Sender<Result<String>>>,
    },
    CancelOwner(ClientId),
    Cancel(String),
    Reconnect,
    Disconnect,
    NetworkChanged(bool),
    Shutdown,

    // Posted by connection attempts and the callbacks of internal requests.
    // `attempt` tells stale ones apart.
    Opened {
        attempt: u64,
        result: Result<Link>,
    },
    Received {
        attempt: u64,
        envelope: Envelope,
    },
    Closed {
        attempt: u64,
        code: Option<u16>,
    },
    Authenticated {
        attempt: u64,
        response: Envelope,
    },
    Rejected {
        attempt: u64,
        reason: String,
    },
    Pong {
        attempt: u64,
    },
    Local(Envelope),
}

fn post(tx: &mpsc::WeakUnboundedSender<Task>, task: Task) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(task);
    }
}

/// Where the outcome of a [`Session::request`] goes. Shared by the handlers
/// of one callback, of which only one ever runs.
type Reply = Mutex<Option<oneshot::Sender<Result<Envelope>>>>;

fn fulfil(reply: &Reply, result: Result<Envelope>) {
    if let Some(tx) = reply.lock().unwrap_or_else(PoisonError::into_inner).take() {
        let _ = tx.send(result);
    }
}

/// Cancels a call when its caller stops waiting for it.
struct CancelOnDrop<'a> {
    session: &'a Session,
    id: Option<String>,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.session.cancel_message(id);
        }
    }
}

/// Handle to a running session.
///
/// The session stops when [`shutdown`](Self::shutdown) is called or when
/// every handle is dropped. Clients that hold a handle themselves keep the
/// session alive until they are removed.
#[derive(Clone)]
pub struct Session {
    tx: mpsc::UnboundedSender<Task>,
    state: watch::Receiver<State>,
    server_version: watch::Receiver<Option<i64>>,
}

impl Session {
    /// Starts a session that connects over WebSocket. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configured host does not form a URL.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Starts a session that opens its sockets through `connector`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the configured host does not form a URL.
    pub fn with_connector(config: &Config, connector: Arc<dyn Connector>) -> Result<Self> {
        let url = config.url()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(State::Disconnected);
        let (version_tx, server_version) = watch::channel(None);

        let dispatcher = Dispatcher {
            url,
            password: config.password.clone(),
            timings: config.timings,
            connector,
            weak: tx.downgrade(),
            rx,
            state: State::Disconnected,
            state_tx,
            version_tx,
            clients: BTreeMap::new(),
            interceptors: Vec::new(),
            correlator: Correlator::new(),
            timers: Timers::new(),
            link: None,
            attempt: 0,
            auto_reconnect: false,
            network_available: true,
            watching_network: false,
        };
        tokio::spawn(dispatcher.run());

        Ok(Self {
            tx,
            state,
            server_version,
        })
    }

    fn enqueue(&self, task: Task) {
        if self.tx.send(task).is_err() {
            debug!("session has shut down");
        }
    }

    /// Registers `client`. It is told the current state right away, with
    /// `new == old`.
    pub fn add_client(&self, id: ClientId, client: Arc<dyn Client>) {
        self.enqueue(Task::AddClient(id, client));
    }

    /// Unregisters a client and forgets its pending calls.
    pub fn remove_client(&self, id: ClientId) {
        self.enqueue(Task::RemoveClient(id));
    }

    pub async fn has_client(&self, id: ClientId) -> bool {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Task::HasClient(id, reply));
        rx.await.unwrap_or(false)
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.enqueue(Task::AddInterceptor(interceptor));
    }

    /// Sends `envelope` without waiting for an answer. Returns its
    /// correlation id.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if there is no open socket.
    pub async fn send(&self, envelope: Envelope) -> Result<String> {
        self.send_with(envelope, None, None).await
    }

    /// Sends `envelope` and runs `callback` with its response. Returns the
    /// correlation id, which can be passed to
    /// [`cancel_message`](Self::cancel_message).
    ///
    /// The callback runs at most once, on the dispatch task. It never runs
    /// if the call is cancelled, times out, or the session disconnects
    /// first.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if `owner` is not a registered client,
    /// and `Unavailable` if there is no open socket and no interceptor
    /// claimed the request.
    pub async fn call(&self, envelope: Envelope, owner: ClientId, callback: Callback) -> Result<String> {
        self.send_with(envelope, Some(owner), Some(callback)).await
    }

    /// Sends `envelope` on behalf of `owner` and waits for its response.
    ///
    /// Unlike [`call`](Self::call), a call that ends without a response is
    /// reported. Dropping the returned future cancels the call.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`call`](Self::call):
    /// * `Cancelled` if the call was cancelled
    /// * `DeadlineExceeded` if it went unanswered for the call timeout
    /// * `Unavailable` if the session disconnected or shut down first
    /// * `Internal` if the server answered with an `error` option
    pub async fn request(&self, envelope: Envelope, owner: ClientId) -> Result<Envelope> {
        let name = envelope.name().to_owned();
        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(Mutex::new(Some(tx)));
        let (failed, dropped) = (Arc::clone(&reply), Arc::clone(&reply));

        let callback = Callback::new(move |response| fulfil(&reply, Ok(response)))
            .on_error(move |reason, _| {
                let e = Error::internal(format!("{name} failed: {reason}"));
                fulfil(&failed, Err(e));
            })
            .on_dropped(move |e| fulfil(&dropped, Err(e)));

        let id = self.call(envelope, owner, callback).await?;
        let mut guard = CancelOnDrop {
            session: self,
            id: Some(id),
        };

        let result = rx.await;
        guard.id = None;
        result.map_err(|_| Error::unavailable("session has shut down"))?
    }

    async fn send_with(
        &self,
        envelope: Envelope,
        owner: Option<ClientId>,
        callback: Option<Callback>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Task::Send {
            envelope,
            owner,
            callback,
            reply: Some(reply),
        });

        rx.await
            .map_err(|_| Error::unavailable("session has shut down"))
            .and_then(convert::identity)
    }

    /// Like [`call`](Self::call), but returns immediately. Failures are
    /// logged by the session.
    pub fn post(&self, envelope: Envelope, owner: Option<ClientId>, callback: Option<Callback>) {
        self.enqueue(Task::Send {
            envelope,
            owner,
            callback,
            reply: None,
        });
    }

    /// Forgets every pending call of `owner` without running its callbacks.
    pub fn cancel_messages(&self, owner: ClientId) {
        self.enqueue(Task::CancelOwner(owner));
    }

    /// Forgets the pending call with correlation id `id`.
    pub fn cancel_message(&self, id: impl Into<String>) {
        self.enqueue(Task::Cancel(id.into()));
    }

    /// Enables automatic reconnection and connects unless already connected.
    pub fn reconnect(&self) {
        self.enqueue(Task::Reconnect);
    }

    /// Disconnects and disables automatic reconnection.
    pub fn disconnect(&self) {
        self.enqueue(Task::Disconnect);
    }

    /// Tells the session whether the host has network connectivity.
    /// Ignored while no client is registered.
    pub fn network_changed(&self, available: bool) {
        self.enqueue(Task::NetworkChanged(available));
    }

    /// Disconnects and stops the dispatch task. Later operations are no-ops
    /// and sends fail with `Unavailable`.
    pub fn shutdown(&self) {
        self.enqueue(Task::Shutdown);
    }

    /// Returns the most recent state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.clone()
    }

    /// API version the server reported while authenticating, if connected.
    #[must_use]
    pub fn server_version(&self) -> Option<i64> {
        *self.server_version.borrow()
    }

    /// Whether the connected server speaks an API older than
    /// [`MINIMUM_SUPPORTED_API_VERSION`] and should be upgraded.
    #[must_use]
    pub fn should_upgrade(&self) -> bool {
        self.server_version()
            .is_some_and(|version| version < MINIMUM_SUPPORTED_API_VERSION)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("server_version", &self.server_version())
            .finish_non_exhaustive()
    }
}

/// State owned by the dispatch loop.
struct Dispatcher {
    url: Url,
    password: String,
    timings: Timings,
    connector: Arc<dyn Connector>,
    weak: mpsc::WeakUnboundedSender<Task>,
    rx: mpsc::UnboundedReceiver<Task>,

    state: State,
    state_tx: watch::Sender<State>,
    version_tx: watch::Sender<Option<i64>>,

    clients: BTreeMap<ClientId, Arc<dyn Client>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    correlator: Correlator,
    timers: Timers,

    link: Option<Link>,

    /// Generation of the current connection attempt. Bumped on every
    /// disconnect, so that anything posted on behalf of an older socket is
    /// recognized and dropped.
    attempt: u64,

    auto_reconnect: bool,
    network_available: bool,
    watching_network: bool,
}

impl Dispatcher {
    async fn run(mut self) {
        self.timers
            .schedule(Timer::Sweep, self.timings.sweep_interval());

        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                () = timer::sleep_until(deadline) => {
                    while let Some(timer) = self.timers.pop_expired() {
                        self.fire(timer);
                    }
                }
                task = self.rx.recv() => {
                    let Some(task) = task else { break };
                    if self.handle(task).is_break() {
                        break;
                    }
                }
            }
        }

        debug!("session shutting down");
        self.disconnect(false);
        self.timers.clear();
        self.clients.clear();
    }

    fn handle(&mut self, task: Task) -> ControlFlow<()> {
        match task {
            Task::AddClient(id, client) => self.add_client(id, client),
            Task::RemoveClient(id) => self.remove_client(id),
            Task::HasClient(id, reply) => {
                let _ = reply.send(self.clients.contains_key(&id));
            }
            Task::AddInterceptor(interceptor) => self.interceptors.push(interceptor),
            Task::Send {
                envelope,
                owner,
                callback,
                reply,
            } => {
                let result = self.send(envelope, owner, callback);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            debug!("dropped message: {e}");
                        }
                    }
                }
            }
            Task::CancelOwner(owner) => {
                let count = self.correlator.cancel_owner(owner);
                trace!("cancelled {count} calls of {owner}");
            }
            Task::Cancel(id) => {
                self.correlator.cancel(&id);
            }
            Task::Reconnect => self.reconnect(),
            Task::Disconnect => {
                self.timers.cancel(Timer::Failsafe);
                self.disconnect(false);
            }
            Task::NetworkChanged(available) => self.network_changed(available),
            Task::Shutdown => return ControlFlow::Break(()),

            Task::Opened { attempt, result } => self.opened(attempt, result),
            Task::Received { attempt, envelope } => {
                if attempt == self.attempt {
                    self.dispatch(envelope);
                }
            }
            Task::Closed { attempt, code } => {
                if attempt == self.attempt {
                    self.closed(code);
                }
            }
            Task::Authenticated { attempt, response } => {
                if attempt == self.attempt {
                    self.authenticated(&response);
                }
            }
            Task::Rejected { attempt, reason } => {
                if attempt == self.attempt {
                    warn!("server rejected authentication: {reason}");
                    self.invalid_password();
                }
            }
            Task::Pong { attempt } => {
                if attempt == self.attempt && self.state == State::Connected {
                    self.timers.cancel(Timer::HeartbeatExpired);
                    self.timers
                        .schedule(Timer::Heartbeat, self.timings.heartbeat_interval());
                }
            }
            Task::Local(envelope) => self.dispatch(envelope),
        }

        ControlFlow::Continue(())
    }

    fn fire(&mut self, timer: Timer) {
        trace!("{timer:?} fired");
        match timer {
            Timer::AutoReconnect => {
                if self.state == State::Disconnected && self.auto_reconnect {
                    debug!("reconnecting");
                    self.reconnect();
                }
            }
            Timer::Heartbeat => self.ping(),
            Timer::HeartbeatExpired => {
                warn!("server stopped answering, dropping connection");
                self.correlator.cancel_owner(ClientId::INTERNAL);
                let reconnect = self.state == State::Connected || self.auto_reconnect;
                self.disconnect(reconnect);
            }
            Timer::Sweep => {
                let count = self.correlator.sweep(self.timings.call_timeout());
                if count > 0 {
                    debug!(
                        "forgot {count} unanswered calls, {} still pending",
                        self.correlator.len()
                    );
                }
                self.timers
                    .schedule(Timer::Sweep, self.timings.sweep_interval());
            }
            Timer::AutoDisconnect => {
                if self.clients.is_empty() {
                    debug!("no clients left, disconnecting");
                    self.disconnect(false);
                }
            }
            Timer::Failsafe => {
                if self.state == State::Disconnected && !self.clients.is_empty() {
                    debug!("no connectivity signal, reconnecting anyway");
                    self.reconnect();
                }
            }
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }

        let old = self.state;
        self.state = state;
        info!("{old} -> {state}");

        if state == State::Disconnected {
            self.version_tx.send_replace(None);
        }
        self.state_tx.send_replace(state);

        for client in self.clients.values() {
            client.on_state_changed(state, old);
        }
    }

    fn add_client(&mut self, id: ClientId, client: Arc<dyn Client>) {
        if self.clients.contains_key(&id) {
            trace!("{id} is already registered");
            return;
        }

        let first = self.clients.is_empty();
        client.on_state_changed(self.state, self.state);
        self.clients.insert(id, client);
        trace!("added {id}");

        if first {
            self.timers.cancel(Timer::AutoDisconnect);
            self.watch_network();
        }
    }

    fn remove_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            return;
        }

        self.correlator.cancel_owner(id);
        trace!("removed {id}");

        if self.clients.is_empty() {
            self.unwatch_network();
            self.timers
                .schedule(Timer::AutoDisconnect, self.timings.idle_disconnect_delay());
        }
    }

    fn watch_network(&mut self) {
        self.watching_network = true;
        self.timers
            .schedule(Timer::Failsafe, self.timings.failsafe_delay());

        // Starting to watch reports the current connectivity at once.
        self.network_changed(self.network_available);
    }

    fn unwatch_network(&mut self) {
        self.watching_network = false;
        self.timers.cancel(Timer::Failsafe);
    }

    fn network_changed(&mut self, available: bool) {
        self.network_available = available;
        if self.watching_network && available && self.state == State::Disconnected {
            debug!("network available, reconnecting");
            self.reconnect();
        }
    }

    fn reconnect(&mut self) {
        self.auto_reconnect = true;
        self.connect_if_not_connected();
    }

    fn connect_if_not_connected(&mut self) {
        let open = self.link.as_ref().is_some_and(Link::is_open);
        if self.state == State::Connected && open {
            return;
        }

        // Supersedes any attempt still in flight.
        if self.state != State::Disconnected || self.link.is_some() {
            self.disconnect(self.auto_reconnect);
        }

        self.timers.cancel(Timer::AutoReconnect);
        self.set_state(State::Connecting);
        self.start_attempt();
    }

    fn start_attempt(&self) {
        let attempt = self.attempt;
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let timeout = self.timings.connect_timeout();
        let tx = self.weak.clone();

        tokio::spawn(async move {
            let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
            let result = tokio::time::timeout(timeout, connector.connect(&url, inbound_tx))
                .await
                .map_err(Error::from)
                .and_then(convert::identity);

            let opened = result.is_ok();
            post(&tx, Task::Opened { attempt, result });
            if !opened {
                return;
            }

            let code = loop {
                match inbound_rx.recv().await {
                    Some(Inbound::Text(text)) => match Envelope::decode(&text) {
                        Ok(envelope) => post(&tx, Task::Received { attempt, envelope }),
                        Err(e) => error!("dropping malformed frame: {e}"),
                    },
                    Some(Inbound::Closed(code)) => break code,
                    None => break None,
                }
            };

            post(&tx, Task::Closed { attempt, code });
        });
    }

    fn opened(&mut self, attempt: u64, result: Result<Link>) {
        if attempt != self.attempt {
            if let Ok(link) = result {
                link.close();
            }
            return;
        }

        match result {
            Ok(link) => {
                debug!("socket open, authenticating");
                self.link = Some(link);
                self.authenticate();
            }
            Err(e) => {
                warn!("failed to connect to {}: {e}", self.url);
                self.disconnect(self.auto_reconnect);
            }
        }
    }

    fn authenticate(&mut self) {
        let attempt = self.attempt;
        let request = match Envelope::request(Request::Authenticate)
            .option(key::PASSWORD, self.password.as_str())
            .build()
        {
            Ok(request) => request,
            Err(e) => {
                error!("{e}");
                return;
            }
        };

        let (accepted, rejected) = (self.weak.clone(), self.weak.clone());
        let callback = Callback::new(move |response| {
            post(&accepted, Task::Authenticated { attempt, response });
        })
        .on_error(move |reason, _| {
            post(&rejected, Task::Rejected { attempt, reason });
        });

        // A handshake that never completes is as dead as a missed heartbeat.
        self.timers
            .schedule(Timer::HeartbeatExpired, self.timings.connect_timeout());
        if let Err(e) = self.send(request, Some(ClientId::INTERNAL), Some(callback)) {
            debug!("could not authenticate: {e}");
        }
    }

    fn authenticated(&mut self, response: &Envelope) {
        if self.state != State::Connecting {
            return;
        }

        self.timers.cancel(Timer::HeartbeatExpired);

        let version = response
            .object_option(key::ENVIRONMENT)
            .and_then(|environment| environment.get(key::API_VERSION))
            .and_then(serde_json::Value::as_i64);
        match version {
            Some(version) if version < MINIMUM_SUPPORTED_API_VERSION => {
                warn!("server api version {version} is older than {MINIMUM_SUPPORTED_API_VERSION}");
            }
            Some(version) => debug!("server api version {version}"),
            None => debug!("server did not report its api version"),
        }
        self.version_tx.send_replace(version);

        self.set_state(State::Connected);
        self.ping();
    }

    fn ping(&mut self) {
        if self.state != State::Connected {
            return;
        }

        self.correlator.cancel_owner(ClientId::INTERNAL);
        self.timers
            .schedule(Timer::HeartbeatExpired, self.timings.heartbeat_interval());

        let attempt = self.attempt;
        let tx = self.weak.clone();
        let ping = match Envelope::request(Request::Ping).build() {
            Ok(ping) => ping,
            Err(e) => {
                error!("{e}");
                return;
            }
        };

        let callback = Callback::new(move |_| post(&tx, Task::Pong { attempt }));
        if let Err(e) = self.send(ping, Some(ClientId::INTERNAL), Some(callback)) {
            debug!("heartbeat not sent: {e}");
        }
    }

    fn closed(&mut self, code: Option<u16>) {
        if code == Some(CLOSE_POLICY_VIOLATION) {
            warn!("server rejected the password");
            self.invalid_password();
        } else {
            info!("connection closed by server");
            self.disconnect(self.auto_reconnect);
        }
    }

    fn invalid_password(&mut self) {
        self.timers.cancel(Timer::Failsafe);
        self.disconnect(false);
        for client in self.clients.values() {
            client.on_invalid_password();
        }
    }

    fn send(
        &mut self,
        envelope: Envelope,
        owner: Option<ClientId>,
        callback: Option<Callback>,
    ) -> Result<String> {
        if callback.is_some() {
            let registered = owner.is_some_and(|owner| {
                owner == ClientId::INTERNAL || self.clients.contains_key(&owner)
            });
            if !registered {
                let e = Error::failed_precondition(format!(
                    "cannot send {} with a callback: owner is not a registered client",
                    envelope.name()
                ));
                error!("{e}");
                return Err(e);
            }
        }

        let id = envelope.id().to_owned();
        let owner = owner.unwrap_or(ClientId::INTERNAL);

        let responder = Responder {
            tx: self.weak.clone(),
        };
        if self
            .interceptors
            .iter()
            .any(|interceptor| interceptor.intercept(&envelope, &responder))
        {
            trace!("intercepted {}", envelope.name());
            if let Some(callback) = callback {
                self.correlator.insert(&id, owner, callback, true);
            }
            return Ok(id);
        }

        let Some(link) = &self.link else {
            return Err(Error::unavailable(format!(
                "cannot send {}: not connected",
                envelope.name()
            )));
        };

        // Sockets can die without reporting it.
        if !link.is_open() {
            debug!("socket died silently, reconnecting");
            self.disconnect(true);
            return Err(Error::unavailable(format!(
                "cannot send {}: socket is closed",
                envelope.name()
            )));
        }

        if let Some(callback) = callback {
            self.correlator.insert(&id, owner, callback, false);
        }

        trace!("sending {}", envelope.name());
        if let Err(e) = link.send(envelope.encode()) {
            self.correlator.cancel(&id);
            self.disconnect(true);
            return Err(e);
        }

        Ok(id)
    }

    fn dispatch(&mut self, envelope: Envelope) {
        if let Resolution::Unmatched(envelope) = self.correlator.resolve(envelope) {
            trace!("delivering {} to {} clients", envelope.name(), self.clients.len());
            for client in self.clients.values() {
                client.on_message_received(&envelope);
            }
        }
    }

    fn disconnect(&mut self, auto_reconnect: bool) {
        self.attempt += 1;
        self.auto_reconnect = auto_reconnect;

        if let Some(link) = self.link.take() {
            link.close();
        }

        let dropped = self.correlator.clear_remote();
        if dropped > 0 {
            debug!("dropped {dropped} pending calls");
        }

        self.timers.cancel(Timer::Heartbeat);
        self.timers.cancel(Timer::HeartbeatExpired);
        self.set_state(State::Disconnected);

        if auto_reconnect {
            self.timers
                .schedule(Timer::AutoReconnect, self.timings.reconnect_interval());
        } else {
            self.timers.cancel(Timer::AutoReconnect);
        }
    }
}
