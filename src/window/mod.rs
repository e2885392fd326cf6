//! Scroll-friendly view of a remote, paginated collection.
//!
//! A [`SlidingWindow`] keeps a bounded cache of the records around what is
//! being looked at. Reading an index that is not cached (or is stale) fetches
//! the page around it, unless the view is scrolling. Only one page is ever in
//! flight; asking for an index outside of it replaces it.
//!
//! When the collection changes the cache is not cleared. Entries are marked
//! dirty instead, so they can still be shown until their page is fetched
//! again.
//!
//! ```text
//! requery -> count query -> set_count -> entries dirty
//! get_track(i) miss -> page query (i - 10, window size) -> entries fresh
//! ```

pub mod bounded;

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::{Map, Value};

use crate::{
    correlator::Callback,
    events::{Client, ClientId, State},
    protocol::{key, Broadcast, Envelope, Kind},
    session::Session,
};

use bounded::BoundedMap;

/// Most entries a window caches.
pub const MAX_ENTRIES: usize = 150;

/// Records fetched per page unless configured otherwise.
pub const DEFAULT_WINDOW_SIZE: usize = 75;

/// Records fetched before the requested index.
const LOOKBEHIND: usize = 10;

/// One record as the server sends it.
pub type Record = Map<String, Value>;

/// Builds the queries a window sends.
pub trait QueryFactory: Send + Sync {
    /// Query whose response carries the size of the collection in `count`.
    fn count_query(&self) -> Option<Envelope>;

    /// Query for `limit` records starting at `offset`. The response carries
    /// them in `data` and echoes `offset`.
    fn page_query(&self, offset: usize, limit: usize) -> Option<Envelope>;

    /// Whether queries need a connected session. Collections served by an
    /// interceptor can be queried while disconnected.
    fn connection_required(&self) -> bool {
        true
    }

    /// Whether `broadcast` means the collection has changed.
    fn invalidated_by(&self, broadcast: &Envelope) -> bool {
        Broadcast::PlayQueueChanged.is(broadcast.name())
    }
}

/// Turns a raw record into a value.
pub trait Mapper<T>: Send + Sync {
    fn map(&self, record: &Record) -> T;
}

impl<T, F> Mapper<T> for F
where
    F: Fn(&Record) -> T + Send + Sync,
{
    fn map(&self, record: &Record) -> T {
        self(record)
    }
}

/// Observer of a window, typically whatever renders it.
pub trait WindowListener: Send + Sync {
    /// Cached data changed; redraw.
    fn on_data_changed(&self) {}

    /// A page of `count` records starting at `offset` arrived. Called with
    /// `(0, 0)` when the count is reset.
    fn on_metadata_loaded(&self, offset: usize, count: usize) {
        let _ = (offset, count);
    }

    /// The collection was counted again.
    fn on_reloaded(&self, count: usize) {
        let _ = count;
    }
}

/// The page currently in flight.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    pub offset: usize,
    pub limit: usize,
}

impl Window {
    /// Page that serves `index`, starting a little before it.
    #[must_use]
    pub fn around(index: usize, limit: usize) -> Self {
        Self {
            offset: index.saturating_sub(LOOKBEHIND),
            limit,
        }
    }

    #[must_use]
    pub fn covers(&self, index: usize) -> bool {
        index >= self.offset && index - self.offset < self.limit
    }
}

#[derive(Clone, Debug)]
struct Entry<T> {
    value: T,
    dirty: bool,
}

struct Inner<T> {
    factory: Option<Arc<dyn QueryFactory>>,
    listener: Option<Arc<dyn WindowListener>>,
    entries: BoundedMap<usize, Entry<T>>,
    count: usize,
    window: Option<Window>,
    window_size: usize,
    active: bool,
    scrolling: bool,

    /// Bumped whenever queries in flight are cancelled. A response that
    /// was already on its way carries an older value and is ignored.
    generation: u64,
}

impl<T> Inner<T> {
    fn is_current(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }
}

struct Shared<T> {
    id: ClientId,
    session: Session,
    mapper: Box<dyn Mapper<T>>,
    inner: Mutex<Inner<T>>,
    this: Weak<Shared<T>>,
}

/// Sliding-window cache over one query.
///
/// Starts paused. While resumed, the window is a client of its session: it
/// requeries whenever the session connects or the collection changes.
/// Pause it before dropping it, or it stays registered.
pub struct SlidingWindow<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SlidingWindow<T>
where
    T: Clone + Send + 'static,
{
    pub fn new<M>(session: Session, factory: Arc<dyn QueryFactory>, mapper: M) -> Self
    where
        M: Mapper<T> + 'static,
    {
        let shared = Arc::new_cyclic(|this| Shared {
            id: ClientId::new(),
            session,
            mapper: Box::new(mapper),
            inner: Mutex::new(Inner {
                factory: Some(factory),
                listener: None,
                entries: BoundedMap::new(MAX_ENTRIES),
                count: 0,
                window: None,
                window_size: DEFAULT_WINDOW_SIZE,
                active: false,
                scrolling: false,
                generation: 0,
            }),
            this: Weak::clone(this),
        });

        Self { shared }
    }

    /// Identity the window's queries are sent under.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.shared.id
    }

    /// Counts the collection again.
    pub fn requery(&self) {
        self.shared.requery();
    }

    /// Sets the collection size and marks every cached entry stale.
    pub fn set_count(&self, count: usize) {
        self.shared.set_count(count);
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.shared.lock().count
    }

    /// Returns the record at `index` if cached, even if stale. Fetches the
    /// page around it unless it is cached and fresh, or the view is
    /// scrolling.
    #[must_use]
    pub fn get_track(&self, index: usize) -> Option<T> {
        self.shared.get_track(index)
    }

    /// Fetches the page around `index` unless one covering it is in flight.
    pub fn get_page_around(&self, index: usize) {
        let mut inner = self.shared.lock();
        self.shared.page_around(&mut inner, index);
    }

    /// The page in flight, if any.
    #[must_use]
    pub fn window(&self) -> Option<Window> {
        self.shared.lock().window
    }

    /// Starts observing the session. Requeries right away if connected.
    pub fn resume(&self) {
        self.shared.lock().active = true;
        let client: Arc<dyn Client> = Arc::clone(&self.shared) as Arc<dyn Client>;
        self.shared.session.add_client(self.shared.id, client);
    }

    /// Stops observing the session and forgets queries in flight.
    pub fn pause(&self) {
        let mut inner = self.shared.lock();
        inner.active = false;
        self.shared.cancel(&mut inner);
        drop(inner);

        self.shared.session.remove_client(self.shared.id);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.lock().active
    }

    /// While scrolling no pages are fetched. Settling triggers a redraw, so
    /// that the rows now visible fetch what they miss.
    pub fn set_scrolling(&self, scrolling: bool) {
        let mut inner = self.shared.lock();
        inner.scrolling = scrolling;
        let listener = inner.listener.clone();
        drop(inner);

        if !scrolling {
            if let Some(listener) = listener {
                listener.on_data_changed();
            }
        }
    }

    /// Swaps the query and counts again.
    pub fn set_query_factory(&self, factory: Arc<dyn QueryFactory>) {
        self.shared.lock().factory = Some(factory);
        self.shared.requery();
    }

    /// Records fetched per page. Clamped to at least one.
    pub fn set_window_size(&self, window_size: usize) {
        self.shared.lock().window_size = window_size.max(1);
    }

    pub fn set_listener(&self, listener: Arc<dyn WindowListener>) {
        self.shared.lock().listener = Some(listener);
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + 'static,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn can_query(&self, factory: &dyn QueryFactory) -> bool {
        !factory.connection_required() || self.session.state() == State::Connected
    }

    /// Forgets the page in flight and every call of this window.
    fn cancel(&self, inner: &mut Inner<T>) {
        inner.generation += 1;
        inner.window = None;
        self.session.cancel_messages(self.id);
    }

    fn requery(&self) {
        let mut inner = self.lock();
        if !inner.active {
            return;
        }

        let Some(factory) = inner.factory.clone() else {
            drop(inner);
            self.set_count(0);
            return;
        };

        if !self.can_query(factory.as_ref()) {
            trace!("{}: not connected, deferring requery", self.id);
            return;
        }

        self.cancel(&mut inner);
        let generation = inner.generation;
        drop(inner);

        let Some(query) = factory.count_query() else {
            self.set_count(0);
            return;
        };

        debug!("{}: counting {}", self.id, query.name());
        let this = Weak::clone(&self.this);
        let callback = Callback::new(move |response| {
            if let Some(shared) = this.upgrade() {
                shared.counted(&response, generation);
            }
        });
        self.session.post(query, Some(self.id), Some(callback));
    }

    fn counted(&self, response: &Envelope, generation: u64) {
        if !self.lock().is_current(generation) {
            trace!("{}: ignoring superseded count", self.id);
            return;
        }

        let count = response
            .i64_option(key::COUNT)
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or_default();
        self.set_count(count);

        let listener = self.lock().listener.clone();
        if let Some(listener) = listener {
            listener.on_reloaded(count);
        }
    }

    fn set_count(&self, count: usize) {
        let mut inner = self.lock();
        inner.count = count;
        for entry in inner.entries.values_mut() {
            entry.dirty = true;
        }
        self.cancel(&mut inner);
        let listener = inner.listener.clone();
        drop(inner);

        if let Some(listener) = listener {
            listener.on_data_changed();
            listener.on_metadata_loaded(0, 0);
        }
    }

    fn get_track(&self, index: usize) -> Option<T> {
        let mut inner = self.lock();
        let (value, fresh) = match inner.entries.get(&index) {
            Some(entry) => (Some(entry.value.clone()), !entry.dirty),
            None => (None, false),
        };

        if !fresh && !inner.scrolling {
            self.page_around(&mut inner, index);
        }

        value
    }

    fn page_around(&self, inner: &mut Inner<T>, index: usize) {
        if !inner.active {
            return;
        }

        if inner.window.is_some_and(|window| window.covers(index)) {
            return;
        }

        let Some(factory) = inner.factory.clone() else {
            return;
        };
        if !self.can_query(factory.as_ref()) {
            return;
        }

        let window = Window::around(index, inner.window_size);
        let Some(query) = factory.page_query(window.offset, window.limit) else {
            return;
        };

        self.cancel(inner);
        inner.window = Some(window);
        let generation = inner.generation;

        trace!(
            "{}: fetching {}..{} for {index}",
            self.id,
            window.offset,
            window.offset + window.limit
        );
        let this = Weak::clone(&self.this);
        let callback = Callback::new(move |response| {
            if let Some(shared) = this.upgrade() {
                shared.paged(&response, window, generation);
            }
        });
        self.session.post(query, Some(self.id), Some(callback));
    }

    fn paged(&self, response: &Envelope, window: Window, generation: u64) {
        if !self.lock().is_current(generation) {
            trace!(
                "{}: ignoring superseded page at {}",
                self.id,
                window.offset
            );
            return;
        }

        let offset = response
            .i64_option(key::OFFSET)
            .and_then(|offset| usize::try_from(offset).ok())
            .unwrap_or(window.offset);

        let Some(data) = response.array_option(key::DATA) else {
            let mut inner = self.lock();
            if inner.is_current(generation) {
                inner.window = None;
            }
            return;
        };

        let values: Vec<_> = data
            .iter()
            .enumerate()
            .filter_map(|(i, record)| {
                record
                    .as_object()
                    .map(|record| (offset + i, self.mapper.map(record)))
            })
            .collect();

        let mut inner = self.lock();
        if !inner.is_current(generation) {
            return;
        }
        inner.window = None;
        for (index, value) in values {
            inner.entries.insert(index, Entry { value, dirty: false });
        }
        trace!("{}: {} entries cached", self.id, inner.entries.len());
        let listener = inner.listener.clone();
        drop(inner);

        if let Some(listener) = listener {
            listener.on_data_changed();
            listener.on_metadata_loaded(offset, data.len());
        }
    }
}

impl<T> Client for Shared<T>
where
    T: Clone + Send + 'static,
{
    fn on_state_changed(&self, new: State, _old: State) {
        // Also runs when the window is added to a connected session.
        if new == State::Connected {
            self.requery();
        }
    }

    fn on_message_received(&self, message: &Envelope) {
        if message.kind() != Kind::Broadcast {
            return;
        }

        let factory = self.lock().factory.clone();
        if factory.is_some_and(|factory| factory.invalidated_by(message)) {
            debug!("{}: {} invalidated the window", self.id, message.name());
            self.requery();
        }
    }
}
