//! Subscriptions against one or many relays, with cross-relay deduplication.

use crate::adapter::{Adapter, AdapterContext};
use crate::emitter::{Emitter, Unsubscriber};
use crate::message::{ClientMessage, RelayMessage};
use crate::metrics;
use crate::socket::SocketStatus;
use crate::tracker::Tracker;
use nostr::{Event, Filter, SubscriptionId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type EventVerifier = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

pub fn verify_signature() -> EventVerifier {
    Arc::new(|event: &Event| event.verify().is_ok())
}

#[derive(Clone)]
pub struct RequestOptions {
    /// Closes the request unconditionally once elapsed.
    pub timeout: Option<Duration>,
    /// Shared deduplication index. A fresh one is used when unset.
    pub tracker: Option<Arc<Tracker>>,
    /// Close after end of stored events or on disconnect.
    pub auto_close: bool,
    /// Events failing this check are reported as invalid. `None` skips
    /// verification.
    pub verify_event: Option<EventVerifier>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            tracker: None,
            auto_close: false,
            verify_event: Some(verify_signature()),
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("tracker", &self.tracker.is_some())
            .field("auto_close", &self.auto_close)
            .field("verify_event", &self.verify_event.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    Event(Box<Event>),
    Duplicate(Box<Event>),
    Invalid(Box<Event>),
    Filtered(Box<Event>),
    Eose,
    Disconnect,
    Close,
}

pub fn generate_subscription_id() -> SubscriptionId {
    SubscriptionId::new(format!("REQ-{:08x}", rand::random::<u32>()))
}

/// One subscription on one relay.
pub struct Unireq {
    inner: Arc<UnireqInner>,
}

struct UnireqInner {
    id: SubscriptionId,
    filter: Filter,
    adapter: Adapter,
    tracker: Arc<Tracker>,
    options: RequestOptions,
    events: Emitter<RequestEvent>,
    state: Mutex<UnireqState>,
}

#[derive(Default)]
struct UnireqState {
    started: bool,
    closed: bool,
    /// Set once a disconnect was reported, until the socket opens again.
    disconnected: bool,
    handles: Vec<Unsubscriber>,
    timer: Option<JoinHandle<()>>,
}

impl Unireq {
    pub fn new(filter: Filter, relay: &str, context: &AdapterContext, options: RequestOptions) -> Self {
        let adapter = context.get_adapter(relay);
        let tracker = options.tracker.clone().unwrap_or_default();

        let inner = Arc::new(UnireqInner {
            id: generate_subscription_id(),
            filter,
            adapter,
            tracker,
            options,
            events: Emitter::new(),
            state: Mutex::new(UnireqState::default()),
        });

        let weak: Weak<UnireqInner> = Arc::downgrade(&inner);
        let on_receive = inner.adapter.on_receive(move |message, _url| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(message);
            }
        });

        let weak: Weak<UnireqInner> = Arc::downgrade(&inner);
        let on_status = inner.adapter.on_status(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner.status_changed(status);
            }
        });

        inner.state.lock().handles = vec![on_receive, on_status];

        Self { inner }
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.inner.id
    }

    pub fn relay(&self) -> &str {
        self.inner.adapter.url()
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.inner.tracker
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn on<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&RequestEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(listener)
    }

    /// Sends the REQ and arms the timeout, if any.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.started || state.closed {
                return;
            }
            state.started = true;
        }

        debug!("[{}] Starting request {}", self.relay(), self.inner.id);
        self.inner.adapter.send(self.inner.req());

        let Some(timeout) = self.inner.options.timeout else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("[{}] No runtime available, request will not time out", self.relay());
                return;
            }
        };

        let inner = self.inner.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!("[{}] Request {} timed out", inner.adapter.url(), inner.id);
            inner.finish(true);
        });

        let mut state = self.inner.state.lock();
        if state.closed {
            timer.abort();
        } else {
            state.timer = Some(timer);
        }
    }

    pub fn close(&self) {
        self.inner.finish(true);
    }
}

impl UnireqInner {
    fn req(&self) -> ClientMessage {
        ClientMessage::req(self.id.clone(), vec![self.filter.clone()])
    }

    fn is_active(&self) -> bool {
        let state = self.state.lock();
        state.started && !state.closed
    }

    fn receive(&self, message: &RelayMessage) {
        if message.subscription_id() != Some(&self.id) || !self.is_active() {
            return;
        }

        match message {
            RelayMessage::Event { event, .. } => {
                let classified = self.classify(event);
                self.events.emit(&classified);
            }
            RelayMessage::Eose(_) => {
                self.events.emit(&RequestEvent::Eose);
                if self.options.auto_close {
                    self.finish(true);
                }
            }
            RelayMessage::Closed { message, .. } => {
                debug!(
                    "[{}] Relay closed request {}: {}",
                    self.adapter.url(),
                    self.id,
                    message
                );
                self.finish(false);
            }
            _ => {}
        }
    }

    fn classify(&self, event: &Event) -> RequestEvent {
        let event = Box::new(event.clone());

        let (classification, result) = if self.tracker.track(event.id, self.adapter.url()) {
            ("duplicate", RequestEvent::Duplicate(event))
        } else if self
            .options
            .verify_event
            .as_ref()
            .is_some_and(|verify| !verify(&event))
        {
            ("invalid", RequestEvent::Invalid(event))
        } else if !self.filter.match_event(&event) {
            ("filtered", RequestEvent::Filtered(event))
        } else {
            ("event", RequestEvent::Event(event))
        };

        metrics::request_events(classification).increment(1);
        result
    }

    fn status_changed(&self, status: SocketStatus) {
        {
            let mut state = self.state.lock();
            if matches!(status, SocketStatus::Open | SocketStatus::Opening) {
                state.disconnected = false;
                return;
            }
            if !state.started || state.closed || state.disconnected {
                return;
            }
            state.disconnected = true;
        }

        self.events.emit(&RequestEvent::Disconnect);
        if self.options.auto_close {
            self.finish(true);
        }
    }

    /// Ends the request once. With `notify_relay`, a CLOSE is sent when the
    /// relay can still receive it, otherwise a REQ still waiting in the
    /// socket queue is withdrawn.
    fn finish(&self, notify_relay: bool) {
        let (started, handles, timer) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.started,
                std::mem::take(&mut state.handles),
                state.timer.take(),
            )
        };

        for handle in handles {
            handle.unsubscribe();
        }

        if started && notify_relay {
            if self.adapter.is_connected() {
                self.adapter.send(ClientMessage::Close(self.id.clone()));
            } else if self.adapter.withdraw(&self.req()) {
                debug!(
                    "[{}] Withdrew unsent request {}",
                    self.adapter.url(),
                    self.id
                );
            }
        }

        self.events.emit(&RequestEvent::Close);
        self.events.clear();

        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MultireqEvent {
    /// An event from one of the child requests.
    Relay { relay: String, event: RequestEvent },
    /// Every child request has closed.
    Close,
}

/// The same subscription on several relays, sharing one tracker.
pub struct Multireq {
    inner: Arc<MultireqInner>,
}

struct MultireqInner {
    children: Vec<Unireq>,
    tracker: Arc<Tracker>,
    closed: Mutex<HashSet<String>>,
    completed: Mutex<bool>,
    events: Emitter<MultireqEvent>,
}

impl Multireq {
    pub fn new(
        filter: Filter,
        relays: &[String],
        context: &AdapterContext,
        options: RequestOptions,
    ) -> Self {
        let tracker = options.tracker.clone().unwrap_or_default();
        let child_options = RequestOptions {
            tracker: Some(tracker.clone()),
            ..options
        };

        let mut seen = HashSet::new();
        let children: Vec<Unireq> = relays
            .iter()
            .filter(|relay| seen.insert(context.normalize(relay)))
            .map(|relay| Unireq::new(filter.clone(), relay, context, child_options.clone()))
            .collect();

        let inner = Arc::new(MultireqInner {
            children,
            tracker,
            closed: Mutex::new(HashSet::new()),
            completed: Mutex::new(false),
            events: Emitter::new(),
        });

        for child in &inner.children {
            let weak = Arc::downgrade(&inner);
            let relay = child.relay().to_string();
            // Children release their own listeners once they close.
            let _handle = child.on(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.child_event(&relay, event);
                }
            });
        }

        Self { inner }
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.inner.tracker
    }

    pub fn relays(&self) -> Vec<String> {
        self.inner
            .children
            .iter()
            .map(|child| child.relay().to_string())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.completed.lock()
    }

    pub fn on<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&MultireqEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(listener)
    }

    pub fn start(&self) {
        if self.inner.children.is_empty() {
            self.inner.complete();
            return;
        }
        for child in &self.inner.children {
            child.start();
        }
    }

    pub fn close(&self) {
        for child in &self.inner.children {
            child.close();
        }
    }
}

impl MultireqInner {
    fn child_event(&self, relay: &str, event: &RequestEvent) {
        self.events.emit(&MultireqEvent::Relay {
            relay: relay.to_string(),
            event: event.clone(),
        });

        if *event != RequestEvent::Close {
            return;
        }

        let done = {
            let mut closed = self.closed.lock();
            closed.insert(relay.to_string());
            closed.len() == self.children.len()
        };
        if done {
            self.complete();
        }
    }

    fn complete(&self) {
        {
            let mut completed = self.completed.lock();
            if *completed {
                return;
            }
            *completed = true;
        }
        self.events.emit(&MultireqEvent::Close);
        self.events.clear();
    }
}

/// Runs an auto-closing request against `relays` and resolves with every
/// accepted event once all of them closed.
pub async fn fetch(
    filter: Filter,
    relays: &[String],
    context: &AdapterContext,
    options: RequestOptions,
) -> Vec<Event> {
    let multireq = Multireq::new(
        filter,
        relays,
        context,
        RequestOptions {
            auto_close: true,
            ..options
        },
    );

    let collected = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));

    let sink = collected.clone();
    let _handle = multireq.on(move |event| match event {
        MultireqEvent::Relay {
            event: RequestEvent::Event(event),
            ..
        } => sink.lock().push(event.as_ref().clone()),
        MultireqEvent::Close => {
            if let Some(done_tx) = done_tx.lock().take() {
                let _ = done_tx.send(());
            }
        }
        _ => {}
    });

    multireq.start();
    let _ = done_rx.await;

    let events = std::mem::take(&mut *collected.lock());
    events
}
