//! Publishing an event to one or many relays and tracking each relay's
//! answer.

use crate::adapter::{Adapter, AdapterContext};
use crate::emitter::{Emitter, Unsubscriber};
use crate::message::{ClientMessage, RelayMessage};
use crate::metrics;
use nostr::{Event, EventId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strum::{Display, IntoStaticStr};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PublishStatus {
    Pending,
    Success,
    Failure,
    Timeout,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishEvent {
    Success {
        id: EventId,
        detail: String,
        relay: String,
    },
    Failure {
        id: EventId,
        detail: String,
        relay: String,
    },
    Timeout {
        relay: String,
    },
    Aborted {
        relay: String,
    },
    Complete,
}

impl PublishEvent {
    pub fn status(&self) -> Option<PublishStatus> {
        match self {
            PublishEvent::Success { .. } => Some(PublishStatus::Success),
            PublishEvent::Failure { .. } => Some(PublishStatus::Failure),
            PublishEvent::Timeout { .. } => Some(PublishStatus::Timeout),
            PublishEvent::Aborted { .. } => Some(PublishStatus::Aborted),
            PublishEvent::Complete => None,
        }
    }

    pub fn relay(&self) -> Option<&str> {
        match self {
            PublishEvent::Success { relay, .. }
            | PublishEvent::Failure { relay, .. }
            | PublishEvent::Timeout { relay }
            | PublishEvent::Aborted { relay } => Some(relay),
            PublishEvent::Complete => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub timeout: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// Publishes one event to one relay. Listeners attached between
/// [`Unicast::new`] and [`Unicast::start`] see every outcome.
pub struct Unicast {
    inner: Arc<UnicastInner>,
}

struct UnicastInner {
    event: Event,
    adapter: Adapter,
    timeout: Duration,
    events: Emitter<PublishEvent>,
    state: Mutex<UnicastState>,
}

struct UnicastState {
    status: PublishStatus,
    started: bool,
    handles: Vec<Unsubscriber>,
    timer: Option<JoinHandle<()>>,
}

impl Unicast {
    pub fn new(event: Event, relay: &str, context: &AdapterContext, options: PublishOptions) -> Self {
        let adapter = context.get_adapter(relay);

        let inner = Arc::new(UnicastInner {
            event,
            adapter,
            timeout: options.timeout,
            events: Emitter::new(),
            state: Mutex::new(UnicastState {
                status: PublishStatus::Pending,
                started: false,
                handles: Vec::new(),
                timer: None,
            }),
        });

        let weak: Weak<UnicastInner> = Arc::downgrade(&inner);
        let handle = inner.adapter.on_receive(move |message, _url| {
            let RelayMessage::Ok {
                event_id,
                status,
                message,
            } = message
            else {
                return;
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if *event_id != inner.event.id {
                return;
            }
            let relay = inner.relay().to_string();
            let outcome = if *status {
                PublishEvent::Success {
                    id: *event_id,
                    detail: message.clone(),
                    relay,
                }
            } else {
                PublishEvent::Failure {
                    id: *event_id,
                    detail: message.clone(),
                    relay,
                }
            };
            inner.settle(outcome);
        });
        inner.state.lock().handles.push(handle);

        Self { inner }
    }

    pub fn event(&self) -> &Event {
        &self.inner.event
    }

    pub fn relay(&self) -> &str {
        self.inner.relay()
    }

    pub fn status(&self) -> PublishStatus {
        self.inner.state.lock().status
    }

    pub fn on<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&PublishEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(listener)
    }

    /// Sends the event and arms the timeout on the current tokio runtime.
    /// Does nothing once started or settled.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.started || state.status != PublishStatus::Pending {
                return;
            }
            state.started = true;
        }

        debug!(
            "[{}] Publishing event {}",
            self.inner.relay(),
            self.inner.event.id
        );
        self.inner
            .adapter
            .send(ClientMessage::event(self.inner.event.clone()));

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    "[{}] No runtime available, publish will not time out",
                    self.inner.relay()
                );
                return;
            }
        };

        let inner = self.inner.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            let relay = inner.relay().to_string();
            inner.settle(PublishEvent::Timeout { relay });
        });

        let mut state = self.inner.state.lock();
        if state.status == PublishStatus::Pending {
            state.timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    pub fn abort(&self) {
        let relay = self.inner.relay().to_string();
        self.inner.settle(PublishEvent::Aborted { relay });
    }
}

impl UnicastInner {
    fn relay(&self) -> &str {
        self.adapter.url()
    }

    /// First outcome wins. Emits it, then `Complete`, then releases every
    /// listener.
    fn settle(&self, outcome: PublishEvent) {
        let Some(status) = outcome.status() else {
            return;
        };

        let (handles, timer) = {
            let mut state = self.state.lock();
            if state.status != PublishStatus::Pending {
                return;
            }
            state.status = status;
            (std::mem::take(&mut state.handles), state.timer.take())
        };

        debug!("[{}] Publish of {} ended: {}", self.relay(), self.event.id, status);
        metrics::publish_outcomes(status.into()).increment(1);

        self.events.emit(&outcome);
        self.events.emit(&PublishEvent::Complete);

        for handle in handles {
            handle.unsubscribe();
        }
        self.events.clear();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

/// Publishes one event to several relays, aggregating their outcomes.
pub struct Multicast {
    inner: Arc<MulticastInner>,
}

struct MulticastInner {
    event: Event,
    children: Vec<Unicast>,
    statuses: Mutex<HashMap<String, PublishStatus>>,
    completed: Mutex<bool>,
    events: Emitter<PublishEvent>,
}

impl Multicast {
    pub fn new(
        event: Event,
        relays: &[String],
        context: &AdapterContext,
        options: PublishOptions,
    ) -> Self {
        let mut seen = HashSet::new();
        let children: Vec<Unicast> = relays
            .iter()
            .filter(|relay| seen.insert(context.normalize(relay)))
            .map(|relay| Unicast::new(event.clone(), relay, context, options))
            .collect();

        let statuses = children
            .iter()
            .map(|child| (child.relay().to_string(), PublishStatus::Pending))
            .collect();

        let inner = Arc::new(MulticastInner {
            event,
            children,
            statuses: Mutex::new(statuses),
            completed: Mutex::new(false),
            events: Emitter::new(),
        });

        for child in &inner.children {
            let weak = Arc::downgrade(&inner);
            let relay = child.relay().to_string();
            // Children release their own listeners once they complete.
            let _handle = child.on(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.child_event(&relay, event);
                }
            });
        }

        Self { inner }
    }

    pub fn event(&self) -> &Event {
        &self.inner.event
    }

    pub fn statuses(&self) -> HashMap<String, PublishStatus> {
        self.inner.statuses.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.completed.lock()
    }

    pub fn on<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&PublishEvent) + Send + Sync + 'static,
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

    pub fn abort(&self) {
        for child in &self.inner.children {
            child.abort();
        }
    }
}

impl MulticastInner {
    fn child_event(&self, relay: &str, event: &PublishEvent) {
        let Some(status) = event.status() else {
            return;
        };

        let done = {
            let mut statuses = self.statuses.lock();
            statuses.insert(relay.to_string(), status);
            statuses
                .values()
                .all(|status| *status != PublishStatus::Pending)
        };

        self.events.emit(event);

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
        self.events.emit(&PublishEvent::Complete);
        self.events.clear();
    }
}

/// Publishes `event` to `relays` and resolves with every relay's outcome.
pub async fn publish(
    event: Event,
    relays: &[String],
    context: &AdapterContext,
    options: PublishOptions,
) -> HashMap<String, PublishStatus> {
    let multicast = Multicast::new(event, relays, context, options);
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));

    let _handle = multicast.on(move |event| {
        if *event == PublishEvent::Complete {
            if let Some(done_tx) = done_tx.lock().take() {
                let _ = done_tx.send(());
            }
        }
    });

    multicast.start();
    let _ = done_rx.await;
    multicast.statuses()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::default_policies;
    use crate::pool::Pool;
    use crate::test_utils::{signed_event, MockConnection, MockTransport};
    use nostr::Keys;
    use pretty_assertions::assert_eq;

    const URL: &str = "wss://relay.test";

    fn setup() -> (AdapterContext, Arc<MockTransport>, Event) {
        let transport = MockTransport::new();
        let pool = Arc::new(Pool::with_transport(transport.clone(), default_policies()));
        let event = signed_event(&Keys::generate(), 1, "hello");
        (AdapterContext::new(pool), transport, event)
    }

    fn record(unicast: &Unicast) -> Arc<Mutex<Vec<PublishEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _handle = unicast.on(move |event| sink.lock().push(event.clone()));
        events
    }

    fn connect(transport: &MockTransport) -> MockConnection {
        let connection = transport.connection(URL).unwrap();
        connection.open();
        connection
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_success() {
        let (context, transport, event) = setup();
        let unicast = Unicast::new(event.clone(), URL, &context, PublishOptions::default());
        let events = record(&unicast);

        unicast.start();
        let connection = connect(&transport);
        assert_eq!(connection.sent(), vec![ClientMessage::event(event.clone())]);

        connection.receive(RelayMessage::Ok {
            event_id: event.id,
            status: true,
            message: "stored".to_string(),
        });

        assert_eq!(unicast.status(), PublishStatus::Success);
        assert_eq!(
            *events.lock(),
            vec![
                PublishEvent::Success {
                    id: event.id,
                    detail: "stored".to_string(),
                    relay: URL.to_string(),
                },
                PublishEvent::Complete,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_ignores_other_events_and_times_out() {
        let (context, transport, event) = setup();
        let unicast = Unicast::new(
            event,
            URL,
            &context,
            PublishOptions {
                timeout: Duration::from_secs(5),
            },
        );
        let events = record(&unicast);

        unicast.start();
        connect(&transport).receive(RelayMessage::Ok {
            event_id: EventId::all_zeros(),
            status: true,
            message: String::new(),
        });
        assert_eq!(unicast.status(), PublishStatus::Pending);

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(unicast.status(), PublishStatus::Timeout);
        assert_eq!(
            *events.lock(),
            vec![
                PublishEvent::Timeout {
                    relay: URL.to_string()
                },
                PublishEvent::Complete,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_is_final_and_idempotent() {
        let (context, transport, event) = setup();
        let unicast = Unicast::new(event.clone(), URL, &context, PublishOptions::default());
        let events = record(&unicast);

        unicast.start();
        unicast.abort();
        unicast.abort();
        connect(&transport).receive(RelayMessage::Ok {
            event_id: event.id,
            status: true,
            message: String::new(),
        });
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(unicast.status(), PublishStatus::Aborted);
        assert_eq!(
            *events.lock(),
            vec![
                PublishEvent::Aborted {
                    relay: URL.to_string()
                },
                PublishEvent::Complete,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_releases_socket_listeners() {
        let (context, transport, event) = setup();
        let socket = context.pool.get(URL);
        let unicast = Unicast::new(event.clone(), URL, &context, PublishOptions::default());
        unicast.start();
        let connection = connect(&transport);
        let _ = record(&unicast);

        let before = socket.listener_count();
        connection.receive(RelayMessage::Ok {
            event_id: event.id,
            status: false,
            message: "blocked: spam".to_string(),
        });

        assert_eq!(unicast.status(), PublishStatus::Failure);
        assert_eq!(socket.listener_count(), before - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_with_no_relays_completes_immediately() {
        let (context, _transport, event) = setup();
        let multicast = Multicast::new(event, &[], &context, PublishOptions::default());
        let completed = Arc::new(Mutex::new(false));
        let flag = completed.clone();
        let _handle = multicast.on(move |event| {
            if *event == PublishEvent::Complete {
                *flag.lock() = true;
            }
        });

        multicast.start();

        assert!(*completed.lock());
        assert!(multicast.statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_deduplicates_relays() {
        let (context, transport, event) = setup();
        let relays = vec![URL.to_string(), format!("{URL}/")];
        let multicast = Multicast::new(event.clone(), &relays, &context, PublishOptions::default());

        multicast.start();
        let connection = connect(&transport);

        assert_eq!(connection.sent().len(), 1);
        assert_eq!(
            multicast.statuses(),
            HashMap::from([(URL.to_string(), PublishStatus::Pending)])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_sends_once() {
        let (context, transport, event) = setup();
        let unicast = Unicast::new(event.clone(), URL, &context, PublishOptions::default());
        let events = record(&unicast);

        unicast.start();
        unicast.start();
        let connection = connect(&transport);
        assert_eq!(connection.sent(), vec![ClientMessage::event(event)]);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(
            *events.lock(),
            vec![
                PublishEvent::Timeout {
                    relay: URL.to_string()
                },
                PublishEvent::Complete,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_abort_sends_nothing() {
        let (context, transport, event) = setup();
        let unicast = Unicast::new(event, URL, &context, PublishOptions::default());

        unicast.abort();
        unicast.start();

        assert_eq!(unicast.status(), PublishStatus::Aborted);
        assert_eq!(transport.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multicast_start_after_abort_sends_nothing() {
        let (context, transport, event) = setup();
        let relays = vec![URL.to_string(), "wss://other.test".to_string()];
        let multicast = Multicast::new(event, &relays, &context, PublishOptions::default());

        multicast.abort();
        multicast.start();
        multicast.start();

        assert!(multicast.is_complete());
        assert_eq!(transport.connection_count(), 0);
        assert!(multicast
            .statuses()
            .values()
            .all(|status| *status == PublishStatus::Aborted));
    }
}
