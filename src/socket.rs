//! One relay connection: lifecycle state machine, ordered outbound queue and
//! decoded inbound stream.

use crate::auth::AuthState;
use crate::emitter::{Emitter, Registry, Unsubscriber};
use crate::error::{Error, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::metrics;
use crate::transport::{Connection, Transport, TransportSink};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use strum::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SocketStatus {
    Closed,
    Opening,
    Open,
    Error,
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Status(SocketStatus),
    Enqueue(ClientMessage),
    Send(ClientMessage),
    Receive(RelayMessage),
    /// A message its sender no longer wants delivered. Policies holding a
    /// copy drop it.
    Withdraw(ClientMessage),
    Error(String),
}

/// What a transport reports about the connection it manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Close,
}

type ReceiveGate = Arc<dyn Fn(&RelayMessage) -> bool + Send + Sync>;

pub struct Socket {
    url: String,
    transport: Arc<dyn Transport>,
    auth: AuthState,
    events: Emitter<SocketEvent>,
    receive_gates: Registry<ReceiveGate>,
    inner: Mutex<SocketInner>,
    this: Weak<Socket>,
}

struct SocketInner {
    status: SocketStatus,
    queue: VecDeque<ClientMessage>,
    paused: bool,
    connection: Option<Arc<dyn Connection>>,
    generation: u64,
    disposed: bool,
}

impl Socket {
    pub fn new(url: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let socket = Arc::new_cyclic(|this| Socket {
            url: url.into(),
            transport,
            auth: AuthState::new(),
            events: Emitter::new(),
            receive_gates: Registry::new(),
            inner: Mutex::new(SocketInner {
                status: SocketStatus::Closed,
                queue: VecDeque::new(),
                paused: false,
                connection: None,
                generation: 0,
                disposed: false,
            }),
            this: this.clone(),
        });

        let auth = socket.auth.clone();
        let _tracking = socket.on(move |event| auth.observe(event));

        socket
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> SocketStatus {
        self.inner.lock().status
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn queued(&self) -> Vec<ClientMessage> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    pub fn on<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&SocketEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.events.listener_count()
    }

    /// Registers a gate consulted before each decoded message is emitted.
    /// A message any gate rejects is dropped.
    pub fn intercept_receive<F>(&self, gate: F) -> Unsubscriber
    where
        F: Fn(&RelayMessage) -> bool + Send + Sync + 'static,
    {
        self.receive_gates.add(Arc::new(gate))
    }

    pub fn open(&self) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.connection.is_some() {
                return Err(Error::already_open(&self.url));
            }
            inner.generation += 1;
            inner.status = SocketStatus::Opening;
            inner.generation
        };

        info!("[{}] Opening connection", self.url);
        self.events.emit(&SocketEvent::Status(SocketStatus::Opening));

        let sink = TransportSink::new(self.this.clone(), generation);
        match self.transport.connect(&self.url, sink) {
            Ok(connection) => {
                let accepted = {
                    let mut inner = self.inner.lock();
                    let current = inner.generation == generation
                        && matches!(inner.status, SocketStatus::Opening | SocketStatus::Open);
                    if current {
                        inner.connection = Some(connection.clone());
                    }
                    current
                };

                if accepted {
                    self.flush();
                } else {
                    connection.close();
                }
            }
            Err(e) => {
                warn!("[{}] Unable to connect: {}", self.url, e);
                let current = {
                    let mut inner = self.inner.lock();
                    let current = inner.generation == generation;
                    if current {
                        inner.status = SocketStatus::Invalid;
                    }
                    current
                };
                if current {
                    self.events.emit(&SocketEvent::Status(SocketStatus::Invalid));
                }
            }
        }

        Ok(())
    }

    pub fn attempt_to_open(&self) {
        if self.inner.lock().connection.is_some() {
            return;
        }
        if let Err(e) = self.open() {
            debug!("[{}] {}", self.url, e);
        }
    }

    pub fn close(&self) {
        let (connection, changed) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            let changed = inner.status != SocketStatus::Closed;
            inner.status = SocketStatus::Closed;
            (inner.connection.take(), changed)
        };

        if let Some(connection) = connection {
            connection.close();
        }

        if changed {
            info!("[{}] Connection closed", self.url);
            self.events.emit(&SocketEvent::Status(SocketStatus::Closed));
        }
    }

    /// Closes the connection and releases everything attached to the socket.
    /// Later sends are ignored.
    pub fn cleanup(&self) {
        self.close();
        {
            let mut inner = self.inner.lock();
            inner.queue.clear();
            inner.disposed = true;
        }
        self.events.clear();
        self.receive_gates.clear();
        self.auth.clear_listeners();
    }

    pub fn send(&self, message: ClientMessage) {
        {
            let mut inner = self.inner.lock();
            if inner.disposed {
                debug!("[{}] Ignoring send on a disposed socket", self.url);
                return;
            }
            inner.queue.push_back(message.clone());
        }

        self.events.emit(&SocketEvent::Enqueue(message));
        self.flush();
    }

    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
        self.flush();
    }

    /// Removes the most recently queued copy of `message`. Returns whether a
    /// copy was still waiting for transmission.
    pub fn remove_queued(&self, message: &ClientMessage) -> bool {
        let mut inner = self.inner.lock();
        match inner.queue.iter().rposition(|queued| queued == message) {
            Some(index) => {
                inner.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Takes `message` back: a queued copy is removed and policies are told
    /// to forget theirs. Returns whether a queued copy was found.
    pub fn withdraw(&self, message: &ClientMessage) -> bool {
        let removed = self.remove_queued(message);
        self.events.emit(&SocketEvent::Withdraw(message.clone()));
        removed
    }

    fn flush(&self) {
        loop {
            let (connection, message) = {
                let mut inner = self.inner.lock();
                if inner.paused {
                    return;
                }
                let Some(connection) = inner.connection.clone() else {
                    return;
                };
                let Some(message) = inner.queue.pop_front() else {
                    return;
                };
                (connection, message)
            };

            match message.to_json() {
                Ok(json) => {
                    debug!("[{}] Sending {}", self.url, json);
                    connection.send(json);
                    metrics::frames_sent().increment(1);
                    self.events.emit(&SocketEvent::Send(message));
                }
                Err(e) => {
                    warn!("[{}] Failed to encode outbound message: {}", self.url, e);
                    self.events.emit(&SocketEvent::Error(e.to_string()));
                }
            }
        }
    }

    pub(crate) fn handle_transport(&self, generation: u64, event: TransportEvent) {
        if self.inner.lock().generation != generation {
            debug!("[{}] Ignoring event from a stale connection", self.url);
            return;
        }

        match event {
            TransportEvent::Open => {
                let opened = {
                    let mut inner = self.inner.lock();
                    let opened = inner.status == SocketStatus::Opening;
                    if opened {
                        inner.status = SocketStatus::Open;
                    }
                    opened
                };
                if opened {
                    info!("[{}] Connection open", self.url);
                    self.events.emit(&SocketEvent::Status(SocketStatus::Open));
                }
            }
            TransportEvent::Message(text) => self.receive(&text),
            TransportEvent::Error(reason) => {
                let connection = {
                    let mut inner = self.inner.lock();
                    inner.status = SocketStatus::Error;
                    inner.connection.take()
                };
                if let Some(connection) = connection {
                    connection.close();
                }
                warn!("[{}] Connection error: {}", self.url, reason);
                self.events.emit(&SocketEvent::Status(SocketStatus::Error));
            }
            TransportEvent::Close => {
                let changed = {
                    let mut inner = self.inner.lock();
                    inner.connection = None;
                    let changed = inner.status != SocketStatus::Closed;
                    inner.status = SocketStatus::Closed;
                    changed
                };
                if changed {
                    info!("[{}] Connection closed by transport", self.url);
                    self.events.emit(&SocketEvent::Status(SocketStatus::Closed));
                }
            }
        }
    }

    fn receive(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("[{}] {}: {}", self.url, e, text);
                metrics::protocol_errors().increment(1);
                self.events.emit(&SocketEvent::Error(e.to_string()));
                return;
            }
        };

        metrics::frames_received().increment(1);

        for gate in self.receive_gates.snapshot() {
            if !gate(&message) {
                debug!("[{}] Receive intercepted: {}", self.url, text);
                return;
            }
        }

        self.events.emit(&SocketEvent::Receive(message));
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(connection) = self.inner.get_mut().connection.take() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{signed_event, MockTransport};
    use nostr::{Filter, Keys, SubscriptionId};
    use pretty_assertions::assert_eq;

    fn record(socket: &Socket) -> (Arc<Mutex<Vec<SocketEvent>>>, Unsubscriber) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handle = socket.on(move |event| sink.lock().push(event.clone()));
        (events, handle)
    }

    fn statuses(events: &Mutex<Vec<SocketEvent>>) -> Vec<SocketStatus> {
        events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SocketEvent::Status(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_open_transitions_through_opening_to_open() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        let (events, _handle) = record(&socket);

        socket.open().unwrap();
        assert_eq!(socket.status(), SocketStatus::Opening);

        transport.connection("wss://relay.test").unwrap().open();
        assert_eq!(socket.status(), SocketStatus::Open);
        assert_eq!(
            statuses(&events),
            vec![SocketStatus::Opening, SocketStatus::Open]
        );
    }

    #[test]
    fn test_open_twice_is_an_error() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());

        socket.open().unwrap();
        let err = socket.open().unwrap_err();

        assert!(matches!(err, Error::AlreadyOpen { .. }));
        assert_eq!(transport.connection_count(), 1);
    }

    #[test]
    fn test_refused_connection_becomes_invalid() {
        let transport = MockTransport::new();
        transport.refuse("not a url");
        let socket = Socket::new("not a url", transport.clone());
        let (events, _handle) = record(&socket);

        socket.open().unwrap();

        assert_eq!(socket.status(), SocketStatus::Invalid);
        assert_eq!(
            statuses(&events),
            vec![SocketStatus::Opening, SocketStatus::Invalid]
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        socket.open().unwrap();
        let (events, _handle) = record(&socket);

        socket.close();
        socket.close();

        assert_eq!(statuses(&events), vec![SocketStatus::Closed]);
        assert!(transport.connection("wss://relay.test").unwrap().is_closed());
    }

    #[test]
    fn test_paused_queue_holds_messages_in_order() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        socket.open().unwrap();
        socket.pause();

        let first = ClientMessage::Close(SubscriptionId::new("a"));
        let second = ClientMessage::Close(SubscriptionId::new("b"));
        socket.send(first.clone());
        socket.send(second.clone());

        let connection = transport.connection("wss://relay.test").unwrap();
        assert!(connection.sent().is_empty());
        assert_eq!(socket.queued(), vec![first.clone(), second.clone()]);

        socket.resume();
        assert_eq!(connection.sent(), vec![first, second]);
        assert!(socket.queued().is_empty());
    }

    #[test]
    fn test_remove_queued_pulls_pending_message() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport);
        let req = ClientMessage::req(SubscriptionId::new("a"), vec![Filter::new()]);

        socket.send(req.clone());
        assert!(socket.remove_queued(&req));
        assert!(!socket.remove_queued(&req));
        assert!(socket.queued().is_empty());
    }

    #[test]
    fn test_withdraw_tells_listeners_even_when_not_queued() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport);
        let req = ClientMessage::req(SubscriptionId::new("a"), vec![Filter::new()]);
        socket.send(req.clone());
        let (events, _handle) = record(&socket);

        assert!(socket.withdraw(&req));
        assert!(!socket.withdraw(&req));

        assert!(socket.queued().is_empty());
        assert_eq!(
            *events.lock(),
            vec![
                SocketEvent::Withdraw(req.clone()),
                SocketEvent::Withdraw(req)
            ]
        );
    }

    #[test]
    fn test_malformed_frame_emits_error_and_is_dropped() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        socket.open().unwrap();
        let connection = transport.connection("wss://relay.test").unwrap();
        connection.open();
        let (events, _handle) = record(&socket);

        connection.receive_text("garbage");
        connection.receive_text(r#"["EOSE","sub"]"#);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SocketEvent::Error(_)));
        assert_eq!(
            events[1],
            SocketEvent::Receive(RelayMessage::Eose(SubscriptionId::new("sub")))
        );
    }

    #[test]
    fn test_transport_error_releases_connection() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        socket.open().unwrap();
        let connection = transport.connection("wss://relay.test").unwrap();
        connection.open();
        let (events, _handle) = record(&socket);

        connection.fail("reset by peer");
        assert_eq!(socket.status(), SocketStatus::Error);

        connection.drop_connection();
        assert_eq!(socket.status(), SocketStatus::Closed);
        assert_eq!(
            statuses(&events),
            vec![SocketStatus::Error, SocketStatus::Closed]
        );

        socket.open().unwrap();
        assert_eq!(transport.connection_count(), 2);
    }

    #[test]
    fn test_events_from_stale_connection_are_ignored() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        socket.open().unwrap();
        let stale = transport.connection("wss://relay.test").unwrap();
        socket.close();
        socket.open().unwrap();

        stale.open();
        assert_eq!(socket.status(), SocketStatus::Opening);
    }

    #[test]
    fn test_receive_gate_can_swallow_messages() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        socket.open().unwrap();
        let connection = transport.connection("wss://relay.test").unwrap();
        connection.open();
        let (events, _handle) = record(&socket);

        let _gate = socket.intercept_receive(|message| !matches!(message, RelayMessage::Eose(_)));
        connection.receive_text(r#"["EOSE","sub"]"#);
        connection.receive_text(r#"["AUTH","c"]"#);

        assert_eq!(
            *events.lock(),
            vec![SocketEvent::Receive(RelayMessage::Auth {
                challenge: "c".to_string()
            })]
        );
    }

    #[test]
    fn test_cleanup_ignores_later_sends() {
        let transport = MockTransport::new();
        let socket = Socket::new("wss://relay.test", transport.clone());
        socket.open().unwrap();
        let (events, _handle) = record(&socket);

        socket.cleanup();
        let keys = Keys::generate();
        socket.send(ClientMessage::event(signed_event(&keys, 1, "late")));

        assert!(socket.is_disposed());
        assert!(socket.queued().is_empty());
        assert_eq!(statuses(&events), vec![SocketStatus::Closed]);
    }
}
