//! Uniform send/receive surface over a remote socket or an in-process relay.

use crate::emitter::{Listener, Unsubscriber};
use crate::message::{ClientMessage, RelayMessage};
use crate::pool::{normalize_relay_url, Pool};
use crate::socket::{Socket, SocketEvent, SocketStatus};
use std::sync::Arc;

/// Address that routes to the in-process relay instead of the pool.
pub const LOCAL_RELAY_URL: &str = "local://relay";

/// An in-process relay, typically backed by the application's event store.
pub trait LocalRelay: Send + Sync {
    fn send(&self, message: ClientMessage);
    fn subscribe(&self, listener: Listener<RelayMessage>) -> Unsubscriber;
}

#[derive(Clone)]
pub enum Adapter {
    Remote(Arc<Socket>),
    Local(Arc<dyn LocalRelay>),
}

impl Adapter {
    pub fn url(&self) -> &str {
        match self {
            Adapter::Remote(socket) => socket.url(),
            Adapter::Local(_) => LOCAL_RELAY_URL,
        }
    }

    pub fn socket(&self) -> Option<&Arc<Socket>> {
        match self {
            Adapter::Remote(socket) => Some(socket),
            Adapter::Local(_) => None,
        }
    }

    pub fn send(&self, message: ClientMessage) {
        match self {
            Adapter::Remote(socket) => socket.send(message),
            Adapter::Local(relay) => relay.send(message),
        }
    }

    /// Called with each message the relay sends and the url it came from.
    pub fn on_receive<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&RelayMessage, &str) + Send + Sync + 'static,
    {
        match self {
            Adapter::Remote(socket) => {
                let url = socket.url().to_string();
                socket.on(move |event| {
                    if let SocketEvent::Receive(message) = event {
                        listener(message, &url);
                    }
                })
            }
            Adapter::Local(relay) => {
                relay.subscribe(Arc::new(move |message: &RelayMessage| {
                    listener(message, LOCAL_RELAY_URL)
                }))
            }
        }
    }

    /// Status changes of the underlying socket. The local relay never
    /// changes status.
    pub fn on_status<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(SocketStatus) + Send + Sync + 'static,
    {
        match self {
            Adapter::Remote(socket) => socket.on(move |event| {
                if let SocketEvent::Status(status) = event {
                    listener(*status);
                }
            }),
            Adapter::Local(_) => Unsubscriber::noop(),
        }
    }

    /// Whether a message sent now can still reach a live subscription.
    pub fn is_connected(&self) -> bool {
        match self {
            Adapter::Remote(socket) => {
                !socket.is_disposed()
                    && matches!(socket.status(), SocketStatus::Open | SocketStatus::Opening)
            }
            Adapter::Local(_) => true,
        }
    }

    /// Withdraws `message` from the socket queue and from any policy
    /// holding it back.
    pub fn withdraw(&self, message: &ClientMessage) -> bool {
        match self {
            Adapter::Remote(socket) => socket.withdraw(message),
            Adapter::Local(_) => false,
        }
    }
}

/// Where publish and request operations find their adapters.
#[derive(Clone)]
pub struct AdapterContext {
    pub pool: Arc<Pool>,
    pub local: Option<Arc<dyn LocalRelay>>,
}

impl AdapterContext {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool, local: None }
    }

    pub fn with_local(mut self, relay: Arc<dyn LocalRelay>) -> Self {
        self.local = Some(relay);
        self
    }

    pub fn get_adapter(&self, url: &str) -> Adapter {
        if url == LOCAL_RELAY_URL {
            if let Some(relay) = &self.local {
                return Adapter::Local(relay.clone());
            }
        }
        Adapter::Remote(self.pool.get(url))
    }

    /// Canonical form used to key results by relay.
    pub fn normalize(&self, url: &str) -> String {
        if url == LOCAL_RELAY_URL {
            url.to_string()
        } else {
            normalize_relay_url(url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Emitter;
    use crate::policy::default_policies;
    use crate::test_utils::MockTransport;
    use nostr::SubscriptionId;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct EchoRelay {
        received: Mutex<Vec<ClientMessage>>,
        outbound: Emitter<RelayMessage>,
    }

    impl LocalRelay for EchoRelay {
        fn send(&self, message: ClientMessage) {
            if let ClientMessage::Req {
                subscription_id, ..
            } = &message
            {
                self.outbound.emit(&RelayMessage::Eose(subscription_id.clone()));
            }
            self.received.lock().push(message);
        }

        fn subscribe(&self, listener: Listener<RelayMessage>) -> Unsubscriber {
            self.outbound.on(move |message| listener(message))
        }
    }

    #[test]
    fn test_local_url_routes_to_local_relay() {
        let transport = MockTransport::new();
        let pool = Arc::new(Pool::with_transport(transport, default_policies()));
        let relay = Arc::new(EchoRelay::default());
        let context = AdapterContext::new(pool.clone()).with_local(relay.clone());

        let adapter = context.get_adapter(LOCAL_RELAY_URL);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _handle = adapter.on_receive(move |message, url| {
            sink.lock().push((message.clone(), url.to_string()));
        });

        let id = SubscriptionId::new("sub");
        adapter.send(ClientMessage::req(id.clone(), vec![]));

        assert!(pool.is_empty());
        assert_eq!(adapter.url(), LOCAL_RELAY_URL);
        assert!(adapter.is_connected());
        assert_eq!(
            *seen.lock(),
            vec![(RelayMessage::Eose(id), LOCAL_RELAY_URL.to_string())]
        );
        assert_eq!(relay.received.lock().len(), 1);
    }

    #[test]
    fn test_remote_adapter_uses_pool() {
        let transport = MockTransport::new();
        let pool = Arc::new(Pool::with_transport(transport.clone(), default_policies()));
        let context = AdapterContext::new(pool.clone());

        let adapter = context.get_adapter("wss://relay.test/");
        adapter.send(ClientMessage::Close(SubscriptionId::new("sub")));

        assert_eq!(adapter.url(), "wss://relay.test");
        assert!(pool.has("wss://relay.test"));
        assert_eq!(adapter.socket().unwrap().status(), SocketStatus::Opening);
        assert_eq!(transport.connection_count(), 1);
    }
}
