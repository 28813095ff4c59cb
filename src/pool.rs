//! One socket per relay url.

use crate::emitter::{Emitter, Unsubscriber};
use crate::metrics;
use crate::policy::{apply_policies, default_policies, SocketPolicy};
use crate::socket::Socket;
use crate::transport::{Transport, WebSocketTransport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nostr::RelayUrl;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub type SocketFactory = Arc<dyn Fn(&str) -> Arc<Socket> + Send + Sync>;

/// Canonical form of a relay url. Strings that do not parse as relay urls
/// are only trimmed, so the socket built for them can report `Invalid`.
pub fn normalize_relay_url(url: &str) -> String {
    let url = url.trim();
    match RelayUrl::parse(url) {
        Ok(relay_url) => relay_url.as_str().trim_end_matches('/').to_string(),
        Err(_) => url.to_string(),
    }
}

/// Builds a socket over `transport` with `policies` attached.
pub fn make_socket(
    url: &str,
    transport: Arc<dyn Transport>,
    policies: &[Arc<dyn SocketPolicy>],
) -> Arc<Socket> {
    let socket = Socket::new(url, transport);
    // Policies live as long as the socket; cleanup() clears their listeners.
    let _policies = apply_policies(&socket, policies);
    socket
}

pub struct Pool {
    sockets: DashMap<String, Arc<Socket>>,
    factory: SocketFactory,
    created: Emitter<Arc<Socket>>,
}

impl Pool {
    /// Pool of WebSocket connections with the default policies.
    pub fn new() -> Self {
        let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport::default());
        Self::with_transport(transport, default_policies())
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        policies: Vec<Arc<dyn SocketPolicy>>,
    ) -> Self {
        Self::with_factory(Arc::new(move |url: &str| {
            make_socket(url, transport.clone(), &policies)
        }))
    }

    pub fn with_factory(factory: SocketFactory) -> Self {
        Self {
            sockets: DashMap::new(),
            factory,
            created: Emitter::new(),
        }
    }

    pub fn has(&self, url: &str) -> bool {
        self.sockets.contains_key(&normalize_relay_url(url))
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn urls(&self) -> Vec<String> {
        self.sockets.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Returns the socket for `url`, creating it on first use.
    pub fn get(&self, url: &str) -> Arc<Socket> {
        let url = normalize_relay_url(url);

        let socket = match self.sockets.entry(url.clone()) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => {
                let socket = (self.factory)(&url);
                entry.insert(socket.clone());
                socket
            }
        };

        info!("[{}] Added socket to pool", url);
        metrics::pool_sockets().increment(1.0);
        self.created.emit(&socket);
        socket
    }

    /// Called with every socket created from now on.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        self.created.on(listener)
    }

    pub fn remove(&self, url: &str) {
        let url = normalize_relay_url(url);
        if let Some((_, socket)) = self.sockets.remove(&url) {
            debug!("[{}] Removing socket from pool", url);
            metrics::pool_sockets().decrement(1.0);
            socket.cleanup();
        }
    }

    pub fn clear(&self) {
        for url in self.urls() {
            self.remove(&url);
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("urls", &self.urls())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketStatus;
    use crate::test_utils::MockTransport;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool() -> (Pool, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let pool = Pool::with_transport(transport.clone(), default_policies());
        (pool, transport)
    }

    #[test]
    fn test_normalize_relay_url() {
        assert_eq!(normalize_relay_url(" wss://relay.test/ "), "wss://relay.test");
        assert_eq!(normalize_relay_url("wss://relay.test"), "wss://relay.test");
        assert_eq!(normalize_relay_url(" not a url "), "not a url");
    }

    #[test]
    fn test_get_returns_cached_socket_and_notifies_once() {
        let (pool, _transport) = pool();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let _handle = pool.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = pool.get("wss://relay.test/");
        let second = pool.get("wss://relay.test");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.urls(), vec!["wss://relay.test".to_string()]);
        assert!(pool.has("wss://relay.test/"));
    }

    #[test]
    fn test_remove_cleans_up_socket() {
        let (pool, transport) = pool();
        let socket = pool.get("wss://relay.test");
        socket.attempt_to_open();

        pool.remove("wss://relay.test");
        pool.remove("wss://unknown.test");

        assert!(pool.is_empty());
        assert!(socket.is_disposed());
        assert_eq!(socket.status(), SocketStatus::Closed);
        assert!(transport.connection("wss://relay.test").unwrap().is_closed());

        let replacement = pool.get("wss://relay.test");
        assert!(!Arc::ptr_eq(&socket, &replacement));
    }

    #[test]
    fn test_clear_removes_everything() {
        let (pool, _transport) = pool();
        pool.get("wss://a.test");
        pool.get("wss://b.test");

        pool.clear();

        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_custom_factory_is_used() {
        let transport = MockTransport::new();
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let pool = Pool::with_factory(Arc::new(move |url: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Socket::new(url, transport.clone())
        }));

        pool.get("wss://relay.test");
        pool.get("wss://relay.test");

        assert_eq!(built.load(Ordering::SeqCst), 1);
    }
}
