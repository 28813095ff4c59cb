//! In-memory transport and event helpers for exercising sockets without a
//! network.

use crate::error::{Error, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::transport::{Connection, Transport, TransportSink};
use nostr::{Event, EventBuilder, Keys, Kind};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub fn signed_event(keys: &Keys, kind: u16, content: &str) -> Event {
    EventBuilder::new(Kind::from(kind), content)
        .sign_with_keys(keys)
        .expect("signing with local keys")
}

/// Transport whose connections are driven by hand from tests.
#[derive(Default)]
pub struct MockTransport {
    connections: Mutex<Vec<MockConnection>>,
    refused: Mutex<HashSet<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later connection attempt to `url` fail immediately.
    pub fn refuse(&self, url: &str) {
        self.refused.lock().insert(url.to_string());
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Latest connection created for `url`.
    pub fn connection(&self, url: &str) -> Option<MockConnection> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|connection| connection.url == url)
            .cloned()
    }

    pub fn connections(&self) -> Vec<MockConnection> {
        self.connections.lock().clone()
    }
}

impl Transport for MockTransport {
    fn connect(&self, url: &str, sink: TransportSink) -> Result<Arc<dyn Connection>> {
        if self.refused.lock().contains(url) {
            return Err(Error::invalid_relay_url(url, "refused by mock transport"));
        }

        let connection = MockConnection {
            url: url.to_string(),
            sink,
            frames: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.connections.lock().push(connection.clone());
        Ok(Arc::new(connection))
    }
}

/// Both ends of a fake connection: what the socket wrote, and hooks to play
/// the relay's part.
#[derive(Clone)]
pub struct MockConnection {
    pub url: String,
    sink: TransportSink,
    frames: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn open(&self) {
        self.sink.opened();
    }

    pub fn receive(&self, message: RelayMessage) {
        let json = message.to_json().expect("encoding relay message");
        self.sink.message(json);
    }

    pub fn receive_text(&self, text: &str) {
        self.sink.message(text.to_string());
    }

    pub fn fail(&self, reason: &str) {
        self.sink.error(reason);
    }

    /// Simulates the relay going away.
    pub fn drop_connection(&self) {
        self.sink.closed();
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.frames
            .lock()
            .iter()
            .map(|frame| ClientMessage::from_json(frame).expect("decoding client frame"))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn send(&self, text: String) {
        self.frames.lock().push(text);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
