//! NIP-42 authentication: the per-socket challenge/response state and the
//! manager that signs responses.

use crate::emitter::{Emitter, Unsubscriber};
use crate::error::{Error, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::socket::{Socket, SocketEvent, SocketStatus};
use async_trait::async_trait;
use nostr::{Event, EventBuilder, EventId, Keys, Kind, Tag, TagKind, TagStandard};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AuthStatus {
    None,
    Requested,
    PendingSignature,
    DeniedSignature,
    PendingResponse,
    Forbidden,
    Ok,
}

impl AuthStatus {
    /// Statuses in which outbound traffic flows normally.
    pub fn is_settled(self) -> bool {
        matches!(self, AuthStatus::None | AuthStatus::Ok)
    }

    /// Statuses after which waiting for the relay is pointless.
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            AuthStatus::None | AuthStatus::DeniedSignature | AuthStatus::Forbidden | AuthStatus::Ok
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthInner {
    status: AuthStatus,
    challenge: Option<String>,
    request: Option<EventId>,
    details: Option<String>,
}

impl Default for AuthInner {
    fn default() -> Self {
        Self {
            status: AuthStatus::None,
            challenge: None,
            request: None,
            details: None,
        }
    }
}

/// Authentication state of one relay connection. Owned by the socket and
/// shared with policies and the [`AuthManager`].
#[derive(Clone)]
pub struct AuthState {
    inner: Arc<Mutex<AuthInner>>,
    events: Arc<Emitter<AuthStatus>>,
}

impl AuthState {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuthInner::default())),
            events: Arc::new(Emitter::new()),
        }
    }

    pub fn status(&self) -> AuthStatus {
        self.inner.lock().status
    }

    pub fn challenge(&self) -> Option<String> {
        self.inner.lock().challenge.clone()
    }

    pub fn request(&self) -> Option<EventId> {
        self.inner.lock().request
    }

    pub fn details(&self) -> Option<String> {
        self.inner.lock().details.clone()
    }

    /// Called with the new status on every transition.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&AuthStatus) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    pub(crate) fn clear_listeners(&self) {
        self.events.clear();
    }

    fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut AuthInner),
    {
        let status = {
            let mut inner = self.inner.lock();
            apply(&mut inner);
            inner.status
        };
        self.events.emit(&status);
    }

    pub(crate) fn observe(&self, event: &SocketEvent) {
        match event {
            SocketEvent::Receive(RelayMessage::Auth { challenge }) => {
                debug!("Received auth challenge {}", challenge);
                let challenge = challenge.clone();
                self.update(|inner| {
                    *inner = AuthInner {
                        status: AuthStatus::Requested,
                        challenge: Some(challenge),
                        request: None,
                        details: None,
                    }
                });
            }
            SocketEvent::Receive(RelayMessage::Ok {
                event_id,
                status,
                message,
            }) => {
                if self.request() != Some(*event_id) {
                    return;
                }
                let status = if *status {
                    AuthStatus::Ok
                } else {
                    AuthStatus::Forbidden
                };
                let details = message.clone();
                self.update(|inner| {
                    inner.status = status;
                    inner.details = Some(details);
                });
            }
            SocketEvent::Status(SocketStatus::Closed) => {
                if *self.inner.lock() == AuthInner::default() {
                    return;
                }
                self.update(|inner| *inner = AuthInner::default());
            }
            _ => {}
        }
    }
}

/// Produces signed events from templates. Returning `None` means the signer
/// declined.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, template: EventBuilder) -> Option<Event>;
}

#[async_trait]
impl Signer for Keys {
    async fn sign(&self, template: EventBuilder) -> Option<Event> {
        match template.sign_with_keys(self) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Failed to sign event: {}", e);
                None
            }
        }
    }
}

/// Kind 22242 template binding a challenge to a relay url.
pub fn make_auth_event(url: &str, challenge: &str) -> EventBuilder {
    EventBuilder::new(Kind::Authentication, "")
        .tag(Tag::custom(TagKind::Relay, [url]))
        .tag(Tag::from_standardized(TagStandard::Challenge(
            challenge.to_string(),
        )))
}

/// Drives the signing transitions of one socket's [`AuthState`].
pub struct AuthManager {
    socket: Arc<Socket>,
    signer: Arc<dyn Signer>,
    eager: Mutex<Option<Unsubscriber>>,
}

impl AuthManager {
    /// With `eager`, every challenge is answered as soon as it arrives.
    /// Eager responses are spawned on the current tokio runtime.
    pub fn new(socket: Arc<Socket>, signer: Arc<dyn Signer>, eager: bool) -> Arc<Self> {
        let manager = Arc::new(Self {
            socket,
            signer,
            eager: Mutex::new(None),
        });

        if eager {
            let weak: Weak<AuthManager> = Arc::downgrade(&manager);
            let handle = manager.socket.auth().subscribe(move |status| {
                if *status != AuthStatus::Requested {
                    return;
                }
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = manager.respond().await {
                                debug!("[{}] Eager auth skipped: {}", manager.socket.url(), e);
                            }
                        });
                    }
                    Err(_) => warn!(
                        "[{}] No runtime available to answer the auth challenge",
                        manager.socket.url()
                    ),
                }
            });
            *manager.eager.lock() = Some(handle);
        }

        manager
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn status(&self) -> AuthStatus {
        self.socket.auth().status()
    }

    pub async fn respond(&self) -> Result<()> {
        let auth = self.socket.auth();
        let challenge = {
            let mut inner = auth.inner.lock();
            let Some(challenge) = inner.challenge.clone() else {
                return Err(Error::no_challenge());
            };
            if inner.status != AuthStatus::Requested {
                return Err(Error::auth_in_progress(inner.status));
            }
            inner.status = AuthStatus::PendingSignature;
            challenge
        };
        auth.events.emit(&AuthStatus::PendingSignature);

        let template = make_auth_event(self.socket.url(), &challenge);
        let signed = self.signer.sign(template).await;

        let still_pending = {
            let inner = auth.inner.lock();
            inner.status == AuthStatus::PendingSignature
                && inner.challenge.as_deref() == Some(challenge.as_str())
        };
        if !still_pending {
            debug!(
                "[{}] Auth state moved on while signing, dropping response",
                self.socket.url()
            );
            return Ok(());
        }

        match signed {
            None => {
                info!("[{}] Auth signature denied", self.socket.url());
                auth.update(|inner| inner.status = AuthStatus::DeniedSignature);
            }
            Some(event) => {
                let request = event.id;
                auth.update(|inner| {
                    inner.request = Some(request);
                    inner.status = AuthStatus::PendingResponse;
                });
                self.socket.send(ClientMessage::auth(event));
            }
        }

        Ok(())
    }

    pub async fn wait_for_challenge(&self, timeout: Duration) {
        let auth = self.socket.auth().clone();
        wait_for(move || auth.challenge().is_some(), timeout).await;
    }

    pub async fn wait_for_resolution(&self, timeout: Duration) {
        let auth = self.socket.auth().clone();
        wait_for(move || auth.status().is_resolved(), timeout).await;
    }

    /// Opens the socket if needed, waits up to half of `timeout` for a
    /// challenge, answers it, then waits up to the other half for the
    /// relay's verdict.
    pub async fn attempt(&self, timeout: Duration) -> AuthStatus {
        let half = timeout / 2;

        self.socket.attempt_to_open();
        self.wait_for_challenge(half).await;

        if self.status() == AuthStatus::Requested {
            if let Err(e) = self.respond().await {
                debug!("[{}] {}", self.socket.url(), e);
            }
        }

        self.wait_for_resolution(half).await;
        self.status()
    }

    pub fn cleanup(&self) {
        if let Some(handle) = self.eager.lock().take() {
            handle.unsubscribe();
        }
    }
}

async fn wait_for<F>(condition: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let interval = (timeout / 3).clamp(Duration::from_millis(1), MAX_POLL_INTERVAL);
    let deadline = Instant::now() + timeout;

    while !condition() && Instant::now() < deadline {
        tokio::time::sleep(interval).await;
    }
}
