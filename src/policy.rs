//! Behaviours attached to a socket when it is created. A policy observes the
//! socket's events and steers its queue; applying one returns the handle
//! that detaches it.

use crate::auth::{AuthManager, AuthStatus, Signer};
use crate::emitter::Unsubscriber;
use crate::message::{is_join_request, ClientMessage, RelayMessage};
use crate::metrics;
use crate::pool::normalize_relay_url;
use crate::socket::{Socket, SocketEvent, SocketStatus};
use nostr::SubscriptionId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_ERROR_COOLDOWN: Duration = Duration::from_secs(30);
pub const DEFAULT_AUTH_RETRY_ATTEMPTS: u32 = 1;

pub trait SocketPolicy: Send + Sync {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber;
}

impl<F> SocketPolicy for F
where
    F: Fn(&Arc<Socket>) -> Unsubscriber + Send + Sync,
{
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        self(socket)
    }
}

pub fn apply_policies(socket: &Arc<Socket>, policies: &[Arc<dyn SocketPolicy>]) -> Unsubscriber {
    Unsubscriber::all(policies.iter().map(|policy| policy.apply(socket)).collect())
}

/// The policy stack every pooled socket gets unless configured otherwise.
pub fn default_policies() -> Vec<Arc<dyn SocketPolicy>> {
    vec![
        Arc::new(SendWhenOpen),
        Arc::new(DeferOnAuth),
        Arc::new(RetryAuthRequired::new(DEFAULT_AUTH_RETRY_ATTEMPTS)),
        Arc::new(ConnectOnSend::new(DEFAULT_ERROR_COOLDOWN)),
        Arc::new(CloseInactive::new(DEFAULT_IDLE_TIMEOUT)),
    ]
}

/// Keeps the queue paused unless the socket is open.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendWhenOpen;

impl SocketPolicy for SendWhenOpen {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        if socket.status() != SocketStatus::Open {
            socket.pause();
        }

        let weak = Arc::downgrade(socket);
        socket.on(move |event| {
            let SocketEvent::Status(status) = event else {
                return;
            };
            let Some(socket) = weak.upgrade() else {
                return;
            };
            if *status == SocketStatus::Open {
                socket.resume();
            } else {
                socket.pause();
            }
        })
    }
}

/// Holds traffic back while authentication is unresolved and replays it in
/// order once the socket is unauthenticated or authenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferOnAuth;

impl SocketPolicy for DeferOnAuth {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        let buffer: Arc<Mutex<Vec<ClientMessage>>> = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(socket);
        let deferred = buffer.clone();
        let on_enqueue = socket.on(move |event| {
            let message = match event {
                SocketEvent::Enqueue(message) => message,
                SocketEvent::Withdraw(message) => {
                    deferred.lock().retain(|pending| pending != message);
                    return;
                }
                _ => return,
            };
            let Some(socket) = weak.upgrade() else {
                return;
            };
            if socket.auth().status().is_settled() || message.bypasses_auth() {
                return;
            }

            if let ClientMessage::Close(id) = message {
                let cancelled = {
                    let mut deferred = deferred.lock();
                    let position = deferred.iter().position(|pending| {
                        matches!(pending, ClientMessage::Req { subscription_id, .. } if subscription_id == id)
                    });
                    position.map(|index| deferred.remove(index)).is_some()
                };
                if cancelled {
                    debug!("[{}] Dropping deferred request {}", socket.url(), id);
                    socket.remove_queued(message);
                    return;
                }
            }

            if socket.remove_queued(message) {
                debug!("[{}] Deferring message until auth settles", socket.url());
                deferred.lock().push(message.clone());
            }
        });

        let weak = Arc::downgrade(socket);
        let on_auth = socket.auth().subscribe(move |status| {
            if !status.is_settled() {
                return;
            }
            let Some(socket) = weak.upgrade() else {
                return;
            };
            let pending = std::mem::take(&mut *buffer.lock());
            if !pending.is_empty() {
                debug!(
                    "[{}] Auth is {}, sending {} deferred messages",
                    socket.url(),
                    status,
                    pending.len()
                );
            }
            for message in pending {
                socket.send(message);
            }
        });

        Unsubscriber::all(vec![on_enqueue, on_auth])
    }
}

/// Resends events and requests the relay rejected with `auth-required:`,
/// a bounded number of times. The rejection is swallowed while a retry is
/// pending so that publishers and requests only see the final answer.
#[derive(Debug, Clone, Copy)]
pub struct RetryAuthRequired {
    attempts: u32,
}

impl RetryAuthRequired {
    pub fn new(attempts: u32) -> Self {
        Self { attempts }
    }
}

impl Default for RetryAuthRequired {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_RETRY_ATTEMPTS)
    }
}

fn retry_key(message: &ClientMessage) -> Option<String> {
    match message {
        ClientMessage::Event(event) if !is_join_request(event) => Some(event.id.to_hex()),
        ClientMessage::Req {
            subscription_id, ..
        } => Some(subscription_id.to_string()),
        _ => None,
    }
}

fn response_key(message: &RelayMessage) -> Option<String> {
    match message {
        RelayMessage::Ok { event_id, .. } => Some(event_id.to_hex()),
        RelayMessage::Closed {
            subscription_id, ..
        }
        | RelayMessage::Eose(subscription_id) => Some(subscription_id.to_string()),
        _ => None,
    }
}

impl SocketPolicy for RetryAuthRequired {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        let attempts = self.attempts;
        let table: Arc<Mutex<HashMap<String, (ClientMessage, u32)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let remembered = table.clone();
        let on_traffic = socket.on(move |event| match event {
            SocketEvent::Send(message) => {
                if let Some(key) = retry_key(message) {
                    remembered
                        .lock()
                        .entry(key)
                        .or_insert_with(|| (message.clone(), attempts));
                }
            }
            SocketEvent::Enqueue(ClientMessage::Close(id)) => {
                remembered.lock().remove(&id.to_string());
            }
            SocketEvent::Withdraw(message) => {
                if let Some(key) = retry_key(message) {
                    remembered.lock().remove(&key);
                }
            }
            _ => {}
        });

        let weak = Arc::downgrade(socket);
        let on_receive = socket.intercept_receive(move |message| {
            let Some(key) = response_key(message) else {
                return true;
            };

            if !message.is_auth_required() {
                table.lock().remove(&key);
                return true;
            }

            let retry = {
                let mut table = table.lock();
                match table.get_mut(&key) {
                    Some((pending, remaining)) if *remaining > 0 => {
                        *remaining -= 1;
                        Some(pending.clone())
                    }
                    _ => {
                        table.remove(&key);
                        None
                    }
                }
            };

            let (Some(pending), Some(socket)) = (retry, weak.upgrade()) else {
                return true;
            };

            info!("[{}] Retrying {} after auth-required", socket.url(), key);
            metrics::auth_retries().increment(1);
            socket.send(pending);
            false
        });

        Unsubscriber::all(vec![on_traffic, on_receive])
    }
}

/// Opens a closed socket when something is enqueued, unless the last
/// connection failed less than `cooldown` ago.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOnSend {
    cooldown: Duration,
}

impl ConnectOnSend {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }
}

impl Default for ConnectOnSend {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_COOLDOWN)
    }
}

impl SocketPolicy for ConnectOnSend {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        let cooldown = self.cooldown;
        let last_error: Mutex<Option<Instant>> = Mutex::new(None);

        let weak = Arc::downgrade(socket);
        socket.on(move |event| match event {
            SocketEvent::Status(SocketStatus::Error) => {
                *last_error.lock() = Some(Instant::now());
            }
            SocketEvent::Enqueue(_) => {
                let Some(socket) = weak.upgrade() else {
                    return;
                };
                if socket.status() != SocketStatus::Closed {
                    return;
                }
                let cooling_down = last_error
                    .lock()
                    .is_some_and(|at| at.elapsed() < cooldown);
                if cooling_down {
                    debug!("[{}] Not reconnecting, last error was recent", socket.url());
                    return;
                }
                socket.attempt_to_open();
            }
            _ => {}
        })
    }
}

/// Caps the number of outstanding subscriptions on one socket. Requests over
/// the cap wait, in order, for an earlier subscription to end.
#[derive(Debug, Clone, Copy)]
pub struct LimitRequests {
    max: usize,
}

impl LimitRequests {
    pub fn new(max: usize) -> Self {
        Self { max: max.max(1) }
    }
}

#[derive(Default)]
struct RequestSlots {
    in_flight: HashSet<SubscriptionId>,
    held: VecDeque<ClientMessage>,
}

impl RequestSlots {
    fn release(&mut self, id: Option<&SubscriptionId>, max: usize) -> Vec<ClientMessage> {
        if let Some(id) = id {
            self.in_flight.remove(id);
        }

        let mut ready = Vec::new();
        while self.in_flight.len() < max {
            let Some(message) = self.held.pop_front() else {
                break;
            };
            if let Some(id) = message.subscription_id() {
                self.in_flight.insert(id.clone());
            }
            ready.push(message);
        }
        ready
    }
}

impl SocketPolicy for LimitRequests {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        let max = self.max;
        let slots: Mutex<RequestSlots> = Mutex::new(RequestSlots::default());

        let weak = Arc::downgrade(socket);
        socket.on(move |event| {
            let Some(socket) = weak.upgrade() else {
                return;
            };

            let ready = match event {
                SocketEvent::Enqueue(message @ ClientMessage::Req { subscription_id, .. }) => {
                    let hold = {
                        let mut slots = slots.lock();
                        if slots.in_flight.contains(subscription_id) {
                            false
                        } else if slots.in_flight.len() < max {
                            slots.in_flight.insert(subscription_id.clone());
                            false
                        } else {
                            true
                        }
                    };
                    if hold && socket.remove_queued(message) {
                        debug!("[{}] Holding request {}", socket.url(), subscription_id);
                        slots.lock().held.push_back(message.clone());
                    }
                    return;
                }
                SocketEvent::Enqueue(message @ ClientMessage::Close(id)) => {
                    let mut slots = slots.lock();
                    let position = slots.held.iter().position(|held| {
                        held.subscription_id() == Some(id)
                    });
                    if let Some(index) = position {
                        slots.held.remove(index);
                        drop(slots);
                        socket.remove_queued(message);
                        return;
                    }
                    slots.release(Some(id), max)
                }
                SocketEvent::Withdraw(ClientMessage::Req {
                    subscription_id, ..
                }) => {
                    let mut slots = slots.lock();
                    let before = slots.held.len();
                    slots
                        .held
                        .retain(|held| held.subscription_id() != Some(subscription_id));
                    if slots.held.len() != before {
                        return;
                    }
                    slots.release(Some(subscription_id), max)
                }
                SocketEvent::Receive(RelayMessage::Closed {
                    subscription_id, ..
                }) => slots.lock().release(Some(subscription_id), max),
                SocketEvent::Status(SocketStatus::Closed) => {
                    let mut slots = slots.lock();
                    slots.in_flight.clear();
                    slots.release(None, max)
                }
                _ => return,
            };

            for message in ready {
                socket.send(message);
            }
        })
    }
}

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(3);
const REPLAY_DELAY: Duration = Duration::from_secs(5);

fn unanswered_key(message: &ClientMessage) -> Option<String> {
    match message {
        ClientMessage::Event(event) => Some(event.id.to_hex()),
        ClientMessage::Req {
            subscription_id, ..
        } => Some(subscription_id.to_string()),
        _ => None,
    }
}

struct Activity {
    /// Events and requests sent but not yet answered, in send order.
    unanswered: Vec<(String, ClientMessage)>,
    last_open: Instant,
    last_activity: Instant,
    replay_scheduled: bool,
}

impl Activity {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            unanswered: Vec::new(),
            last_open: now,
            last_activity: now,
            replay_scheduled: false,
        }
    }

    fn remember(&mut self, key: String, message: &ClientMessage) {
        self.forget(&key);
        self.unanswered.push((key, message.clone()));
    }

    fn forget(&mut self, key: &str) {
        self.unanswered.retain(|(pending, _)| pending != key);
    }
}

/// Closes sockets that sat idle for `idle_timeout` with nothing awaiting an
/// answer, and resends unanswered events and requests after the connection
/// drops.
#[derive(Debug, Clone, Copy)]
pub struct CloseInactive {
    idle_timeout: Duration,
}

impl CloseInactive {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }
}

impl Default for CloseInactive {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

fn schedule_replay(weak: Weak<Socket>, activity: Arc<Mutex<Activity>>, delay: Duration) {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            debug!("No runtime available, unanswered messages will not be resent");
            activity.lock().replay_scheduled = false;
            return;
        }
    };

    runtime.spawn(async move {
        tokio::time::sleep(delay).await;
        let pending: Vec<ClientMessage> = {
            let mut activity = activity.lock();
            activity.replay_scheduled = false;
            activity
                .unanswered
                .iter()
                .map(|(_, message)| message.clone())
                .collect()
        };
        let Some(socket) = weak.upgrade() else {
            return;
        };
        if pending.is_empty() || socket.is_disposed() {
            return;
        }

        let queued = socket.queued();
        let pending: Vec<ClientMessage> = pending
            .into_iter()
            .filter(|message| !queued.contains(message))
            .collect();
        if !pending.is_empty() {
            info!(
                "[{}] Resending {} unanswered messages",
                socket.url(),
                pending.len()
            );
        }
        for message in pending {
            socket.send(message);
        }
    });
}

impl SocketPolicy for CloseInactive {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        let idle_timeout = self.idle_timeout;
        let activity = Arc::new(Mutex::new(Activity::new()));

        let weak = Arc::downgrade(socket);
        let tracked = activity.clone();
        let on_event = socket.on(move |event| match event {
            SocketEvent::Status(SocketStatus::Open) => {
                let mut activity = tracked.lock();
                activity.last_open = Instant::now();
                activity.last_activity = Instant::now();
            }
            SocketEvent::Status(SocketStatus::Closed | SocketStatus::Error) => {
                let delay = {
                    let mut activity = tracked.lock();
                    if activity.unanswered.is_empty() || activity.replay_scheduled {
                        return;
                    }
                    activity.replay_scheduled = true;
                    REPLAY_DELAY.saturating_sub(activity.last_open.elapsed())
                };
                schedule_replay(weak.clone(), tracked.clone(), delay);
            }
            SocketEvent::Send(message) => {
                let mut activity = tracked.lock();
                activity.last_activity = Instant::now();
                match message {
                    ClientMessage::Close(id) => activity.forget(&id.to_string()),
                    message => {
                        if let Some(key) = unanswered_key(message) {
                            activity.remember(key, message);
                        }
                    }
                }
            }
            SocketEvent::Receive(message) => {
                let mut activity = tracked.lock();
                activity.last_activity = Instant::now();
                match message {
                    RelayMessage::Ok { event_id, .. } => activity.forget(&event_id.to_hex()),
                    RelayMessage::Closed {
                        subscription_id, ..
                    } => activity.forget(&subscription_id.to_string()),
                    _ => {}
                }
            }
            SocketEvent::Withdraw(message) => {
                if let Some(key) = unanswered_key(message) {
                    tracked.lock().forget(&key);
                }
            }
            _ => {}
        });

        let token = CancellationToken::new();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak = Arc::downgrade(socket);
                let token = token.clone();
                runtime.spawn(async move {
                    let start = Instant::now() + IDLE_CHECK_INTERVAL;
                    let mut interval = tokio::time::interval_at(start, IDLE_CHECK_INTERVAL);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = interval.tick() => {}
                        }
                        let Some(socket) = weak.upgrade() else {
                            break;
                        };
                        if socket.is_disposed() {
                            break;
                        }
                        let idle = {
                            let activity = activity.lock();
                            activity.unanswered.is_empty()
                                && activity.last_activity.elapsed() >= idle_timeout
                        };
                        if idle && socket.status() == SocketStatus::Open {
                            info!("[{}] Closing idle connection", socket.url());
                            socket.close();
                        }
                    }
                });
            }
            Err(_) => debug!(
                "[{}] No runtime available, idle connections stay open",
                socket.url()
            ),
        }

        Unsubscriber::all(vec![on_event, Unsubscriber::new(move || token.cancel())])
    }
}

pub type AuthFilter = Arc<dyn Fn(&Socket) -> bool + Send + Sync>;

/// Answers auth challenges with `signer` on the sockets `should_auth`
/// accepts. Other challenges are left for an [`AuthManager`] to handle.
#[derive(Clone)]
pub struct AuthPolicy {
    signer: Arc<dyn Signer>,
    should_auth: AuthFilter,
}

impl AuthPolicy {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self {
            signer,
            should_auth: Arc::new(|_: &Socket| true),
        }
    }

    pub fn with_filter<F>(mut self, should_auth: F) -> Self
    where
        F: Fn(&Socket) -> bool + Send + Sync + 'static,
    {
        self.should_auth = Arc::new(should_auth);
        self
    }

    /// Only authenticates against `relays`.
    pub fn for_relays(signer: Arc<dyn Signer>, relays: &[String]) -> Self {
        let relays: HashSet<String> = relays
            .iter()
            .map(|relay| normalize_relay_url(relay))
            .collect();
        Self::new(signer).with_filter(move |socket: &Socket| {
            relays.contains(&normalize_relay_url(socket.url()))
        })
    }
}

impl SocketPolicy for AuthPolicy {
    fn apply(&self, socket: &Arc<Socket>) -> Unsubscriber {
        let signer = self.signer.clone();
        let should_auth = self.should_auth.clone();

        let weak = Arc::downgrade(socket);
        socket.auth().subscribe(move |status| {
            if *status != AuthStatus::Requested {
                return;
            }
            let Some(socket) = weak.upgrade() else {
                return;
            };
            if !should_auth(socket.as_ref()) {
                debug!("[{}] Leaving auth challenge unanswered", socket.url());
                return;
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!(
                    "[{}] No runtime available to answer the auth challenge",
                    socket.url()
                );
                return;
            };

            let manager = AuthManager::new(socket, signer.clone(), false);
            runtime.spawn(async move {
                if let Err(e) = manager.respond().await {
                    debug!("[{}] Auth skipped: {}", manager.socket().url(), e);
                }
            });
        })
    }
}
