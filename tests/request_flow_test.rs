use nostr::{Event, Filter, Keys, Kind, SubscriptionId};
use nostr_net::config::Config;
use nostr_net::policy::default_policies;
use nostr_net::test_utils::{signed_event, MockConnection, MockTransport};
use nostr_net::{
    fetch, AdapterContext, AuthManager, AuthStatus, ClientMessage, Pool, RelayMessage,
    RequestEvent, RequestOptions, SocketStatus, Tracker, Unireq,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const RELAY_1: &str = "wss://relay1.test";
const RELAY_2: &str = "wss://relay2.test";

fn setup() -> (AdapterContext, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let pool = Arc::new(Pool::with_transport(transport.clone(), default_policies()));
    (AdapterContext::new(pool), transport)
}

fn record(unireq: &Unireq) -> Arc<Mutex<Vec<RequestEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let _handle = unireq.on(move |event| sink.lock().push(event.clone()));
    events
}

fn subscription_id(connection: &MockConnection) -> SubscriptionId {
    connection
        .sent()
        .into_iter()
        .find_map(|message| match message {
            ClientMessage::Req {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        })
        .unwrap()
}

fn deliver(connection: &MockConnection, id: &SubscriptionId, event: &Event) {
    connection.receive(RelayMessage::Event {
        subscription_id: id.clone(),
        event: Box::new(event.clone()),
    });
}

#[tokio::test]
async fn test_request_waits_for_auth_then_flows() {
    let (context, transport) = setup();
    let keys = Keys::generate();
    let socket = context.pool.get(RELAY_1);
    let manager = AuthManager::new(socket.clone(), Arc::new(keys.clone()), false);

    socket.attempt_to_open();
    let connection = transport.connection(RELAY_1).unwrap();
    connection.open();
    connection.receive(RelayMessage::Auth {
        challenge: "challenge-1".to_string(),
    });
    assert_eq!(manager.status(), AuthStatus::Requested);

    let filter = Filter::new().kind(Kind::TextNote);
    let unireq = Unireq::new(filter.clone(), RELAY_1, &context, RequestOptions::default());
    let events = record(&unireq);
    unireq.start();
    assert!(connection.sent().is_empty());

    manager.respond().await.unwrap();
    assert_eq!(manager.status(), AuthStatus::PendingResponse);
    assert_eq!(connection.sent().len(), 1);
    assert!(connection.sent()[0].is_auth());

    connection.receive(RelayMessage::Ok {
        event_id: socket.auth().request().unwrap(),
        status: true,
        message: String::new(),
    });
    assert_eq!(manager.status(), AuthStatus::Ok);
    assert_eq!(
        connection.sent()[1],
        ClientMessage::req(unireq.id().clone(), vec![filter])
    );

    let note = signed_event(&keys, 1, "after auth");
    deliver(&connection, unireq.id(), &note);
    connection.receive(RelayMessage::Eose(unireq.id().clone()));

    assert_eq!(
        *events.lock(),
        vec![RequestEvent::Event(Box::new(note)), RequestEvent::Eose]
    );
}

#[tokio::test]
async fn test_forbidden_auth_releases_deferred_request() {
    let (context, transport) = setup();
    let keys = Keys::generate();
    let socket = context.pool.get(RELAY_1);
    let manager = AuthManager::new(socket.clone(), Arc::new(keys), false);

    socket.attempt_to_open();
    let connection = transport.connection(RELAY_1).unwrap();
    connection.open();
    connection.receive(RelayMessage::Auth {
        challenge: "challenge-1".to_string(),
    });

    let unireq = Unireq::new(Filter::new(), RELAY_1, &context, RequestOptions::default());
    unireq.start();
    manager.respond().await.unwrap();

    connection.receive(RelayMessage::Ok {
        event_id: socket.auth().request().unwrap(),
        status: false,
        message: "restricted: not a member".to_string(),
    });

    assert_eq!(manager.status(), AuthStatus::Forbidden);
    assert_eq!(
        socket.auth().details(),
        Some("restricted: not a member".to_string())
    );
    // Forbidden is not settled, the request stays deferred.
    assert_eq!(connection.sent().len(), 1);

    // A dropped connection resets auth. The deferred request is replayed,
    // which reconnects the socket.
    connection.drop_connection();
    assert_eq!(manager.status(), AuthStatus::None);
    assert_eq!(socket.status(), SocketStatus::Opening);
    assert_eq!(transport.connection_count(), 2);

    let reconnected = transport.connection(RELAY_1).unwrap();
    reconnected.open();
    assert_eq!(subscription_id(&reconnected), unireq.id().clone());
}

#[tokio::test]
async fn test_fetch_merges_relays_through_shared_tracker() {
    let (context, transport) = setup();
    let keys = Keys::generate();
    let shared = signed_event(&keys, 1, "on both relays");
    let first = signed_event(&keys, 1, "only on relay 1");
    let second = signed_event(&keys, 1, "only on relay 2");
    let tracker = Arc::new(Tracker::new());

    let task = {
        let context = context.clone();
        let options = RequestOptions {
            tracker: Some(tracker.clone()),
            ..Default::default()
        };
        tokio::spawn(async move {
            fetch(
                Filter::new().kind(Kind::TextNote),
                &[RELAY_1.to_string(), RELAY_2.to_string()],
                &context,
                options,
            )
            .await
        })
    };

    while transport.connection_count() < 2 {
        tokio::task::yield_now().await;
    }

    let relay_1 = transport.connection(RELAY_1).unwrap();
    let relay_2 = transport.connection(RELAY_2).unwrap();
    relay_1.open();
    relay_2.open();

    let id_1 = subscription_id(&relay_1);
    let id_2 = subscription_id(&relay_2);
    deliver(&relay_1, &id_1, &shared);
    deliver(&relay_1, &id_1, &first);
    deliver(&relay_2, &id_2, &shared);
    deliver(&relay_2, &id_2, &second);
    relay_1.receive(RelayMessage::Eose(id_1.clone()));
    relay_2.receive(RelayMessage::Eose(id_2.clone()));

    let events = task.await.unwrap();
    let ids: HashSet<_> = events.iter().map(|event| event.id).collect();

    assert_eq!(events.len(), 3);
    assert_eq!(ids, HashSet::from([shared.id, first.id, second.id]));
    assert_eq!(
        tracker.get_relays(&shared.id),
        HashSet::from([RELAY_1.to_string(), RELAY_2.to_string()])
    );
    assert_eq!(relay_1.sent().last(), Some(&ClientMessage::Close(id_1)));
    assert_eq!(relay_2.sent().last(), Some(&ClientMessage::Close(id_2)));
}

#[tokio::test]
async fn test_configured_request_cap_holds_requests() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("settings.yml"),
        "net:\n  max_inflight_requests: 1\n",
    )
    .unwrap();
    let settings = Config::new(dir.path()).unwrap().get_settings().unwrap();

    let transport = MockTransport::new();
    let pool = Arc::new(Pool::with_transport(transport.clone(), settings.policies()));
    let context = AdapterContext::new(pool);

    let first = Unireq::new(Filter::new(), RELAY_1, &context, RequestOptions::default());
    let second = Unireq::new(Filter::new(), RELAY_1, &context, RequestOptions::default());
    first.start();
    second.start();

    let connection = transport.connection(RELAY_1).unwrap();
    connection.open();
    assert_eq!(
        connection.sent(),
        vec![ClientMessage::req(first.id().clone(), vec![Filter::new()])]
    );

    first.close();
    assert_eq!(
        connection.sent(),
        vec![
            ClientMessage::req(first.id().clone(), vec![Filter::new()]),
            ClientMessage::Close(first.id().clone()),
            ClientMessage::req(second.id().clone(), vec![Filter::new()]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_closed_request_is_not_replayed_after_reconnect() {
    let (context, transport) = setup();
    let socket = context.pool.get(RELAY_1);

    socket.attempt_to_open();
    let connection = transport.connection(RELAY_1).unwrap();
    connection.open();
    connection.receive(RelayMessage::Auth {
        challenge: "challenge-1".to_string(),
    });

    let options = RequestOptions {
        auto_close: true,
        ..Default::default()
    };
    let unireq = Unireq::new(Filter::new(), RELAY_1, &context, options);
    unireq.start();
    assert!(connection.sent().is_empty());

    // The request closes on disconnect while its REQ waits for auth.
    connection.fail("connection reset");
    connection.drop_connection();
    assert!(unireq.is_closed());
    assert!(socket.queued().is_empty());
    assert_eq!(socket.auth().status(), AuthStatus::None);
    assert_eq!(transport.connection_count(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let other = ClientMessage::Close(SubscriptionId::new("other"));
    socket.send(other.clone());
    assert_eq!(transport.connection_count(), 2);

    let reconnected = transport.connection(RELAY_1).unwrap();
    reconnected.open();
    assert_eq!(reconnected.sent(), vec![other]);
}

#[tokio::test(start_paused = true)]
async fn test_withdrawn_request_frees_capped_slot() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("settings.yml"),
        "net:\n  max_inflight_requests: 1\n",
    )
    .unwrap();
    let settings = Config::new(dir.path()).unwrap().get_settings().unwrap();

    let transport = MockTransport::new();
    let pool = Arc::new(Pool::with_transport(transport.clone(), settings.policies()));
    let context = AdapterContext::new(pool);
    let socket = context.pool.get(RELAY_1);
    socket.attempt_to_open();
    let refused = transport.connection(RELAY_1).unwrap();
    refused.fail("refused");
    refused.drop_connection();

    let first = Unireq::new(Filter::new(), RELAY_1, &context, RequestOptions::default());
    let second = Unireq::new(Filter::new(), RELAY_1, &context, RequestOptions::default());
    let third = Unireq::new(Filter::new(), RELAY_1, &context, RequestOptions::default());
    first.start();
    second.start();
    third.start();
    assert_eq!(transport.connection_count(), 1);

    // Closing while disconnected takes the requests back.
    second.close();
    first.close();
    assert_eq!(
        socket.queued(),
        vec![ClientMessage::req(third.id().clone(), vec![Filter::new()])]
    );

    socket.attempt_to_open();
    let connection = transport.connection(RELAY_1).unwrap();
    connection.open();
    assert_eq!(
        connection.sent(),
        vec![ClientMessage::req(third.id().clone(), vec![Filter::new()])]
    );
}

