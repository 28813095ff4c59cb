//! Batched one-shot loads. Loads requested within a short window share one
//! subscription per relay and filter shape.

use crate::adapter::AdapterContext;
use crate::request::{RequestEvent, RequestOptions, Unireq};
use crate::tracker::Tracker;
use futures::future::join_all;
use nostr::{Event, Filter};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

pub const DEFAULT_LOAD_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// How long the first load of a batch waits for others to join it.
    pub delay: Duration,
    /// Upper bound for each merged request.
    pub timeout: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            delay: DEFAULT_LOAD_DELAY,
            timeout: DEFAULT_LOAD_TIMEOUT,
        }
    }
}

/// Number of events a filter can match at most, when it is bounded by ids.
pub fn filter_cardinality(filter: &Filter) -> Option<usize> {
    filter
        .ids
        .as_ref()
        .map(|ids| ids.len())
        .filter(|count| *count > 0)
}

/// Filters with the same fields and the same time bounds can be merged.
/// Filters with a limit never are.
fn union_group(filter: &Filter) -> Option<String> {
    if filter.limit.is_some() {
        return None;
    }

    let mut parts = Vec::new();
    if filter.ids.is_some() {
        parts.push("ids".to_string());
    }
    if filter.authors.is_some() {
        parts.push("authors".to_string());
    }
    if filter.kinds.is_some() {
        parts.push("kinds".to_string());
    }
    parts.extend(filter.generic_tags.keys().map(|tag| format!("#{tag}")));
    if let Some(since) = filter.since {
        parts.push(format!("since:{}", since.as_u64()));
    }
    if let Some(until) = filter.until {
        parts.push(format!("until:{}", until.as_u64()));
    }
    if let Some(search) = &filter.search {
        parts.push(format!("search:{search}"));
    }
    Some(parts.join("-"))
}

fn extend<T: Ord + Clone>(target: &mut Option<BTreeSet<T>>, source: &Option<BTreeSet<T>>) {
    if let (Some(target), Some(source)) = (target.as_mut(), source) {
        target.extend(source.iter().cloned());
    }
}

fn merge_into(target: &mut Filter, filter: &Filter) {
    extend(&mut target.ids, &filter.ids);
    extend(&mut target.authors, &filter.authors);
    extend(&mut target.kinds, &filter.kinds);
    for (tag, values) in &filter.generic_tags {
        target
            .generic_tags
            .entry(*tag)
            .or_default()
            .extend(values.iter().cloned());
    }
}

/// Drops repeated filters and merges the ones of the same shape. The result
/// matches at least every event the input does.
pub fn union_filters(filters: Vec<Filter>) -> Vec<Filter> {
    let mut unique: Vec<Filter> = Vec::new();
    for filter in filters {
        if !unique.contains(&filter) {
            unique.push(filter);
        }
    }

    let mut merged: Vec<(Option<String>, Filter)> = Vec::new();
    for filter in unique {
        let group = union_group(&filter);
        let position = group
            .as_ref()
            .and_then(|group| merged.iter().position(|(key, _)| key.as_ref() == Some(group)));
        match position {
            Some(index) => merge_into(&mut merged[index].1, &filter),
            None => merged.push((group, filter)),
        }
    }

    merged.into_iter().map(|(_, filter)| filter).collect()
}

struct PendingLoad {
    filter: Filter,
    relays: Vec<String>,
    reply: oneshot::Sender<Vec<Event>>,
}

/// Collects loads for `delay`, then runs them as merged requests.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    context: AdapterContext,
    options: LoadOptions,
    pending: Mutex<Vec<PendingLoad>>,
}

impl Loader {
    pub fn new(context: AdapterContext, options: LoadOptions) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                context,
                options,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Resolves with the events matching `filter` that one of `relays`
    /// delivered.
    pub async fn load(&self, filter: Filter, relays: &[String]) -> Vec<Event> {
        let (reply, response) = oneshot::channel();
        let first = {
            let mut pending = self.inner.pending.lock();
            pending.push(PendingLoad {
                filter,
                relays: relays.to_vec(),
                reply,
            });
            pending.len() == 1
        };

        if first {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.options.delay).await;
                inner.flush().await;
            });
        }

        response.await.unwrap_or_default()
    }
}

impl LoaderInner {
    async fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }

        let mut filters_by_relay: BTreeMap<String, Vec<Filter>> = BTreeMap::new();
        for load in &batch {
            for relay in &load.relays {
                filters_by_relay
                    .entry(self.context.normalize(relay))
                    .or_default()
                    .push(load.filter.clone());
            }
        }

        let requests: Vec<(String, Filter)> = filters_by_relay
            .into_iter()
            .flat_map(|(relay, filters)| {
                union_filters(filters)
                    .into_iter()
                    .map(move |filter| (relay.clone(), filter))
            })
            .collect();
        debug!(
            "Loading {} merged requests for {} callers",
            requests.len(),
            batch.len()
        );

        let tracker = Arc::new(Tracker::new());
        let collected = Arc::new(Mutex::new(Vec::new()));
        join_all(
            requests
                .into_iter()
                .map(|(relay, filter)| self.run(relay, filter, tracker.clone(), collected.clone())),
        )
        .await;

        let events: Vec<Event> = std::mem::take(&mut *collected.lock());
        for load in batch {
            let relays: HashSet<String> = load
                .relays
                .iter()
                .map(|relay| self.context.normalize(relay))
                .collect();
            let matching = events
                .iter()
                .filter(|event| load.filter.match_event(event))
                .filter(|event| {
                    tracker
                        .get_relays(&event.id)
                        .iter()
                        .any(|relay| relays.contains(relay))
                })
                .cloned()
                .collect();
            let _ = load.reply.send(matching);
        }
    }

    /// Runs one merged request until it closes, or until it delivered as
    /// many events as its ids allow.
    async fn run(
        &self,
        relay: String,
        filter: Filter,
        tracker: Arc<Tracker>,
        collected: Arc<Mutex<Vec<Event>>>,
    ) {
        let cardinality = filter_cardinality(&filter);
        let unireq = Unireq::new(
            filter,
            &relay,
            &self.context,
            RequestOptions {
                timeout: Some(self.options.timeout),
                tracker: Some(tracker),
                auto_close: true,
                ..Default::default()
            },
        );

        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        let received = Mutex::new(0usize);
        let _handle = unireq.on(move |event| {
            let finished = match event {
                RequestEvent::Event(event) => {
                    collected.lock().push(event.as_ref().clone());
                    let mut received = received.lock();
                    *received += 1;
                    cardinality == Some(*received)
                }
                RequestEvent::Close => true,
                _ => false,
            };
            if finished {
                if let Some(done_tx) = done_tx.lock().take() {
                    let _ = done_tx.send(());
                }
            }
        });

        unireq.start();
        let _ = done_rx.await;
        unireq.close();
    }
}
