//! Which relays each event has been seen on.

use crate::emitter::{Emitter, Unsubscriber};
use nostr::EventId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Index {
    relays_by_id: HashMap<EventId, HashSet<String>>,
    ids_by_relay: HashMap<String, HashSet<EventId>>,
}

impl Index {
    fn insert(&mut self, id: EventId, relay: &str) -> bool {
        let added = self
            .relays_by_id
            .entry(id)
            .or_default()
            .insert(relay.to_string());
        self.ids_by_relay
            .entry(relay.to_string())
            .or_default()
            .insert(id);
        added
    }

    fn remove(&mut self, id: &EventId, relay: &str) -> bool {
        let removed = match self.relays_by_id.get_mut(id) {
            Some(relays) => {
                let removed = relays.remove(relay);
                if relays.is_empty() {
                    self.relays_by_id.remove(id);
                }
                removed
            }
            None => false,
        };

        if let Some(ids) = self.ids_by_relay.get_mut(relay) {
            ids.remove(id);
            if ids.is_empty() {
                self.ids_by_relay.remove(relay);
            }
        }

        removed
    }
}

/// Bidirectional event id / relay url index shared across requests.
#[derive(Debug, Default)]
pub struct Tracker {
    index: RwLock<Index>,
    updates: Emitter<()>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Unsubscriber
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.updates.on(listener)
    }

    pub fn get_ids(&self, relay: &str) -> HashSet<EventId> {
        self.index
            .read()
            .ids_by_relay
            .get(relay)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_relays(&self, id: &EventId) -> HashSet<String> {
        self.index
            .read()
            .relays_by_id
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_relay(&self, id: &EventId, relay: &str) -> bool {
        self.index
            .read()
            .relays_by_id
            .get(id)
            .is_some_and(|relays| relays.contains(relay))
    }

    pub fn add_relay(&self, id: EventId, relay: &str) {
        let added = self.index.write().insert(id, relay);
        if added {
            self.updates.emit(&());
        }
    }

    pub fn remove_relay(&self, id: &EventId, relay: &str) {
        let removed = self.index.write().remove(id, relay);
        if removed {
            self.updates.emit(&());
        }
    }

    /// Records that `id` was seen on `relay`. Returns whether `id` had
    /// already been seen on any relay.
    pub fn track(&self, id: EventId, relay: &str) -> bool {
        let (seen, added) = {
            let mut index = self.index.write();
            let seen = index.relays_by_id.contains_key(&id);
            (seen, index.insert(id, relay))
        };
        if added {
            self.updates.emit(&());
        }
        seen
    }

    /// Adds every relay `source` was seen on to `target`.
    pub fn copy(&self, source: &EventId, target: EventId) {
        let added = {
            let mut index = self.index.write();
            let relays = index
                .relays_by_id
                .get(source)
                .cloned()
                .unwrap_or_default();
            relays
                .iter()
                .fold(false, |added, relay| index.insert(target, relay) || added)
        };
        if added {
            self.updates.emit(&());
        }
    }

    pub fn snapshot(&self) -> HashMap<EventId, HashSet<String>> {
        self.index.read().relays_by_id.clone()
    }

    /// Replaces the whole index with `relays_by_id`.
    pub fn load(&self, relays_by_id: HashMap<EventId, HashSet<String>>) {
        {
            let mut index = self.index.write();
            *index = Index::default();
            for (id, relays) in relays_by_id {
                for relay in relays {
                    index.insert(id, &relay);
                }
            }
        }
        self.updates.emit(&());
    }

    pub fn clear(&self) {
        *self.index.write() = Index::default();
        self.updates.emit(&());
    }
}
