//! Reader state tracking
//!
//! Keeps the authoritative map of reader name to last known state and turns
//! the results of a status-change poll into attach/detach/insert/remove
//! events. The map is shared with other threads only through
//! [`ReaderTracker::snapshot`] style reads under its mutex.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use pcsc::State;
use tracing::{debug, info, warn};

/// Reader name mapped to symbolic state names
pub type ReaderList = BTreeMap<String, Vec<&'static str>>;

/// Reader map shared between the monitor thread and its handle
pub type SharedReaders = Arc<Mutex<BTreeMap<String, ReaderInfo>>>;

/// Symbolic names of the bits set in a reader state
pub fn state_names(state: State) -> Vec<&'static str> {
    const NAMES: [(State, &str); 10] = [
        (State::IGNORE, "IGNORE"),
        (State::CHANGED, "CHANGED"),
        (State::UNKNOWN, "UNKNOWN"),
        (State::UNAVAILABLE, "UNAVAILABLE"),
        (State::EMPTY, "EMPTY"),
        (State::PRESENT, "PRESENT"),
        (State::ATRMATCH, "ATRMATCH"),
        (State::EXCLUSIVE, "EXCLUSIVE"),
        (State::INUSE, "INUSE"),
        (State::MUTE, "MUTE"),
    ];

    NAMES
        .iter()
        .filter(|(bit, _)| state.contains(*bit))
        .map(|(_, name)| *name)
        .collect()
}

/// Events observed by the reader monitor, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    /// A reader appeared in the enumeration
    ReaderAttached { reader: String },
    /// A reader disappeared from the enumeration
    ReaderRemoved { reader: String },
    /// A responsive card was inserted
    CardInserted { reader: String, atr: Vec<u8> },
    /// A previously inserted card was removed
    CardRemoved { reader: String },
    /// Reader or card set changed; emitted at most once per poll cycle
    ReaderListChanged { readers: ReaderList },
    /// Hardware error; `reader` is `None` when the monitor itself failed
    Error {
        reader: Option<String>,
        error: pcsc::Error,
    },
}

/// Last known state of one reader
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    /// State bits as last reported, without the transient CHANGED bit
    pub state: State,
    /// ATR of the inserted card, empty when no card is present
    pub atr: Vec<u8>,
    card_inserted: bool,
}

impl ReaderInfo {
    fn new() -> Self {
        Self {
            state: State::UNAWARE,
            atr: Vec::new(),
            card_inserted: false,
        }
    }
}

/// One entry of a status-change poll result
#[derive(Debug, Clone)]
pub struct Observation {
    pub reader: String,
    pub event_state: State,
    pub atr: Vec<u8>,
}

/// Diffs poll results against the cached reader map
pub struct ReaderTracker {
    readers: SharedReaders,
    list_changed: bool,
}

impl ReaderTracker {
    pub fn new(readers: SharedReaders) -> Self {
        Self {
            readers,
            list_changed: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ReaderInfo>> {
        self.readers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Known readers with the state to pass as "current" to the next poll
    pub fn known(&self) -> Vec<(String, State)> {
        self.lock()
            .iter()
            .map(|(name, info)| (name.clone(), info.state))
            .collect()
    }

    /// Snapshot of the reader map
    pub fn snapshot(&self) -> ReaderList {
        snapshot(&self.readers)
    }

    /// Reconcile the cache with a fresh reader enumeration
    pub fn reconcile(&mut self, listed: &[String], events: &mut Vec<ReaderEvent>) {
        let mut readers = self.readers.lock().unwrap_or_else(|p| p.into_inner());

        let gone: Vec<String> = readers
            .keys()
            .filter(|name| !listed.contains(name))
            .cloned()
            .collect();
        for reader in gone {
            if let Some(info) = readers.remove(&reader) {
                // Consumers must see the card go before the reader does
                if info.card_inserted {
                    events.push(ReaderEvent::CardRemoved {
                        reader: reader.clone(),
                    });
                }
            }
            info!(reader = %reader, "Reader removed");
            events.push(ReaderEvent::ReaderRemoved { reader });
            self.list_changed = true;
        }

        for reader in listed {
            if !readers.contains_key(reader) {
                info!(reader = %reader, "Reader attached");
                readers.insert(reader.clone(), ReaderInfo::new());
                events.push(ReaderEvent::ReaderAttached {
                    reader: reader.clone(),
                });
                // Announced once the settle state of the reader is known
                self.list_changed = true;
            }
        }
    }

    /// Apply one poll result; returns true when the readers must be re-listed
    pub fn apply(&mut self, observed: &[Observation], events: &mut Vec<ReaderEvent>) -> bool {
        let mut relist = false;
        {
            let mut readers = self.readers.lock().unwrap_or_else(|p| p.into_inner());

            for observation in observed {
                let reader = &observation.reader;
                let event = observation.event_state;
                debug!(reader = %reader, state = ?state_names(event), "Reader state");

                if !event.contains(State::CHANGED) {
                    continue;
                }

                let Some(info) = readers.get_mut(reader) else {
                    relist = true;
                    continue;
                };

                if event.contains(State::UNKNOWN) {
                    info!(reader = %reader, "Reader gone");
                    relist = true;
                    if info.card_inserted {
                        info.card_inserted = false;
                        events.push(ReaderEvent::CardRemoved {
                            reader: reader.clone(),
                        });
                        self.list_changed = true;
                    }
                    continue;
                }

                if event.contains(State::PRESENT) && !info.state.contains(State::PRESENT) {
                    if event.contains(State::MUTE) {
                        warn!(reader = %reader, "Card is mute");
                        events.push(ReaderEvent::Error {
                            reader: Some(reader.clone()),
                            error: pcsc::Error::UnresponsiveCard,
                        });
                    } else {
                        info!(reader = %reader, atr = %hex::encode_upper(&observation.atr), "Card inserted");
                        info.card_inserted = true;
                        info.atr = observation.atr.clone();
                        events.push(ReaderEvent::CardInserted {
                            reader: reader.clone(),
                            atr: observation.atr.clone(),
                        });
                        self.list_changed = true;
                    }
                } else if event.contains(State::EMPTY) && info.card_inserted {
                    info!(reader = %reader, "Card removed");
                    info.card_inserted = false;
                    info.atr.clear();
                    events.push(ReaderEvent::CardRemoved {
                        reader: reader.clone(),
                    });
                    self.list_changed = true;
                }

                info.state = event - State::CHANGED;
            }
        }

        if self.list_changed {
            self.list_changed = false;
            events.push(ReaderEvent::ReaderListChanged {
                readers: self.snapshot(),
            });
        }

        relist
    }
}

/// Snapshot of a shared reader map
pub fn snapshot(readers: &SharedReaders) -> ReaderList {
    readers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .map(|(name, info)| (name.clone(), state_names(info.state)))
        .collect()
}
