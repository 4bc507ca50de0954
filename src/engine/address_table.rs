//! TTL registry of identities
//!
//! Static entries never expire. Dynamic entries live until `now + ttl` and
//! are refreshed by re-insertion. There is no background sweeper: expired
//! entries are evicted when the table is enumerated.

use super::events::{Observers, Subscription};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent<T> {
    Added(T),
    Removed(T),
    Expired(T),
}

/// Handlers run while the table is borrowed and must not call back into it.
pub struct AddressTable<T> {
    statics: HashSet<T>,
    dynamics: HashMap<T, Instant>,
    observers: Observers<TableEvent<T>>,
}

impl<T> AddressTable<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            statics: HashSet::new(),
            dynamics: HashMap::new(),
            observers: Observers::new(),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TableEvent<T>) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }

    /// Insert a permanent entry. Returns false if it was already static.
    ///
    /// A live dynamic entry is promoted without a second `Added`.
    pub fn add_static(&mut self, item: T) -> bool {
        if self.statics.contains(&item) {
            return false;
        }
        let was_live = self
            .dynamics
            .remove(&item)
            .is_some_and(|expiry| expiry > Instant::now());
        self.statics.insert(item.clone());
        if !was_live {
            self.observers.emit(&TableEvent::Added(item));
        }
        true
    }

    /// Insert or refresh a dynamic entry.
    ///
    /// Returns true only when the entry was not present before. Refreshing
    /// returns false, and so does any call for a static entry.
    pub fn set_dynamic(&mut self, item: T, ttl: Duration) -> bool {
        if self.statics.contains(&item) {
            return false;
        }
        let now = Instant::now();
        match self.dynamics.insert(item.clone(), now + ttl) {
            Some(expiry) if expiry > now => false,
            Some(_) => {
                // Expired but never enumerated
                self.observers.emit(&TableEvent::Expired(item.clone()));
                self.observers.emit(&TableEvent::Added(item));
                true
            }
            None => {
                self.observers.emit(&TableEvent::Added(item));
                true
            }
        }
    }

    pub fn remove(&mut self, item: &T) -> bool {
        let removed = self.statics.remove(item) | self.dynamics.remove(item).is_some();
        if removed {
            self.observers.emit(&TableEvent::Removed(item.clone()));
        }
        removed
    }

    /// Whether `item` is present and not expired. Does not evict.
    pub fn contains(&self, item: &T) -> bool {
        self.statics.contains(item)
            || self
                .dynamics
                .get(item)
                .is_some_and(|expiry| *expiry > Instant::now())
    }

    pub fn is_static(&self, item: &T) -> bool {
        self.statics.contains(item)
    }

    /// Enumerate live entries, evicting expired dynamic ones.
    ///
    /// Emits one `Expired` per evicted entry.
    pub fn sweep(&mut self) -> Vec<T> {
        let now = Instant::now();
        let expired: Vec<T> = self
            .dynamics
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(item, _)| item.clone())
            .collect();
        for item in &expired {
            self.dynamics.remove(item);
        }
        for item in expired {
            self.observers.emit(&TableEvent::Expired(item));
        }

        self.statics
            .iter()
            .chain(self.dynamics.keys())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.statics.len() + self.dynamics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for AddressTable<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for AddressTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressTable")
            .field("statics", &self.statics)
            .field("dynamics", &self.dynamics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(table: &AddressTable<&'static str>) -> (Arc<Mutex<Vec<TableEvent<&'static str>>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = table.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        (events, sub)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_entry_expires_once() {
        let mut table = AddressTable::new();
        let (events, _sub) = recorder(&table);

        assert!(table.set_dynamic("x", Duration::from_secs(10)));
        assert_eq!(table.sweep(), vec!["x"]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!table.contains(&"x"));
        assert!(table.sweep().is_empty());
        assert!(table.sweep().is_empty());

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![TableEvent::Added("x"), TableEvent::Expired("x")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_wins_over_dynamic() {
        let mut table = AddressTable::new();
        assert!(table.add_static("x"));
        assert!(!table.set_dynamic("x", Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(table.sweep(), vec!["x"]);
        assert!(table.contains(&"x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_lifetime() {
        let mut table = AddressTable::new();
        assert!(table.set_dynamic("x", Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(!table.set_dynamic("x", Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(table.sweep(), vec!["x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinsert_after_unswept_expiry() {
        let mut table = AddressTable::new();
        let (events, _sub) = recorder(&table);

        table.set_dynamic("x", Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(table.set_dynamic("x", Duration::from_secs(1)));

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                TableEvent::Added("x"),
                TableEvent::Expired("x"),
                TableEvent::Added("x")
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_and_remove() {
        let mut table = AddressTable::new();
        let (events, _sub) = recorder(&table);

        table.set_dynamic("x", Duration::from_secs(1));
        assert!(table.add_static("x"));
        assert!(!table.add_static("x"));
        assert!(table.is_static(&"x"));

        assert!(table.remove(&"x"));
        assert!(!table.remove(&"x"));
        assert!(table.is_empty());

        assert_eq!(
            *events.lock().unwrap(),
            vec![TableEvent::Added("x"), TableEvent::Removed("x")]
        );
    }
}
