use crate::header::ConnectionId;
use crate::sync;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Routing table from connection id to a live connection entry.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    entries: RwLock<HashMap<ConnectionId, Arc<T>>>,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<T>>> {
        sync::read(&self.entries)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<T>>> {
        sync::write(&self.entries)
    }

    pub fn get(&self, key: &ConnectionId) -> Option<Arc<T>> {
        self.read().get(key).cloned()
    }

    /// Returns the entry for `key`, creating it with `create` if absent.
    ///
    /// Check and insert happen under one write lock, so concurrent first
    /// arrivals for the same key create a single entry. The returned flag is
    /// `true` for the caller that created it. `create` runs with the lock held
    /// and must not touch the table.
    pub fn get_or_insert_with<F>(&self, key: ConnectionId, create: F) -> (Arc<T>, bool)
    where
        F: FnOnce() -> Arc<T>,
    {
        if let Some(entry) = self.get(&key) {
            return (entry, false);
        }
        match self.write().entry(key) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => (e.insert(create()).clone(), true),
        }
    }

    /// Removes the entry for `key` only if it is still `entry`.
    pub fn remove_if_same(&self, key: &ConnectionId, entry: &Arc<T>) -> bool {
        let mut entries = self.write();
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(byte: u8) -> ConnectionId {
        ConnectionId::new(&[byte; 8]).unwrap()
    }

    #[test]
    fn existing_entry_is_returned_without_creating() {
        let table = ConnectionTable::new();
        let (first, created) = table.get_or_insert_with(id(1), || Arc::new(1));
        assert!(created);

        let (second, created) =
            table.get_or_insert_with(id(1), || -> Arc<i32> { panic!("entry created twice") });
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn table_is_usable_once_the_entry_is_returned() {
        let table = ConnectionTable::new();
        let (entry, created) = table.get_or_insert_with(id(2), || Arc::new(2));
        assert!(created);

        // Callers finish setting up the entry after the insert returns, and
        // that setup may consult the table.
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&table.get(&id(2)).unwrap(), &entry));
        assert!(table.remove_if_same(&id(2), &entry));
        assert!(table.is_empty());
    }

    #[test]
    fn removal_only_matches_the_same_entry() {
        let table = ConnectionTable::new();
        let stale = Arc::new(1);
        let (current, _) = table.get_or_insert_with(id(3), || Arc::new(2));

        assert!(!table.remove_if_same(&id(3), &stale));
        assert!(table.remove_if_same(&id(3), &current));
        assert!(table.get(&id(3)).is_none());
    }

    #[test]
    fn concurrent_first_arrivals_create_one_entry() {
        let table = Arc::new(ConnectionTable::new());
        let created = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let created = created.clone();
                std::thread::spawn(move || {
                    let (entry, _) = table.get_or_insert_with(id(4), || {
                        created.fetch_add(1, Ordering::SeqCst);
                        Arc::new(4)
                    });
                    entry
                })
            })
            .collect();
        let entries: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(table.snapshot().len(), 1);
    }
}
