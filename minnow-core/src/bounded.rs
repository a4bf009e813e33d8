//! Fixed-capacity keyed collection.

use std::fmt;

/// Insertion into a [`BoundedTable`] was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    /// Every slot is occupied.
    #[error("table full ({capacity} entries)")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },

    /// An entry with the same key already exists.
    #[error("duplicate key '{0}'")]
    Duplicate(String),
}

/// An insertion-ordered table holding at most `capacity` entries.
///
/// Inserting into a full table fails instead of evicting, so callers treat
/// a full table as backpressure. Lookups are linear scans.
#[derive(Clone)]
pub struct BoundedTable<K, V> {
    entries: Vec<(K, V)>,
    capacity: usize,
}

impl<K: PartialEq + fmt::Display, V> BoundedTable<K, V> {
    /// Create an empty table.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether another entry can be inserted.
    pub fn has_room(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Insert a new entry at the end.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), CapacityError> {
        if self.contains_key(&key) {
            return Err(CapacityError::Duplicate(key.to_string()));
        }
        if !self.has_room() {
            return Err(CapacityError::Full {
                capacity: self.capacity,
            });
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Whether `key` is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: PartialEq<Q>,
        Q: ?Sized,
    {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Value for `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: PartialEq<Q>,
        Q: ?Sized,
    {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Mutable value for `key`.
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: PartialEq<Q>,
        Q: ?Sized,
    {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Remove and return the entry for `key`, keeping the order of the rest.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: PartialEq<Q>,
        Q: ?Sized,
    {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Mutable values in insertion order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.iter_mut().map(|(_, v)| v)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for BoundedTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTable")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries)
            .finish()
    }
}
