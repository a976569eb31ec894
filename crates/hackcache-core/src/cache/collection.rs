use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};

/// A server-owned record with a stable identifier.
///
/// Identity never changes after creation; every other field may be replaced
/// by a merge. The serde representation is the wire representation, and is
/// also what the snapshot stores.
pub trait Entity: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Key of the item array inside a payload for this entity kind.
    const RESULTS_KEY: &'static str;

    fn id(&self) -> &str;

    /// Last-modified marker in milliseconds, when the server sends one.
    fn marker(&self) -> Option<i64> {
        None
    }

    /// Display order. The default keeps arrival order because the sort is stable.
    fn display_order(_a: &Self, _b: &Self) -> Ordering {
        Ordering::Equal
    }
}

/// Ordered, ID-indexed set of entities of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection<T: Entity> {
    items: Vec<T>,
    index: HashMap<String, usize>,
    high_water_mark: Option<i64>,
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Collection<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            high_water_mark: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn high_water_mark(&self) -> Option<i64> {
        self.high_water_mark
    }

    pub(crate) fn set_high_water_mark(&mut self, mark: Option<i64>) {
        self.high_water_mark = mark;
    }

    /// Replace the entity with the same ID, or append a new one.
    /// Returns `true` if the collection changed.
    pub(crate) fn upsert(&mut self, entity: T) -> bool {
        match self.index.get(entity.id()) {
            Some(&i) => {
                if self.items[i] == entity {
                    false
                } else {
                    self.items[i] = entity;
                    true
                }
            }
            None => {
                self.index.insert(entity.id().to_string(), self.items.len());
                self.items.push(entity);
                true
            }
        }
    }

    /// Remove the entity with `id`. Returns `true` if it was present.
    pub(crate) fn remove(&mut self, id: &str) -> bool {
        match self.index.remove(id) {
            Some(i) => {
                self.items.remove(i);
                self.rebuild_index();
                true
            }
            None => false,
        }
    }

    /// Re-apply the entity kind's display order.
    pub(crate) fn resort(&mut self) {
        self.items.sort_by(T::display_order);
        self.rebuild_index();
    }

    /// Drop every entity and forget the high-water mark, forcing a full fetch.
    pub(crate) fn invalidate(&mut self) {
        self.items.clear();
        self.index.clear();
        self.high_water_mark = None;
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, item) in self.items.iter().enumerate() {
            self.index.insert(item.id().to_string(), i);
        }
    }
}

impl<'a, T: Entity> IntoIterator for &'a Collection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
