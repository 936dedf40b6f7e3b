//! In-memory document cache with dirty and deleted tracking. The cache lives
//! for one engine step; `save` drains the write set the step's transaction
//! must commit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use contracts::Id;

pub trait GameRecord: Clone {
    fn id(&self) -> &str;

    fn is_active(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    Missing { id: Id },
    Inactive { id: Id },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { id } => write!(f, "no such document: {id}"),
            Self::Inactive { id } => write!(f, "document is inactive: {id}"),
        }
    }
}

impl std::error::Error for TableError {}

/// Rows a `save` call hands to the transaction: ids to delete, then full
/// replacement states for every modified row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableFlush<T> {
    pub deleted: Vec<Id>,
    pub replaced: Vec<T>,
}

impl<T> TableFlush<T> {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.replaced.is_empty()
    }
}

#[derive(Debug)]
pub struct GameTable<T: GameRecord> {
    data: BTreeMap<Id, T>,
    modified: BTreeSet<Id>,
    deleted: BTreeSet<Id>,
}

impl<T: GameRecord> Default for GameTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: GameRecord> GameTable<T> {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            modified: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }

    /// Seed the cache from persisted rows without marking anything dirty.
    pub fn hydrate(rows: impl IntoIterator<Item = T>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.data.insert(row.id().to_string(), row);
        }
        table
    }

    pub fn insert(&mut self, row: T) -> Id {
        let id = row.id().to_string();
        self.deleted.remove(&id);
        self.modified.insert(id.clone());
        self.data.insert(id.clone(), row);
        id
    }

    pub fn delete(&mut self, id: &str) {
        if self.data.remove(id).is_some() {
            self.modified.remove(id);
            self.deleted.insert(id.to_string());
        }
    }

    /// Read access to an active document.
    pub fn lookup(&self, id: &str) -> Result<&T, TableError> {
        let doc = self.data.get(id).ok_or_else(|| TableError::Missing {
            id: id.to_string(),
        })?;
        if !doc.is_active() {
            return Err(TableError::Inactive {
                id: id.to_string(),
            });
        }
        Ok(doc)
    }

    /// Raw read access, inactive documents included.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.data.get(id)
    }

    /// The only mutation path: the closure receives a mutable borrow and the
    /// id is marked modified exactly once per call.
    pub fn update<R>(&mut self, id: &str, f: impl FnOnce(&mut T) -> R) -> Result<R, TableError> {
        let doc = self.data.get_mut(id).ok_or_else(|| TableError::Missing {
            id: id.to_string(),
        })?;
        if !doc.is_active() {
            return Err(TableError::Inactive {
                id: id.to_string(),
            });
        }
        self.modified.insert(id.to_string());
        Ok(f(doc))
    }

    /// Like `update`, but permitted on inactive documents.
    pub fn update_any<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, TableError> {
        let doc = self.data.get_mut(id).ok_or_else(|| TableError::Missing {
            id: id.to_string(),
        })?;
        self.modified.insert(id.to_string());
        Ok(f(doc))
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.iter_active().find(|doc| pred(doc))
    }

    pub fn filter(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<&T> {
        self.iter_active().filter(|doc| pred(doc)).collect()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &T> {
        self.data.values().filter(|doc| doc.is_active())
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &T> {
        self.data.values()
    }

    pub fn modified_ids(&self) -> impl Iterator<Item = &Id> {
        self.modified.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drain the write set accumulated since construction or the last save.
    /// Saving twice in a row without intervening writes yields an empty
    /// flush, so replaying a flush is harmless.
    pub fn save(&mut self) -> TableFlush<T> {
        let deleted = std::mem::take(&mut self.deleted).into_iter().collect();
        let replaced = std::mem::take(&mut self.modified)
            .into_iter()
            .filter_map(|id| self.data.get(&id).cloned())
            .collect();
        TableFlush { deleted, replaced }
    }
}
