//! Canonical name storage shared by every table of one scan.
//!
//! Class, package and annotation names are interned once and handed out as
//! `Arc<str>` handles. Two handles for equal text obtained from the same map
//! are always the same allocation, so identity (`Arc::ptr_eq`) can be used to
//! verify that a name really came from this map.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

pub type Name = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intern {
    /// Create the canonical entry when absent.
    Force,
    /// Answer `None` when absent.
    Existing,
}

#[derive(Debug)]
pub struct InternMap {
    label: String,
    names: RwLock<HashSet<Name>>,
    total_length: AtomicUsize,
}

impl InternMap {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            names: RwLock::new(HashSet::new()),
            total_length: AtomicUsize::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn intern(&self, value: &str, mode: Intern) -> Option<Name> {
        match mode {
            Intern::Force => Some(self.force(value)),
            Intern::Existing => self.lookup(value),
        }
    }

    pub fn force(&self, value: &str) -> Name {
        self.lookup(value).unwrap_or_else(|| self.insert(value))
    }

    pub fn get(&self, value: &str) -> Option<Name> {
        self.lookup(value)
    }

    fn lookup(&self, value: &str) -> Option<Name> {
        let names = self.names.read().unwrap_or_else(|e| e.into_inner());
        names.get(value).map(Arc::clone)
    }

    fn insert(&self, value: &str) -> Name {
        // Re-check under the write lock: another writer may have won the race.
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = names.get(value) {
            return Arc::clone(existing);
        }
        let name: Name = Arc::from(value);
        names.insert(Arc::clone(&name));
        self.total_length.fetch_add(value.len(), Ordering::Relaxed);
        name
    }

    /// True when `name` is the very handle stored in this map.
    pub fn is_canonical(&self, name: &Name) -> bool {
        let names = self.names.read().unwrap_or_else(|e| e.into_inner());
        names
            .get(name.as_ref())
            .is_some_and(|stored| Arc::ptr_eq(stored, name))
    }

    pub fn size(&self) -> usize {
        self.names.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn total_length(&self) -> usize {
        self.total_length.load(Ordering::Relaxed)
    }
}
