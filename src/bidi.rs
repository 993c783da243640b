//! Two-sided set multimap between annotation holders (classes, packages)
//! and held annotation types.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::fault::Message;
use crate::intern::Name;
use crate::message;

#[derive(Debug, Clone, Default)]
pub struct BidiMap {
    holder_tag: &'static str,
    held_tag: &'static str,
    forward: BTreeMap<Name, BTreeSet<Name>>,
    reverse: BTreeMap<Name, BTreeSet<Name>>,
}

impl BidiMap {
    pub fn new(holder_tag: &'static str, held_tag: &'static str) -> Self {
        Self {
            holder_tag,
            held_tag,
            forward: BTreeMap::new(),
            reverse: BTreeMap::new(),
        }
    }

    pub fn holder_tag(&self) -> &'static str {
        self.holder_tag
    }

    pub fn held_tag(&self) -> &'static str {
        self.held_tag
    }

    /// Records the pair in both views. Answers false when already present.
    pub fn add(&mut self, holder: &Name, held: &Name) -> bool {
        let added = self
            .forward
            .entry(Arc::clone(holder))
            .or_default()
            .insert(Arc::clone(held));
        if added {
            self.reverse
                .entry(Arc::clone(held))
                .or_default()
                .insert(Arc::clone(holder));
        }
        added
    }

    pub fn holds(&self, holder: &str, held: &str) -> bool {
        self.forward
            .get(holder)
            .is_some_and(|held_set| held_set.contains(held))
    }

    pub fn select_held_of(&self, holder: &str) -> Option<&BTreeSet<Name>> {
        self.forward.get(holder)
    }

    pub fn select_holders_of(&self, held: &str) -> Option<&BTreeSet<Name>> {
        self.reverse.get(held)
    }

    pub fn holder_set(&self) -> impl Iterator<Item = &Name> {
        self.forward.keys()
    }

    pub fn held_set(&self) -> impl Iterator<Item = &Name> {
        self.reverse.keys()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&Name, &Name)> {
        self.forward
            .iter()
            .flat_map(|(holder, held)| held.iter().map(move |h| (holder, h)))
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn holder_count(&self) -> usize {
        self.forward.len()
    }

    pub fn held_count(&self) -> usize {
        self.reverse.len()
    }

    pub fn pair_count(&self) -> usize {
        self.forward.values().map(BTreeSet::len).sum()
    }

    /// Checks that both views describe the same pairs. Every asymmetry is
    /// reported; nothing is repaired.
    pub fn validate(&self, label: &str, faults: &mut Vec<Message>) -> usize {
        let before = faults.len();

        for (holder, held_set) in &self.forward {
            if held_set.is_empty() {
                faults.push(message!(
                    "[ {0} ] {1} [ {2} ] is recorded with no {3}",
                    label,
                    self.holder_tag,
                    holder,
                    self.held_tag
                ));
            }
            for held in held_set {
                let listed = self
                    .reverse
                    .get(held)
                    .is_some_and(|holders| holders.contains(holder));
                if !listed {
                    faults.push(message!(
                        "[ {0} ] {1} [ {2} ] holds {3} [ {4} ] but is not listed among its holders",
                        label,
                        self.holder_tag,
                        holder,
                        self.held_tag,
                        held
                    ));
                }
            }
        }

        for (held, holders) in &self.reverse {
            for holder in holders {
                let listed = self
                    .forward
                    .get(holder)
                    .is_some_and(|held_set| held_set.contains(held));
                if !listed {
                    faults.push(message!(
                        "[ {0} ] {1} [ {2} ] lists {3} [ {4} ] as a holder, but the holder does not hold it",
                        label,
                        self.held_tag,
                        held,
                        self.holder_tag,
                        holder
                    ));
                }
            }
        }

        faults.len() - before
    }

    #[cfg(test)]
    pub(crate) fn forward_mut(&mut self) -> &mut BTreeMap<Name, BTreeSet<Name>> {
        &mut self.forward
    }
}
