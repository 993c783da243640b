//! Structural difference between two sets of targets.
//!
//! `TargetsDelta::subtract(final, initial)` records what `final` added and
//! what it lost relative to `initial`, region by region. Removed packages
//! and removed interfaces can be tolerated when testing for a null delta;
//! tolerating a removed holder also tolerates the annotations it lost.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::fault::Message;
use crate::intern::Name;
use crate::message;
use crate::policy::{AnnotationCategory, ScanPolicy};
use crate::table::TargetsTable;
use crate::targets::Targets;

type Pair = (Name, Name);

#[derive(Debug, Clone)]
pub struct TableDelta {
    pub policy: ScanPolicy,
    pub added_classes: BTreeSet<Name>,
    pub removed_classes: BTreeSet<Name>,
    /// Removed classes that the initial side recorded as interfaces.
    pub removed_interfaces: BTreeSet<Name>,
    pub added_packages: BTreeSet<Name>,
    pub removed_packages: BTreeSet<Name>,
    /// Classes on both sides whose superclass differs: (final, initial).
    pub changed_superclasses: BTreeMap<Name, (Option<Name>, Option<Name>)>,
    /// Classes on both sides whose access flags differ: (final, initial).
    pub changed_modifiers: BTreeMap<Name, (u16, u16)>,
    pub added_interface_edges: BTreeSet<Pair>,
    pub removed_interface_edges: BTreeSet<Pair>,
    pub added_annotations: BTreeMap<AnnotationCategory, BTreeSet<Pair>>,
    pub removed_annotations: BTreeMap<AnnotationCategory, BTreeSet<Pair>>,
}

fn difference(a: &BTreeSet<Name>, b: &BTreeSet<Name>) -> BTreeSet<Name> {
    a.difference(b).cloned().collect()
}

fn pairs_of(table: &TargetsTable, category: AnnotationCategory) -> BTreeSet<Pair> {
    table
        .annotations(category)
        .pairs()
        .map(|(holder, held)| (Arc::clone(holder), Arc::clone(held)))
        .collect()
}

fn interface_edges(table: &TargetsTable) -> BTreeSet<Pair> {
    table
        .interfaces()
        .iter()
        .flat_map(|(class, interfaces)| interfaces.iter().map(move |i| (Arc::clone(class), Arc::clone(i))))
        .collect()
}

impl TableDelta {
    pub fn subtract(final_table: &TargetsTable, initial_table: &TargetsTable) -> Self {
        let removed_classes = difference(initial_table.classes(), final_table.classes());
        let removed_interfaces = removed_classes
            .iter()
            .filter(|c| {
                initial_table
                    .modifiers_of(c)
                    .is_some_and(|m| m & crate::classfile::ACC_INTERFACE != 0)
            })
            .cloned()
            .collect();

        let mut changed_superclasses = BTreeMap::new();
        let mut changed_modifiers = BTreeMap::new();
        for class in final_table.classes().intersection(initial_table.classes()) {
            let now = final_table.superclass_of(class).cloned();
            let before = initial_table.superclass_of(class).cloned();
            if now != before {
                changed_superclasses.insert(Arc::clone(class), (now, before));
            }

            let now = final_table.modifiers_of(class).unwrap_or(0);
            let before = initial_table.modifiers_of(class).unwrap_or(0);
            if now != before {
                changed_modifiers.insert(Arc::clone(class), (now, before));
            }
        }

        let final_edges = interface_edges(final_table);
        let initial_edges = interface_edges(initial_table);
        let shared = |pair: &&Pair| {
            final_table.contains_class(&pair.0) && initial_table.contains_class(&pair.0)
        };

        let mut added_annotations = BTreeMap::new();
        let mut removed_annotations = BTreeMap::new();
        for category in AnnotationCategory::ALL {
            let now = pairs_of(final_table, category);
            let before = pairs_of(initial_table, category);
            added_annotations.insert(category, now.difference(&before).cloned().collect());
            removed_annotations.insert(category, before.difference(&now).cloned().collect());
        }

        Self {
            policy: final_table.policy(),
            added_classes: difference(final_table.classes(), initial_table.classes()),
            removed_classes,
            removed_interfaces,
            added_packages: difference(final_table.packages(), initial_table.packages()),
            removed_packages: difference(initial_table.packages(), final_table.packages()),
            changed_superclasses,
            changed_modifiers,
            added_interface_edges: final_edges.difference(&initial_edges).filter(shared).cloned().collect(),
            removed_interface_edges: initial_edges.difference(&final_edges).filter(shared).cloned().collect(),
            added_annotations,
            removed_annotations,
        }
    }

    /// Every difference not tolerated by the two flags, as messages.
    pub fn differences(&self, label: &str, ignore_removed_packages: bool, ignore_removed_interfaces: bool) -> Vec<Message> {
        let policy = self.policy.tag();
        let mut out = Vec::new();

        for class in &self.added_classes {
            out.push(message!("[ {0} ] [ {1} ] added class [ {2} ]", label, policy, class));
        }
        for class in &self.removed_classes {
            if ignore_removed_interfaces && self.removed_interfaces.contains(class) {
                continue;
            }
            out.push(message!("[ {0} ] [ {1} ] removed class [ {2} ]", label, policy, class));
        }
        for package in &self.added_packages {
            out.push(message!("[ {0} ] [ {1} ] added package [ {2} ]", label, policy, package));
        }
        if !ignore_removed_packages {
            for package in &self.removed_packages {
                out.push(message!("[ {0} ] [ {1} ] removed package [ {2} ]", label, policy, package));
            }
        }
        for (class, (now, before)) in &self.changed_superclasses {
            out.push(message!(
                "[ {0} ] [ {1} ] class [ {2} ] superclass changed from [ {3} ] to [ {4} ]",
                label,
                policy,
                class,
                before.as_deref().unwrap_or("-"),
                now.as_deref().unwrap_or("-")
            ));
        }
        for (class, (now, before)) in &self.changed_modifiers {
            out.push(message!(
                "[ {0} ] [ {1} ] class [ {2} ] modifiers changed from [ {3} ] to [ {4} ]",
                label,
                policy,
                class,
                format!("{before:#06x}"),
                format!("{now:#06x}")
            ));
        }
        for (class, interface) in &self.added_interface_edges {
            out.push(message!(
                "[ {0} ] [ {1} ] class [ {2} ] added interface [ {3} ]",
                label,
                policy,
                class,
                interface
            ));
        }
        if !ignore_removed_interfaces {
            for (class, interface) in &self.removed_interface_edges {
                out.push(message!(
                    "[ {0} ] [ {1} ] class [ {2} ] removed interface [ {3} ]",
                    label,
                    policy,
                    class,
                    interface
                ));
            }
        }

        for (category, pairs) in &self.added_annotations {
            for (holder, held) in pairs {
                out.push(message!(
                    "[ {0} ] [ {1} ] {2} [ {3} ] added annotation [ {4} ]",
                    label,
                    policy,
                    category,
                    holder,
                    held
                ));
            }
        }
        for (category, pairs) in &self.removed_annotations {
            for (holder, held) in pairs {
                let tolerated = match category {
                    AnnotationCategory::Package => {
                        ignore_removed_packages && self.removed_packages.contains(holder)
                    }
                    _ => ignore_removed_interfaces && self.removed_interfaces.contains(holder),
                };
                if tolerated {
                    continue;
                }
                out.push(message!(
                    "[ {0} ] [ {1} ] {2} [ {3} ] removed annotation [ {4} ]",
                    label,
                    policy,
                    category,
                    holder,
                    held
                ));
            }
        }

        out
    }

    pub fn is_null(&self, ignore_removed_packages: bool, ignore_removed_interfaces: bool) -> bool {
        self.differences("", ignore_removed_packages, ignore_removed_interfaces)
            .is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TargetsDelta {
    tables: Vec<TableDelta>,
}

impl TargetsDelta {
    pub fn subtract(final_targets: &Targets, initial_targets: &Targets) -> Self {
        let tables = ScanPolicy::ALL
            .into_iter()
            .map(|p| TableDelta::subtract(final_targets.table(p), initial_targets.table(p)))
            .collect();
        Self { tables }
    }

    pub fn table(&self, policy: ScanPolicy) -> &TableDelta {
        &self.tables[policy.index()]
    }

    pub fn is_null(&self, ignore_removed_packages: bool, ignore_removed_interfaces: bool) -> bool {
        self.tables
            .iter()
            .all(|t| t.is_null(ignore_removed_packages, ignore_removed_interfaces))
    }

    /// Unsuppressed differences, in policy order.
    pub fn differences(&self, label: &str, ignore_removed_packages: bool, ignore_removed_interfaces: bool) -> Vec<Message> {
        self.tables
            .iter()
            .flat_map(|t| t.differences(label, ignore_removed_packages, ignore_removed_interfaces))
            .collect()
    }

    /// Appends one line per difference, or a single line saying there are none.
    pub fn describe(&self, label: &str, out: &mut Vec<String>) {
        let lines = self.differences(label, false, false);
        if lines.is_empty() {
            out.push(format!("[ {label} ] no differences"));
            return;
        }
        out.extend(lines.iter().map(Message::resolve));
    }
}
