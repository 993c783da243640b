//! Structural self-checks over scanned targets, and the state machine of a
//! scan-then-validate cycle.
//!
//! Checks never stop at the first defect: every fault found is appended to
//! the caller's list and the number added is returned.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fault::Message;
use crate::intern::Name;
use crate::message;
use crate::policy::{AnnotationCategory, ScanPolicy};
use crate::source::ClassSourceAggregate;
use crate::targets::Targets;

/// Every stored name must be the canonical handle of the targets' intern map.
pub fn validate_interning(targets: &Targets, faults: &mut Vec<Message>) -> usize {
    let before = faults.len();
    let names = targets.names();
    for table in targets.tables() {
        let policy = table.policy();
        table.for_each_name(|place, name| {
            if !names.is_canonical(name) {
                faults.push(message!(
                    "[ {0} ] {1} name [ {2} ] is not interned in [ {3} ]",
                    policy,
                    place,
                    name,
                    names.label()
                ));
            }
        });
    }
    faults.len() - before
}

pub fn validate_annotation_maps(targets: &Targets, faults: &mut Vec<Message>) -> usize {
    let mut added = 0;
    for table in targets.tables() {
        for category in AnnotationCategory::ALL {
            let label = format!("{} {}", table.policy(), category);
            added += table.annotations(category).validate(&label, faults);
        }
    }
    added
}

/// One fault per recorded superclass that has no recorded subclass.
pub fn validate_subclasses(targets: &Targets, faults: &mut Vec<Message>) -> usize {
    let before = faults.len();
    let superclasses: BTreeSet<Name> = targets.get_superclass_names().into_values().collect();
    for superclass in superclasses {
        if targets.get_subclass_names(&superclass).is_empty() {
            faults.push(message!(
                "Superclass [ {0} ] has no recorded subclasses",
                superclass
            ));
        }
    }
    faults.len() - before
}

/// Every class declaring an interface must be found among its implementors.
/// Interfaces extending interfaces are checked against the direct index.
pub fn validate_implements(targets: &Targets, faults: &mut Vec<Message>) -> usize {
    let before = faults.len();
    let mut implementors: BTreeMap<Name, BTreeSet<Name>> = BTreeMap::new();

    for table in targets.tables() {
        for (class, interfaces) in table.interfaces() {
            let class_is_interface = targets.is_interface(class);
            for interface in interfaces {
                let listed = if class_is_interface {
                    targets
                        .direct_implementers()
                        .get(interface)
                        .is_some_and(|set| set.contains(class))
                } else {
                    implementors
                        .entry(Name::clone(interface))
                        .or_insert_with(|| targets.get_all_implementors_of(interface))
                        .contains(class)
                };
                if !listed {
                    faults.push(message!(
                        "[ {0} ] class [ {1} ] implements [ {2} ] but is not among its implementors",
                        table.policy(),
                        class,
                        interface
                    ));
                }
            }
        }
    }
    faults.len() - before
}

/// Each class and package belongs to exactly one region.
pub fn validate_partition(targets: &Targets, faults: &mut Vec<Message>) -> usize {
    let before = faults.len();
    let mut class_regions: BTreeMap<&str, Vec<ScanPolicy>> = BTreeMap::new();
    let mut package_regions: BTreeMap<&str, Vec<ScanPolicy>> = BTreeMap::new();
    for table in targets.tables() {
        for class in table.classes() {
            class_regions.entry(&**class).or_default().push(table.policy());
        }
        for package in table.packages() {
            package_regions.entry(&**package).or_default().push(table.policy());
        }
    }

    let regions = |policies: &[ScanPolicy]| {
        policies
            .iter()
            .map(|p| p.tag())
            .collect::<Vec<_>>()
            .join(", ")
    };
    for (class, policies) in class_regions.iter().filter(|(_, p)| p.len() > 1) {
        faults.push(message!("Class [ {0} ] is recorded in [ {1} ]", class, regions(policies)));
    }
    for (package, policies) in package_regions.iter().filter(|(_, p)| p.len() > 1) {
        faults.push(message!("Package [ {0} ] is recorded in [ {1} ]", package, regions(policies)));
    }
    faults.len() - before
}

/// Every recorded origin must name a source of the aggregate.
pub fn validate_origins(targets: &Targets, aggregate: &ClassSourceAggregate, faults: &mut Vec<Message>) -> usize {
    let before = faults.len();
    let known = aggregate.source_names();
    for table in targets.tables() {
        for class in table.classes() {
            if let Some(origin) = table.class_origin(class)
                && !known.contains(origin)
            {
                faults.push(message!(
                    "[ {0} ] class [ {1} ] names unknown source [ {2} ]",
                    table.policy(),
                    class,
                    origin
                ));
            }
        }
    }
    faults.len() - before
}

/// Runs every structural check.
pub fn validate_targets(targets: &Targets, faults: &mut Vec<Message>) -> usize {
    let added = validate_interning(targets, faults)
        + validate_annotation_maps(targets, faults)
        + validate_subclasses(targets, faults)
        + validate_implements(targets, faults)
        + validate_partition(targets, faults);
    debug!("structural validation recorded {added} faults");
    added
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Unscanned,
    Scanning,
    Scanned,
    Validating,
    Passed,
    Failed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error("illegal validation cycle transition from {from:?} to {to:?}")]
    IllegalTransition { from: CycleState, to: CycleState },
    #[error("faults can only be recorded while validating, not in {0:?}")]
    NotValidating(CycleState),
}

/// `Unscanned -> Scanning -> Scanned -> Validating -> {Passed, Failed}`.
/// A finished cycle only moves again through `reset`.
#[derive(Debug, Clone)]
pub struct ValidationCycle {
    state: CycleState,
    faults: Vec<Message>,
}

impl Default for ValidationCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationCycle {
    pub fn new() -> Self {
        Self {
            state: CycleState::Unscanned,
            faults: Vec::new(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn faults(&self) -> &[Message] {
        &self.faults
    }

    fn advance(&mut self, from: CycleState, to: CycleState) -> Result<(), CycleError> {
        if self.state != from {
            return Err(CycleError::IllegalTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    pub fn begin_scan(&mut self) -> Result<(), CycleError> {
        self.advance(CycleState::Unscanned, CycleState::Scanning)
    }

    pub fn finish_scan(&mut self) -> Result<(), CycleError> {
        self.advance(CycleState::Scanning, CycleState::Scanned)
    }

    pub fn begin_validation(&mut self) -> Result<(), CycleError> {
        self.advance(CycleState::Scanned, CycleState::Validating)
    }

    /// Mutable access to the fault list, for checks that append directly.
    pub fn fault_sink(&mut self) -> Result<&mut Vec<Message>, CycleError> {
        if self.state != CycleState::Validating {
            return Err(CycleError::NotValidating(self.state));
        }
        Ok(&mut self.faults)
    }

    pub fn record_fault(&mut self, fault: Message) -> Result<(), CycleError> {
        self.fault_sink()?.push(fault);
        Ok(())
    }

    pub fn finish(&mut self) -> Result<CycleState, CycleError> {
        let to = if self.faults.is_empty() {
            CycleState::Passed
        } else {
            CycleState::Failed
        };
        self.advance(CycleState::Validating, to)?;
        if to == CycleState::Failed {
            warn!("validation failed with {} faults", self.faults.len());
            for fault in &self.faults {
                warn!("  {fault}");
            }
        }
        Ok(to)
    }

    /// Starts over from `Unscanned`, dropping recorded faults.
    pub fn reset(&mut self) {
        self.state = CycleState::Unscanned;
        self.faults.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ACC_ABSTRACT, ACC_INTERFACE, ClassRecord};
    use crate::intern::InternMap;
    use crate::source::MemorySource;
    use std::sync::Arc;

    fn record(name: &str, sup: Option<&str>, interfaces: &[&str]) -> ClassRecord {
        ClassRecord {
            name: name.to_string(),
            superclass: sup.map(str::to_string),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            class_annotations: vec!["A".to_string()],
            ..ClassRecord::default()
        }
    }

    fn consistent() -> Targets {
        let mut targets = Targets::new(Arc::new(InternMap::new("t")));
        targets.record(ScanPolicy::Seed, Some("app"), &record("a.Foo", Some("a.Base"), &["a.Api"]));
        targets.record(ScanPolicy::Seed, Some("app"), &record("a.Base", None, &[]));
        let api = ClassRecord {
            modifiers: ACC_INTERFACE | ACC_ABSTRACT,
            ..record("a.Api", None, &["a.Marker"])
        };
        targets.record(ScanPolicy::External, None, &api);
        targets.record(ScanPolicy::External, None, &ClassRecord::name_only("a.Marker"));
        targets
    }

    #[test]
    fn consistent_targets_have_no_faults() {
        let mut faults = Vec::new();
        assert_eq!(validate_targets(&consistent(), &mut faults), 0, "{faults:?}");
    }

    #[test]
    fn superclass_without_subclass_is_one_fault() {
        let mut targets = consistent();
        // Bypass the relationship index so the table alone records the edges.
        let table = targets.table_mut(ScanPolicy::Seed);
        table.record(Some("app"), &record("a.Orphan1", Some("a.Lost"), &[]));
        table.record(Some("app"), &record("a.Orphan2", Some("a.Lost"), &[]));

        let mut faults = Vec::new();
        assert_eq!(validate_subclasses(&targets, &mut faults), 1);
        assert!(faults[0].resolve().contains("a.Lost"));
    }

    #[test]
    fn missing_implementor_is_reported() {
        let mut targets = consistent();
        targets
            .table_mut(ScanPolicy::Seed)
            .record(Some("app"), &record("a.Hidden", None, &["a.Api"]));

        let mut faults = Vec::new();
        assert_eq!(validate_implements(&targets, &mut faults), 1);
        assert!(faults[0].resolve().contains("a.Hidden"));
    }

    #[test]
    fn duplicated_region_membership_is_reported() {
        let mut targets = consistent();
        targets
            .table_mut(ScanPolicy::Partial)
            .record(Some("lib"), &ClassRecord::name_only("a.Foo"));

        let mut faults = Vec::new();
        assert_eq!(validate_partition(&targets, &mut faults), 1);
        assert_eq!(faults[0].resolve(), "Class [ a.Foo ] is recorded in [ seed, partial ]");
    }

    #[test]
    fn one_sided_annotation_entry_is_reported() {
        let mut targets = consistent();
        let names = Arc::clone(targets.names());
        let holder = names.force("a.Ghost");
        let held = names.force("A");
        targets
            .table_mut(ScanPolicy::Seed)
            .annotations_mut(AnnotationCategory::Class)
            .forward_mut()
            .entry(holder)
            .or_default()
            .insert(held);

        let mut faults = Vec::new();
        assert_eq!(validate_annotation_maps(&targets, &mut faults), 1);
    }

    #[test]
    fn foreign_handles_fail_interning() {
        let mut targets = consistent();
        let foreign: Name = Arc::from("a.Foreign");
        let held: Name = Arc::from("A");
        targets
            .table_mut(ScanPolicy::Seed)
            .annotations_mut(AnnotationCategory::Method)
            .add(&foreign, &held);

        let mut faults = Vec::new();
        assert_eq!(validate_interning(&targets, &mut faults), 2);
    }

    #[test]
    fn unknown_origin_is_reported() {
        let mut aggregate = ClassSourceAggregate::new("agg");
        aggregate.add(MemorySource::new("other", ScanPolicy::Seed)).unwrap();
        let mut faults = Vec::new();
        assert_eq!(validate_origins(&consistent(), &aggregate, &mut faults), 2);
    }

    #[test]
    fn cycle_follows_the_state_machine() {
        let mut cycle = ValidationCycle::new();
        assert!(cycle.begin_validation().is_err());
        cycle.begin_scan().unwrap();
        cycle.finish_scan().unwrap();
        assert!(cycle.record_fault(message!("early")).is_err());
        cycle.begin_validation().unwrap();
        cycle.record_fault(message!("broken [ {0} ]", "x")).unwrap();
        assert_eq!(cycle.finish().unwrap(), CycleState::Failed);
        assert!(cycle.begin_scan().is_err());

        cycle.reset();
        cycle.begin_scan().unwrap();
        cycle.finish_scan().unwrap();
        cycle.begin_validation().unwrap();
        assert_eq!(cycle.finish().unwrap(), CycleState::Passed);
    }
}
