//! The four policy regions of one scan, plus the relationship indexes
//! derived from them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::classfile::{ACC_ABSTRACT, ACC_INTERFACE, ClassRecord};
use crate::intern::{InternMap, Name};
use crate::policy::{AnnotationCategory, ScanPolicies, ScanPolicy};
use crate::table::{TableData, TargetsTable};

#[derive(Debug, Clone)]
pub struct Targets {
    names: Arc<InternMap>,
    tables: [TargetsTable; 4],
    subclasses: BTreeMap<Name, BTreeSet<Name>>,
    implementers: BTreeMap<Name, BTreeSet<Name>>,
}

impl Targets {
    pub fn new(names: Arc<InternMap>) -> Self {
        let tables = ScanPolicy::ALL.map(|policy| TargetsTable::new(policy, Arc::clone(&names)));
        Self {
            names,
            tables,
            subclasses: BTreeMap::new(),
            implementers: BTreeMap::new(),
        }
    }

    /// Rebuilds targets from stored table data, in policy order.
    pub fn from_data(names: Arc<InternMap>, data: &[TableData]) -> Self {
        let mut targets = Self::new(names);
        for table in data {
            for entry in &table.records {
                targets.record(table.policy, entry.source.as_deref(), &entry.record);
            }
        }
        targets
    }

    pub fn to_data(&self) -> Vec<TableData> {
        self.tables.iter().map(TargetsTable::to_data).collect()
    }

    pub fn names(&self) -> &Arc<InternMap> {
        &self.names
    }

    pub fn table(&self, policy: ScanPolicy) -> &TargetsTable {
        &self.tables[policy.index()]
    }

    #[cfg(test)]
    pub(crate) fn table_mut(&mut self, policy: ScanPolicy) -> &mut TargetsTable {
        &mut self.tables[policy.index()]
    }

    pub fn tables(&self) -> impl Iterator<Item = &TargetsTable> {
        self.tables.iter()
    }

    /// Records a class into the region of `policy`. The first region to
    /// record a name keeps it; later attempts answer false.
    pub fn record(&mut self, policy: ScanPolicy, source: Option<&str>, record: &ClassRecord) -> bool {
        if record.is_package_info() {
            let package = record.package_name();
            if self.tables.iter().any(|t| t.contains_package(package)) {
                return false;
            }
            self.tables[policy.index()].record(source, record);
            return true;
        }

        if self.policy_of(&record.name).is_some() {
            return false;
        }
        self.tables[policy.index()].record(source, record);

        let class = self.names.force(&record.name);
        if let Some(sup) = record.superclass.as_deref() {
            self.subclasses
                .entry(self.names.force(sup))
                .or_default()
                .insert(Arc::clone(&class));
        }
        for interface in &record.interfaces {
            self.implementers
                .entry(self.names.force(interface))
                .or_default()
                .insert(Arc::clone(&class));
        }
        true
    }

    pub fn policy_of(&self, class_name: &str) -> Option<ScanPolicy> {
        self.tables
            .iter()
            .find(|t| t.contains_class(class_name))
            .map(TargetsTable::policy)
    }

    pub fn package_policy_of(&self, package_name: &str) -> Option<ScanPolicy> {
        self.tables
            .iter()
            .find(|t| t.contains_package(package_name))
            .map(TargetsTable::policy)
    }

    pub fn is_seed_class_name(&self, class_name: &str) -> bool {
        self.table(ScanPolicy::Seed).contains_class(class_name)
    }

    pub fn is_partial_class_name(&self, class_name: &str) -> bool {
        self.table(ScanPolicy::Partial).contains_class(class_name)
    }

    pub fn is_excluded_class_name(&self, class_name: &str) -> bool {
        self.table(ScanPolicy::Excluded).contains_class(class_name)
    }

    pub fn is_external_class_name(&self, class_name: &str) -> bool {
        self.table(ScanPolicy::External).contains_class(class_name)
    }

    fn regions(&self, policies: ScanPolicies) -> impl Iterator<Item = &TargetsTable> {
        policies.policies().map(move |p| self.table(p))
    }

    pub fn get_class_names(&self, policies: ScanPolicies) -> BTreeSet<Name> {
        self.regions(policies)
            .flat_map(|t| t.classes().iter().cloned())
            .collect()
    }

    pub fn get_package_names(&self, policies: ScanPolicies) -> BTreeSet<Name> {
        self.regions(policies)
            .flat_map(|t| t.packages().iter().cloned())
            .collect()
    }

    pub fn get_class_names_of_source(&self, source_name: &str) -> BTreeSet<Name> {
        self.tables
            .iter()
            .flat_map(|t| t.classes_of_source(source_name).cloned())
            .collect()
    }

    /// Holders of `annotation` in `category`, across the selected regions.
    pub fn annotated(
        &self,
        category: AnnotationCategory,
        annotation: &str,
        policies: ScanPolicies,
    ) -> BTreeSet<Name> {
        self.regions(policies)
            .filter_map(|t| t.annotations(category).select_holders_of(annotation))
            .flat_map(|holders| holders.iter().cloned())
            .collect()
    }

    /// Annotations held by `holder` in `category`, across the selected regions.
    pub fn annotations_of(
        &self,
        category: AnnotationCategory,
        holder: &str,
        policies: ScanPolicies,
    ) -> BTreeSet<Name> {
        self.regions(policies)
            .filter_map(|t| t.annotations(category).select_held_of(holder))
            .flat_map(|held| held.iter().cloned())
            .collect()
    }

    /// Classes carrying the class annotation, from the seed region.
    pub fn get_annotated_classes(&self, annotation: &str) -> BTreeSet<Name> {
        self.annotated(AnnotationCategory::Class, annotation, ScanPolicies::SEED)
    }

    /// Seed classes read from `source_name` that carry `annotation`.
    pub fn get_annotated_classes_of_source(&self, source_name: &str, annotation: &str) -> BTreeSet<Name> {
        let seed = self.table(ScanPolicy::Seed);
        let from_source: BTreeSet<&Name> = seed.classes_of_source(source_name).collect();
        self.get_annotated_classes(annotation)
            .into_iter()
            .filter(|class| from_source.contains(class))
            .collect()
    }

    pub fn get_annotated_classes_in(&self, annotation: &str, policies: ScanPolicies) -> BTreeSet<Name> {
        self.annotated(AnnotationCategory::Class, annotation, policies)
    }

    pub fn get_annotated_packages(&self, annotation: &str, policies: ScanPolicies) -> BTreeSet<Name> {
        self.annotated(AnnotationCategory::Package, annotation, policies)
    }

    pub fn get_classes_with_field_annotation(&self, annotation: &str, policies: ScanPolicies) -> BTreeSet<Name> {
        self.annotated(AnnotationCategory::Field, annotation, policies)
    }

    pub fn get_classes_with_method_annotation(&self, annotation: &str, policies: ScanPolicies) -> BTreeSet<Name> {
        self.annotated(AnnotationCategory::Method, annotation, policies)
    }

    /// Classes annotated in the declarer regions, together with every
    /// subclass, kept only when they lie in the inheritor regions.
    pub fn get_all_inherited_annotated_classes(
        &self,
        annotation: &str,
        declarers: ScanPolicies,
        inheritors: ScanPolicies,
    ) -> BTreeSet<Name> {
        let mut all = BTreeSet::new();
        for class in self.annotated(AnnotationCategory::Class, annotation, declarers) {
            all.extend(self.get_subclass_names(&class));
            all.insert(class);
        }
        all.into_iter()
            .filter(|class| self.policy_of(class).is_some_and(|p| p.accept(inheritors)))
            .collect()
    }

    pub fn direct_subclasses(&self) -> &BTreeMap<Name, BTreeSet<Name>> {
        &self.subclasses
    }

    pub fn direct_implementers(&self) -> &BTreeMap<Name, BTreeSet<Name>> {
        &self.implementers
    }

    /// Every class below `superclass_name`, at any depth.
    pub fn get_subclass_names(&self, superclass_name: &str) -> BTreeSet<Name> {
        let mut found = BTreeSet::new();
        let mut pending: VecDeque<&str> = VecDeque::from([superclass_name]);
        while let Some(next) = pending.pop_front() {
            if let Some(direct) = self.subclasses.get(next) {
                for sub in direct {
                    if found.insert(Arc::clone(sub)) {
                        pending.push_back(sub);
                    }
                }
            }
        }
        found
    }

    /// Every non-interface class implementing `interface_name`, directly,
    /// through a subinterface, or by inheriting from an implementing class.
    pub fn get_all_implementors_of(&self, interface_name: &str) -> BTreeSet<Name> {
        let mut reached: BTreeSet<Name> = BTreeSet::new();
        let mut pending: VecDeque<&str> = VecDeque::from([interface_name]);
        while let Some(next) = pending.pop_front() {
            let implementers = self.implementers.get(next).into_iter().flatten();
            let subclasses = self.subclasses.get(next).into_iter().flatten();
            for candidate in implementers.chain(subclasses) {
                if reached.insert(Arc::clone(candidate)) {
                    pending.push_back(candidate);
                }
            }
        }
        reached.into_iter().filter(|c| !self.is_interface(c)).collect()
    }

    /// Superclass of every class in every region.
    pub fn get_superclass_names(&self) -> BTreeMap<Name, Name> {
        self.tables
            .iter()
            .flat_map(|t| t.superclasses().iter())
            .map(|(sub, sup)| (Arc::clone(sub), Arc::clone(sup)))
            .collect()
    }

    pub fn get_superclass_name(&self, class_name: &str) -> Option<&Name> {
        self.tables.iter().find_map(|t| t.superclass_of(class_name))
    }

    pub fn get_interface_names(&self, class_name: &str) -> &[Name] {
        self.tables
            .iter()
            .find(|t| t.contains_class(class_name))
            .map(|t| t.interfaces_of(class_name))
            .unwrap_or(&[])
    }

    pub fn get_modifiers(&self, class_name: &str) -> Option<u16> {
        self.tables.iter().find_map(|t| t.modifiers_of(class_name))
    }

    pub fn is_interface(&self, class_name: &str) -> bool {
        self.get_modifiers(class_name)
            .is_some_and(|m| m & ACC_INTERFACE != 0)
    }

    pub fn is_abstract(&self, class_name: &str) -> bool {
        self.get_modifiers(class_name)
            .is_some_and(|m| m & ACC_ABSTRACT != 0)
    }

    /// Whether `candidate` is `criterion` or reaches it through recorded
    /// supertypes. Interface edges are followed only for interface criteria.
    pub fn is_instance_of(&self, candidate: &str, criterion: &str, criterion_is_interface: bool) -> bool {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut pending: VecDeque<&str> = VecDeque::from([candidate]);
        while let Some(next) = pending.pop_front() {
            if next == criterion {
                return true;
            }
            if !seen.insert(next) {
                continue;
            }
            if let Some(sup) = self.get_superclass_name(next) {
                pending.push_back(sup);
            }
            if criterion_is_interface {
                pending.extend(self.get_interface_names(next).iter().map(|i| i.as_ref()));
            }
        }
        false
    }

    pub fn class_count(&self, policy: ScanPolicy) -> usize {
        self.table(policy).classes().len()
    }

    pub fn package_count(&self, policy: ScanPolicy) -> usize {
        self.table(policy).packages().len()
    }

    pub fn annotation_count(&self, policy: ScanPolicy, category: AnnotationCategory) -> usize {
        self.table(policy).annotations(category).pair_count()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(TargetsTable::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, sup: Option<&str>, interfaces: &[&str]) -> ClassRecord {
        ClassRecord {
            name: name.to_string(),
            superclass: sup.map(str::to_string),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            ..ClassRecord::default()
        }
    }

    fn interface(name: &str, supers: &[&str]) -> ClassRecord {
        ClassRecord {
            modifiers: ACC_INTERFACE | ACC_ABSTRACT,
            ..class(name, None, supers)
        }
    }

    fn fixture() -> Targets {
        let mut targets = Targets::new(Arc::new(InternMap::new("t")));
        let mut base = class("a.Base", None, &["a.Service"]);
        base.class_annotations.push("a.A".to_string());
        targets.record(ScanPolicy::Seed, Some("app"), &base);
        targets.record(ScanPolicy::Seed, Some("app"), &class("a.Mid", Some("a.Base"), &[]));
        targets.record(ScanPolicy::Partial, Some("lib"), &class("a.Leaf", Some("a.Mid"), &[]));
        targets.record(ScanPolicy::Seed, Some("app"), &class("a.Other", None, &["a.Sub"]));
        targets.record(ScanPolicy::External, None, &interface("a.Service", &[]));
        targets.record(ScanPolicy::External, None, &interface("a.Sub", &["a.Service"]));
        targets
    }

    fn names(set: &BTreeSet<Name>) -> Vec<&str> {
        set.iter().map(|n| n.as_ref()).collect()
    }

    #[test]
    fn first_region_keeps_the_class() {
        let mut targets = fixture();
        assert!(!targets.record(ScanPolicy::Partial, Some("lib"), &class("a.Base", None, &[])));
        assert_eq!(targets.policy_of("a.Base"), Some(ScanPolicy::Seed));
        assert!(!targets.is_partial_class_name("a.Base"));
    }

    #[test]
    fn subclass_names_are_transitive() {
        let targets = fixture();
        assert_eq!(names(&targets.get_subclass_names("a.Base")), vec!["a.Leaf", "a.Mid"]);
        assert!(targets.get_subclass_names("a.Leaf").is_empty());
    }

    #[test]
    fn implementors_follow_subinterfaces_and_subclasses() {
        let targets = fixture();
        assert_eq!(
            names(&targets.get_all_implementors_of("a.Service")),
            vec!["a.Base", "a.Leaf", "a.Mid", "a.Other"]
        );
    }

    #[test]
    fn default_annotation_query_reads_seed_only() {
        let mut targets = fixture();
        let mut lib = class("a.Lib", None, &[]);
        lib.class_annotations.push("a.A".to_string());
        targets.record(ScanPolicy::Partial, Some("lib"), &lib);

        assert_eq!(names(&targets.get_annotated_classes("a.A")), vec!["a.Base"]);
        assert_eq!(
            names(&targets.get_annotated_classes_in("a.A", ScanPolicies::SEED | ScanPolicy::Partial)),
            vec!["a.Base", "a.Lib"]
        );
    }

    #[test]
    fn annotated_classes_narrow_to_one_source() {
        let mut targets = fixture();
        let mut extra = class("b.Extra", None, &[]);
        extra.class_annotations.push("a.A".to_string());
        targets.record(ScanPolicy::Seed, Some("extra"), &extra);
        let mut lib = class("a.Lib", None, &[]);
        lib.class_annotations.push("a.A".to_string());
        targets.record(ScanPolicy::Partial, Some("lib"), &lib);

        assert_eq!(names(&targets.get_annotated_classes("a.A")), vec!["a.Base", "b.Extra"]);
        assert_eq!(names(&targets.get_annotated_classes_of_source("app", "a.A")), vec!["a.Base"]);
        assert_eq!(names(&targets.get_annotated_classes_of_source("extra", "a.A")), vec!["b.Extra"]);
        assert!(targets.get_annotated_classes_of_source("lib", "a.A").is_empty());
        assert!(targets.get_annotated_classes_of_source("missing", "a.A").is_empty());
    }

    #[test]
    fn inherited_annotations_respect_inheritor_region() {
        let targets = fixture();
        assert_eq!(
            names(&targets.get_all_inherited_annotated_classes("a.A", ScanPolicies::SEED, ScanPolicies::SEED)),
            vec!["a.Base", "a.Mid"]
        );
        assert_eq!(
            names(&targets.get_all_inherited_annotated_classes("a.A", ScanPolicies::SEED, ScanPolicies::ALL)),
            vec!["a.Base", "a.Leaf", "a.Mid"]
        );
    }

    #[test]
    fn instance_of_walks_supertypes() {
        let targets = fixture();
        assert!(targets.is_instance_of("a.Leaf", "a.Base", false));
        assert!(targets.is_instance_of("a.Leaf", "a.Service", true));
        assert!(targets.is_instance_of("a.Other", "a.Service", true));
        assert!(!targets.is_instance_of("a.Other", "a.Base", false));
        assert!(targets.is_interface("a.Sub"));
        assert!(targets.is_abstract("a.Sub"));
    }

    #[test]
    fn data_round_trip_keeps_indexes() {
        let targets = fixture();
        let rebuilt = Targets::from_data(Arc::new(InternMap::new("r")), &targets.to_data());
        assert_eq!(rebuilt.to_data(), targets.to_data());
        assert_eq!(rebuilt.get_subclass_names("a.Base"), targets.get_subclass_names("a.Base"));
        assert_eq!(rebuilt.get_class_names_of_source("lib").len(), 1);
    }
}
