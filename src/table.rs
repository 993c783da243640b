//! One scan-policy region of the targets index.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::bidi::BidiMap;
use crate::classfile::{ClassRecord, PACKAGE_INFO};
use crate::intern::{InternMap, Name};
use crate::policy::{AnnotationCategory, ScanPolicy};

#[derive(Debug, Clone)]
pub struct TargetsTable {
    policy: ScanPolicy,
    names: Arc<InternMap>,
    source_names: BTreeSet<Arc<str>>,
    class_origins: BTreeMap<Name, Arc<str>>,
    package_origins: BTreeMap<Name, Arc<str>>,
    classes: BTreeSet<Name>,
    packages: BTreeSet<Name>,
    superclasses: BTreeMap<Name, Name>,
    interfaces: BTreeMap<Name, Vec<Name>>,
    modifiers: BTreeMap<Name, u16>,
    package_annotations: BidiMap,
    class_annotations: BidiMap,
    field_annotations: BidiMap,
    method_annotations: BidiMap,
}

/// Serializable form of a table: one record per class or package-info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableData {
    pub policy: ScanPolicy,
    pub records: Vec<SourcedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedRecord {
    pub source: Option<String>,
    pub record: ClassRecord,
}

impl TargetsTable {
    pub fn new(policy: ScanPolicy, names: Arc<InternMap>) -> Self {
        Self {
            policy,
            names,
            source_names: BTreeSet::new(),
            class_origins: BTreeMap::new(),
            package_origins: BTreeMap::new(),
            classes: BTreeSet::new(),
            packages: BTreeSet::new(),
            superclasses: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            modifiers: BTreeMap::new(),
            package_annotations: BidiMap::new("package", "annotation"),
            class_annotations: BidiMap::new("class", "annotation"),
            field_annotations: BidiMap::new("class", "field annotation"),
            method_annotations: BidiMap::new("class", "method annotation"),
        }
    }

    pub fn policy(&self) -> ScanPolicy {
        self.policy
    }

    pub fn names(&self) -> &Arc<InternMap> {
        &self.names
    }

    fn source_handle(&mut self, source: &str) -> Arc<str> {
        if let Some(existing) = self.source_names.get(source) {
            return Arc::clone(existing);
        }
        let handle: Arc<str> = Arc::from(source);
        self.source_names.insert(Arc::clone(&handle));
        handle
    }

    /// Adds one decoded class. Package-info records become package entries.
    pub fn record(&mut self, source: Option<&str>, record: &ClassRecord) {
        let origin = source.map(|s| self.source_handle(s));

        if record.is_package_info() {
            let package = self.names.force(record.package_name());
            self.packages.insert(Arc::clone(&package));
            if let Some(origin) = origin {
                self.package_origins.insert(Arc::clone(&package), origin);
            }
            for ann in &record.class_annotations {
                let ann = self.names.force(ann);
                self.package_annotations.add(&package, &ann);
            }
            return;
        }

        let class = self.names.force(&record.name);
        self.classes.insert(Arc::clone(&class));
        if let Some(origin) = origin {
            self.class_origins.insert(Arc::clone(&class), origin);
        }
        if let Some(sup) = record.superclass.as_deref() {
            let sup = self.names.force(sup);
            self.superclasses.insert(Arc::clone(&class), sup);
        }
        if !record.interfaces.is_empty() {
            let interfaces = record.interfaces.iter().map(|i| self.names.force(i)).collect();
            self.interfaces.insert(Arc::clone(&class), interfaces);
        }
        self.modifiers.insert(Arc::clone(&class), record.modifiers);

        for ann in &record.class_annotations {
            let ann = self.names.force(ann);
            self.class_annotations.add(&class, &ann);
        }
        for ann in &record.field_annotations {
            let ann = self.names.force(ann);
            self.field_annotations.add(&class, &ann);
        }
        for ann in &record.method_annotations {
            let ann = self.names.force(ann);
            self.method_annotations.add(&class, &ann);
        }
    }

    pub fn contains_class(&self, class_name: &str) -> bool {
        self.classes.contains(class_name)
    }

    pub fn contains_package(&self, package_name: &str) -> bool {
        self.packages.contains(package_name)
    }

    pub fn classes(&self) -> &BTreeSet<Name> {
        &self.classes
    }

    pub fn packages(&self) -> &BTreeSet<Name> {
        &self.packages
    }

    pub fn superclasses(&self) -> &BTreeMap<Name, Name> {
        &self.superclasses
    }

    pub fn superclass_of(&self, class_name: &str) -> Option<&Name> {
        self.superclasses.get(class_name)
    }

    pub fn interfaces(&self) -> &BTreeMap<Name, Vec<Name>> {
        &self.interfaces
    }

    pub fn interfaces_of(&self, class_name: &str) -> &[Name] {
        self.interfaces
            .get(class_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn modifiers_of(&self, class_name: &str) -> Option<u16> {
        self.modifiers.get(class_name).copied()
    }

    pub fn class_origin(&self, class_name: &str) -> Option<&str> {
        self.class_origins.get(class_name).map(|s| s.as_ref())
    }

    /// Classes recorded from the named source.
    pub fn classes_of_source(&self, source: &str) -> impl Iterator<Item = &Name> {
        self.class_origins
            .iter()
            .filter(move |(_, origin)| origin.as_ref() == source)
            .map(|(class, _)| class)
    }

    pub fn annotations(&self, category: AnnotationCategory) -> &BidiMap {
        match category {
            AnnotationCategory::Package => &self.package_annotations,
            AnnotationCategory::Class => &self.class_annotations,
            AnnotationCategory::Field => &self.field_annotations,
            AnnotationCategory::Method => &self.method_annotations,
        }
    }

    #[cfg(test)]
    pub(crate) fn annotations_mut(&mut self, category: AnnotationCategory) -> &mut BidiMap {
        match category {
            AnnotationCategory::Package => &mut self.package_annotations,
            AnnotationCategory::Class => &mut self.class_annotations,
            AnnotationCategory::Field => &mut self.field_annotations,
            AnnotationCategory::Method => &mut self.method_annotations,
        }
    }

    /// Visits every stored name together with where it is stored.
    pub fn for_each_name(&self, mut visit: impl FnMut(&'static str, &Name)) {
        for class in &self.classes {
            visit("class", class);
        }
        for package in &self.packages {
            visit("package", package);
        }
        for (sub, sup) in &self.superclasses {
            visit("subclass", sub);
            visit("superclass", sup);
        }
        for (class, interfaces) in &self.interfaces {
            visit("implementer", class);
            for i in interfaces {
                visit("interface", i);
            }
        }
        for category in AnnotationCategory::ALL {
            let map = self.annotations(category);
            for (holder, held) in map.pairs() {
                visit(map.holder_tag(), holder);
                visit(map.held_tag(), held);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.packages.is_empty()
    }

    pub fn to_data(&self) -> TableData {
        let held = |map: &BidiMap, holder: &str| -> Vec<String> {
            map.select_held_of(holder)
                .map(|set| set.iter().map(|n| n.to_string()).collect())
                .unwrap_or_default()
        };

        let mut records = Vec::with_capacity(self.classes.len() + self.packages.len());
        for package in &self.packages {
            let name = if package.is_empty() {
                PACKAGE_INFO.to_string()
            } else {
                format!("{package}.{PACKAGE_INFO}")
            };
            records.push(SourcedRecord {
                source: self.package_origins.get(package).map(|s| s.to_string()),
                record: ClassRecord {
                    name,
                    class_annotations: held(&self.package_annotations, package),
                    ..ClassRecord::default()
                },
            });
        }
        for class in &self.classes {
            records.push(SourcedRecord {
                source: self.class_origins.get(class).map(|s| s.to_string()),
                record: ClassRecord {
                    name: class.to_string(),
                    superclass: self.superclasses.get(class).map(|s| s.to_string()),
                    interfaces: self
                        .interfaces_of(class)
                        .iter()
                        .map(|i| i.to_string())
                        .collect(),
                    modifiers: self.modifiers.get(class).copied().unwrap_or(0),
                    class_annotations: held(&self.class_annotations, class),
                    field_annotations: held(&self.field_annotations, class),
                    method_annotations: held(&self.method_annotations, class),
                },
            });
        }

        TableData {
            policy: self.policy,
            records,
        }
    }

    pub fn from_data(data: &TableData, names: Arc<InternMap>) -> Self {
        let mut table = Self::new(data.policy, names);
        for entry in &data.records {
            table.record(entry.source.as_deref(), &entry.record);
        }
        table
    }
}
