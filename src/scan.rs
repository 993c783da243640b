//! Aggregate scanner: decodes every internal source on a bounded worker
//! pool, merges the results in source order and then resolves referenced
//! supertypes that no internal source defines.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classfile::{ClassDecoder, ClassParseError, ClassRecord};
use crate::intern::InternMap;
use crate::policy::ScanPolicy;
use crate::source::{
    ClassSource, ClassSourceAggregate, JANDEX_INDEX, SourceError, decode_index, resource_to_class_name,
};
use crate::targets::Targets;
use crate::timing::{Phase, TimingData};

/// Thread-count sentinel meaning one worker per available processor.
pub const UNBOUNDED_THREADS: i32 = -1;
pub const MAX_THREADS: usize = 64;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("malformed class [{resource}] in source [{source_name}]: {cause}")]
    Malformed {
        source_name: String,
        resource: String,
        #[source]
        cause: ClassParseError,
    },
    #[error("failed to build scan thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Read `META-INF/jandex.json` instead of class bytes when a source has one.
    pub use_jandex: bool,
    /// `0` or negative: one per processor. Otherwise an upper bound.
    pub scan_threads: i32,
    /// Fail the scan on a malformed class instead of recording it as excluded.
    pub strict: bool,
    /// Seed sources only: no other region, no external resolution, no cache.
    #[serde(default)]
    pub limited: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            use_jandex: false,
            scan_threads: 1,
            strict: false,
            limited: false,
        }
    }
}

impl ScanOptions {
    /// Stamp of the targets these options produce from sources stamped
    /// `sources_stamp`. Thread count never changes the targets and is not
    /// part of it.
    pub fn stamp(&self, sources_stamp: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sources_stamp.as_bytes());
        hasher.update(
            format!(
                "|jandex={}|strict={}|limited={}",
                self.use_jandex, self.strict, self.limited
            )
            .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }
}

pub fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_THREADS)
}

pub fn resolve_scan_threads(requested: i32) -> usize {
    if requested <= 0 {
        available_threads()
    } else {
        (requested as usize).min(MAX_THREADS)
    }
}

struct SourceScan {
    source_name: String,
    policy: ScanPolicy,
    records: Vec<ClassRecord>,
    malformed: Vec<String>,
    via_index: bool,
    elapsed: Duration,
}

pub struct Scanner<'a> {
    aggregate: &'a ClassSourceAggregate,
    options: ScanOptions,
    decoder: &'a dyn ClassDecoder,
    timing: TimingData,
    malformed: AtomicU64,
}

impl<'a> Scanner<'a> {
    pub fn new(aggregate: &'a ClassSourceAggregate, options: ScanOptions, decoder: &'a dyn ClassDecoder) -> Self {
        Self {
            aggregate,
            options,
            decoder,
            timing: TimingData::new(),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn timing_data(&self) -> &TimingData {
        &self.timing
    }

    /// Class entries skipped because they could not be read or decoded.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Scans every internal source, then resolves external references.
    /// Blocks until all workers have finished.
    pub fn scan(&self, names: Arc<InternMap>) -> Result<Targets, ScanError> {
        let internal: Vec<&dyn ClassSource> = self.aggregate.internal_sources().collect();
        let (mut targets, referenced) = self.scan_sources(names, &internal)?;

        let external: Vec<&dyn ClassSource> = self.aggregate.external_sources().collect();
        self.resolve(&mut targets, referenced, &external, Phase::ExternalRead)?;
        self.log_counts(&targets);
        Ok(targets)
    }

    /// Scans the seed sources alone. Supertypes they reference are left
    /// unrecorded.
    pub fn scan_limited(&self, names: Arc<InternMap>) -> Result<Targets, ScanError> {
        let seed: Vec<&dyn ClassSource> = self
            .aggregate
            .internal_sources()
            .filter(|s| s.policy() == ScanPolicy::Seed)
            .collect();
        let (targets, _) = self.scan_sources(names, &seed)?;
        self.log_counts(&targets);
        Ok(targets)
    }

    /// Decodes `sources` on the worker pool and records them in order.
    /// Returns the targets and every supertype the recorded classes name.
    fn scan_sources(
        &self,
        names: Arc<InternMap>,
        sources: &[&dyn ClassSource],
    ) -> Result<(Targets, BTreeSet<String>), ScanError> {
        let threads = resolve_scan_threads(self.options.scan_threads);
        info!(
            "scanning [{}]: {} sources on {} threads",
            self.aggregate.name(),
            sources.len(),
            threads
        );

        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
        let scans: Vec<SourceScan> = pool.install(|| {
            sources
                .par_iter()
                .map(|source| self.decode_source(*source, &names))
                .collect::<Result<Vec<_>, ScanError>>()
        })?;

        let mut targets = Targets::new(names);
        let mut referenced = BTreeSet::new();
        for scan in scans {
            let phase = if scan.via_index { Phase::JandexRead } else { Phase::Scan };
            let mut recorded = 0u64;
            for record in &scan.records {
                if targets.record(scan.policy, Some(&scan.source_name), record) {
                    recorded += 1;
                    referenced.extend(record.referenced_supertypes().map(str::to_string));
                } else {
                    debug!("[{}] {} already recorded by an earlier source", scan.source_name, record.name);
                }
            }
            for class_name in &scan.malformed {
                if targets.record(ScanPolicy::Excluded, Some(&scan.source_name), &ClassRecord::name_only(class_name)) {
                    recorded += 1;
                }
            }
            self.timing.add(phase, 1, scan.elapsed, recorded);
        }
        Ok((targets, referenced))
    }

    fn log_counts(&self, targets: &Targets) {
        info!(
            "scanned [{}]: seed={} partial={} excluded={} external={} malformed={}",
            self.aggregate.name(),
            targets.class_count(ScanPolicy::Seed),
            targets.class_count(ScanPolicy::Partial),
            targets.class_count(ScanPolicy::Excluded),
            targets.class_count(ScanPolicy::External),
            self.malformed_count()
        );
    }

    /// Records only the named classes and the supertypes reachable from
    /// them. Each name is owned by the first source, in aggregate order,
    /// that can supply it.
    pub fn scan_specific<S: AsRef<str>>(&self, names: Arc<InternMap>, class_names: &[S]) -> Result<Targets, ScanError> {
        let search: Vec<&dyn ClassSource> = self
            .aggregate
            .internal_sources()
            .chain(self.aggregate.external_sources())
            .collect();
        info!(
            "scanning [{}] for {} specific classes",
            self.aggregate.name(),
            class_names.len()
        );

        let mut targets = Targets::new(names);
        let pending = class_names.iter().map(|n| n.as_ref().to_string()).collect();
        self.resolve(&mut targets, pending, &search, Phase::Scan)?;
        Ok(targets)
    }

    fn decode_source(&self, source: &dyn ClassSource, names: &InternMap) -> Result<SourceScan, ScanError> {
        let start = Instant::now();

        if self.options.use_jandex {
            if let Some(bytes) = source.resource(JANDEX_INDEX)? {
                match decode_index(&bytes) {
                    Ok(records) => {
                        for record in &records {
                            intern_record(names, record);
                        }
                        debug!("[{}] read {} classes from index", source.name(), records.len());
                        return Ok(SourceScan {
                            source_name: source.name().to_string(),
                            policy: source.policy(),
                            records,
                            malformed: Vec::new(),
                            via_index: true,
                            elapsed: start.elapsed(),
                        });
                    }
                    Err(e) => warn!("[{}] ignoring unreadable {JANDEX_INDEX}: {e}", source.name()),
                }
            }
        }

        let listing = source.entries()?;
        let mut records = Vec::with_capacity(listing.entries.len());
        let mut malformed = Vec::new();

        for resource in &listing.unreadable {
            warn!("[{}] unreadable entry {resource}", source.name());
            self.malformed.fetch_add(1, Ordering::Relaxed);
            malformed.extend(resource_to_class_name(resource));
        }

        for entry in listing.entries {
            match self.decoder.decode(&entry.bytes) {
                Ok(record) => {
                    intern_record(names, &record);
                    records.push(record);
                }
                Err(cause) if self.options.strict => {
                    return Err(ScanError::Malformed {
                        source_name: source.name().to_string(),
                        resource: entry.resource,
                        cause,
                    });
                }
                Err(cause) => {
                    warn!("[{}] skipping malformed {}: {cause}", source.name(), entry.resource);
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    malformed.push(entry.class_name);
                }
            }
        }

        debug!("[{}] decoded {} classes", source.name(), records.len());
        Ok(SourceScan {
            source_name: source.name().to_string(),
            policy: source.policy(),
            records,
            malformed,
            via_index: false,
            elapsed: start.elapsed(),
        })
    }

    /// Worklist over class names not yet recorded. Each is looked up in
    /// `search` order; whatever no source supplies is recorded as an
    /// external name with no data.
    fn resolve(
        &self,
        targets: &mut Targets,
        mut pending: BTreeSet<String>,
        search: &[&dyn ClassSource],
        phase: Phase,
    ) -> Result<(), ScanError> {
        let start = Instant::now();
        let mut resolved = 0u64;

        while let Some(class_name) = pending.pop_first() {
            if targets.policy_of(&class_name).is_some() {
                continue;
            }

            let mut found = None;
            for source in search {
                if let Some(bytes) = source.lookup(&class_name)? {
                    found = Some((*source, bytes));
                    break;
                }
            }

            let Some((source, bytes)) = found else {
                targets.record(ScanPolicy::External, None, &ClassRecord::name_only(&class_name));
                continue;
            };

            match self.decoder.decode(&bytes) {
                Ok(record) if record.name == class_name => {
                    targets.record(source.policy(), Some(source.name()), &record);
                    pending.extend(
                        record
                            .referenced_supertypes()
                            .filter(|s| targets.policy_of(s).is_none())
                            .map(str::to_string),
                    );
                    resolved += 1;
                }
                Ok(record) => {
                    warn!(
                        "[{}] {class_name} resolved to a class named {}",
                        source.name(),
                        record.name
                    );
                    targets.record(ScanPolicy::External, None, &ClassRecord::name_only(&class_name));
                }
                Err(cause) if self.options.strict => {
                    return Err(ScanError::Malformed {
                        source_name: source.name().to_string(),
                        resource: class_name,
                        cause,
                    });
                }
                Err(cause) => {
                    warn!("[{}] skipping malformed {class_name}: {cause}", source.name());
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    let policy = match source.policy() {
                        ScanPolicy::External => ScanPolicy::External,
                        _ => ScanPolicy::Excluded,
                    };
                    targets.record(policy, Some(source.name()), &ClassRecord::name_only(&class_name));
                }
            }
        }

        self.timing.add(phase, search.len() as u64, start.elapsed(), resolved);
        Ok(())
    }
}

fn intern_record(names: &InternMap, record: &ClassRecord) {
    if !record.is_package_info() {
        names.force(&record.name);
    }
    for name in record
        .referenced_supertypes()
        .chain(record.class_annotations.iter().map(String::as_str))
        .chain(record.field_annotations.iter().map(String::as_str))
        .chain(record.method_annotations.iter().map(String::as_str))
    {
        names.force(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ClassfileDecoder;
    use crate::classfile::fixture::ClassBytes;
    use crate::source::{MemorySource, encode_index};

    fn aggregate() -> ClassSourceAggregate {
        let mut aggregate = ClassSourceAggregate::new("app");
        aggregate
            .add(
                MemorySource::new("classes", ScanPolicy::Seed)
                    .with_class(
                        "com.example.Foo",
                        ClassBytes::class("com.example.Foo")
                            .extends("com.example.Base")
                            .implements("com.example.Bar")
                            .annotated("A")
                            .build(),
                    )
                    .with_class("com.example.Base", ClassBytes::class("com.example.Base").build())
                    .with_class("com.example.Broken", vec![0xCA, 0xFE]),
            )
            .unwrap();
        aggregate
            .add(
                MemorySource::new("lib", ScanPolicy::Partial)
                    .with_class("com.example.Base", ClassBytes::class("com.example.Base").build())
                    .with_class("lib.Util", ClassBytes::class("lib.Util").build()),
            )
            .unwrap();
        aggregate
            .add(
                MemorySource::new("jdk", ScanPolicy::External).with_class(
                    "com.example.Bar",
                    ClassBytes::interface("com.example.Bar")
                        .implements("com.example.Root")
                        .build(),
                ),
            )
            .unwrap();
        aggregate
    }

    #[test]
    fn thread_sentinels_resolve() {
        assert_eq!(resolve_scan_threads(1), 1);
        assert_eq!(resolve_scan_threads(500), MAX_THREADS);
        assert_eq!(resolve_scan_threads(0), available_threads());
        assert_eq!(resolve_scan_threads(UNBOUNDED_THREADS), available_threads());
    }

    #[test]
    fn scan_partitions_by_source_order() {
        let aggregate = aggregate();
        let scanner = Scanner::new(&aggregate, ScanOptions::default(), &ClassfileDecoder);
        let targets = scanner.scan(Arc::new(InternMap::new("t"))).unwrap();

        assert!(targets.is_seed_class_name("com.example.Foo"));
        assert!(targets.is_seed_class_name("com.example.Base"));
        assert!(!targets.is_partial_class_name("com.example.Base"));
        assert!(targets.is_partial_class_name("lib.Util"));
        assert!(targets.is_excluded_class_name("com.example.Broken"));
        assert!(targets.is_external_class_name("com.example.Bar"));
        assert!(targets.is_external_class_name("com.example.Root"));
        assert_eq!(scanner.malformed_count(), 1);

        let annotated = targets.get_annotated_classes("A");
        assert_eq!(annotated.len(), 1);
        assert!(annotated.contains("com.example.Foo"));
        assert_eq!(scanner.timing_data().get(Phase::Scan).sources, 2);
        assert_eq!(scanner.timing_data().get(Phase::ExternalRead).classes, 1);
    }

    #[test]
    fn strict_scan_rejects_malformed_classes() {
        let aggregate = aggregate();
        let options = ScanOptions {
            strict: true,
            ..ScanOptions::default()
        };
        let scanner = Scanner::new(&aggregate, options, &ClassfileDecoder);
        let err = scanner.scan(Arc::new(InternMap::new("t"))).unwrap_err();
        assert!(matches!(err, ScanError::Malformed { .. }));
    }

    #[test]
    fn specific_scan_records_reachable_supertypes_only() {
        let aggregate = aggregate();
        let scanner = Scanner::new(&aggregate, ScanOptions::default(), &ClassfileDecoder);
        let targets = scanner
            .scan_specific(Arc::new(InternMap::new("t")), &["com.example.Foo"])
            .unwrap();

        assert!(targets.is_seed_class_name("com.example.Foo"));
        assert!(targets.is_seed_class_name("com.example.Base"));
        assert!(targets.is_external_class_name("com.example.Bar"));
        assert!(!targets.is_partial_class_name("lib.Util"));
    }

    #[test]
    fn limited_scan_reads_seed_sources_only() {
        let aggregate = aggregate();
        let scanner = Scanner::new(&aggregate, ScanOptions::default(), &ClassfileDecoder);
        let targets = scanner.scan_limited(Arc::new(InternMap::new("t"))).unwrap();

        assert!(targets.is_seed_class_name("com.example.Foo"));
        assert!(targets.is_seed_class_name("com.example.Base"));
        assert!(targets.is_excluded_class_name("com.example.Broken"));
        assert!(!targets.is_partial_class_name("lib.Util"));
        assert!(!targets.is_external_class_name("com.example.Bar"));
        assert_eq!(targets.class_count(ScanPolicy::External), 0);
        assert_eq!(targets.get_annotated_classes("A").len(), 1);
        assert_eq!(scanner.timing_data().get(Phase::ExternalRead).sources, 0);
    }

    #[test]
    fn stamp_tracks_options_that_change_targets() {
        let base = ScanOptions::default();
        let threaded = ScanOptions {
            scan_threads: 8,
            ..base
        };
        let jandex = ScanOptions {
            use_jandex: true,
            ..base
        };
        let strict = ScanOptions { strict: true, ..base };
        let limited = ScanOptions { limited: true, ..base };

        assert_eq!(base.stamp("s"), threaded.stamp("s"));
        assert_ne!(base.stamp("s"), base.stamp("t"));
        for other in [jandex, strict, limited] {
            assert_ne!(base.stamp("s"), other.stamp("s"));
        }
    }

    #[test]
    fn jandex_index_replaces_bytecode() {
        let mut indexed = ClassRecord::name_only("idx.Indexed");
        indexed.class_annotations.push("A".to_string());
        let index = encode_index(&[indexed]).unwrap();

        let mut aggregate = ClassSourceAggregate::new("app");
        aggregate
            .add(
                MemorySource::new("classes", ScanPolicy::Seed)
                    .with_resource(JANDEX_INDEX, index)
                    .with_class("com.example.Foo", ClassBytes::class("com.example.Foo").build()),
            )
            .unwrap();

        let options = ScanOptions {
            use_jandex: true,
            ..ScanOptions::default()
        };
        let scanner = Scanner::new(&aggregate, options, &ClassfileDecoder);
        let targets = scanner.scan(Arc::new(InternMap::new("t"))).unwrap();
        assert!(targets.is_seed_class_name("idx.Indexed"));
        assert!(!targets.is_seed_class_name("com.example.Foo"));
        assert_eq!(scanner.timing_data().get(Phase::JandexRead).sources, 1);
    }
}
