//! Option cases and the scan / cache / validate cycle run for each.
//!
//! A `SuiteContext` owns everything shared between cases: the module's
//! source assembly, the cache root, a reference scan every case is compared
//! against, and the memoized result of each case by name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

use crate::assembly::{Annotations, AnnotationsError, LoadedTargets, SourceAssembly};
use crate::cache::{CacheError, CacheOptions, TargetCache};
use crate::delta::TargetsDelta;
use crate::encoding::CacheFormat;
use crate::fault::FaultReport;
use crate::intern::InternMap;
use crate::lazy::Memo;
use crate::message;
use crate::policy::{AnnotationCategory, ScanPolicy};
use crate::scan::ScanOptions;
use crate::targets::Targets;
use crate::timing::{Phase, PhaseTiming, TimingData};
use crate::validate::{CycleError, CycleState, ValidationCycle, validate_origins, validate_targets};

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error(transparent)]
    Annotations(#[from] AnnotationsError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}

/// Differences tolerated when comparing a case against the reference scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOptions {
    pub ignore_missing_packages: bool,
    pub ignore_missing_interfaces: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseOptions {
    pub name: String,
    pub scan: ScanOptions,
    pub cache: Option<CacheOptions>,
    pub validation: ValidationOptions,
}

impl CaseOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scan: ScanOptions::default(),
            cache: None,
            validation: ValidationOptions::default(),
        }
    }

    pub fn with_scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_validation(mut self, validation: ValidationOptions) -> Self {
        self.validation = validation;
        self
    }
}

/// The standard matrix: single and multi-threaded scans without a cache,
/// then a write case followed by a read case for every cache format, each
/// format under its own storage suffix.
pub fn standard_cases() -> Vec<CaseOptions> {
    let mut cases = vec![
        CaseOptions::new("scan-single").with_scan(ScanOptions {
            scan_threads: 1,
            ..ScanOptions::default()
        }),
        CaseOptions::new("scan-multi").with_scan(ScanOptions {
            scan_threads: 8,
            ..ScanOptions::default()
        }),
    ];
    for format in [CacheFormat::Plain, CacheFormat::Jandex, CacheFormat::Binary] {
        for (step, clean) in [("write", true), ("read", false)] {
            let cache = CacheOptions {
                storage_suffix: format.tag().to_string(),
                clean_storage: clean,
                use_jandex_format: format == CacheFormat::Jandex,
                use_binary_format: format == CacheFormat::Binary,
                ..CacheOptions::default()
            };
            cases.push(CaseOptions::new(format!("{}-{step}", format.tag())).with_cache(cache));
        }
    }
    cases
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegionCounts {
    pub classes: usize,
    pub packages: usize,
    pub annotations: BTreeMap<AnnotationCategory, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub name: String,
    pub options: CaseOptions,
    pub state: CycleState,
    pub cache_hit: bool,
    pub cache_written: bool,
    pub malformed: u64,
    pub intern_size: usize,
    pub intern_total_length: usize,
    pub counts: BTreeMap<ScanPolicy, RegionCounts>,
    pub timing: BTreeMap<Phase, PhaseTiming>,
    pub faults: Vec<FaultReport>,
}

impl CaseResult {
    pub fn passed(&self) -> bool {
        self.state == CycleState::Passed
    }
}

pub fn region_counts(targets: &Targets) -> BTreeMap<ScanPolicy, RegionCounts> {
    ScanPolicy::ALL
        .into_iter()
        .map(|policy| {
            let annotations = AnnotationCategory::ALL
                .into_iter()
                .map(|c| (c, targets.annotation_count(policy, c)))
                .collect();
            let counts = RegionCounts {
                classes: targets.class_count(policy),
                packages: targets.package_count(policy),
                annotations,
            };
            (policy, counts)
        })
        .collect()
}

pub struct SuiteContext {
    assembly: Arc<dyn SourceAssembly>,
    cache_root: PathBuf,
    reference: Annotations,
    results: Mutex<BTreeMap<String, Arc<Memo<CaseResult>>>>,
}

impl SuiteContext {
    pub fn new(assembly: Arc<dyn SourceAssembly>, cache_root: impl Into<PathBuf>) -> Self {
        let reference = Annotations::new(Arc::clone(&assembly), ScanOptions::default(), None);
        Self {
            assembly,
            cache_root: cache_root.into(),
            reference,
            results: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// The single-threaded, uncached scan every case is compared against.
    pub fn reference(&self) -> Result<Arc<LoadedTargets>, SuiteError> {
        Ok(self.reference.get_targets()?)
    }

    fn slot(&self, name: &str) -> Arc<Memo<CaseResult>> {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(results.entry(name.to_string()).or_default())
    }

    /// Runs the case once; later calls with the same name return the
    /// stored result until `release`.
    pub fn result(&self, case: &CaseOptions) -> Result<Arc<CaseResult>, SuiteError> {
        self.slot(&case.name).get_or_try_init(|| self.run_case(case))
    }

    pub fn run_all(&self, cases: &[CaseOptions]) -> Result<Vec<Arc<CaseResult>>, SuiteError> {
        cases.iter().map(|case| self.result(case)).collect()
    }

    pub fn release(&self, name: &str) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results.remove(name);
    }

    /// Drops every stored result and the reference scan.
    pub fn release_all(&self) {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.reference.release();
    }

    fn run_case(&self, case: &CaseOptions) -> Result<CaseResult, SuiteError> {
        info!("running case [{}]", case.name);
        let mut cycle = ValidationCycle::new();

        cycle.begin_scan()?;
        let cache = match &case.cache {
            Some(options) => Some(TargetCache::open(&self.cache_root, options.clone())?),
            None => None,
        };
        let annotations = Annotations::new(Arc::clone(&self.assembly), case.scan, cache);
        let aggregate = annotations.get_class_source()?;
        let loaded = annotations.get_targets()?;
        cycle.finish_scan()?;

        cycle.begin_validation()?;
        let targets = &loaded.targets;
        {
            let faults = cycle.fault_sink()?;
            validate_targets(targets, faults);
            validate_origins(targets, &aggregate, faults);
        }

        let reference = self.reference()?;
        let delta = TargetsDelta::subtract(targets, &reference.targets);
        let ValidationOptions {
            ignore_missing_packages,
            ignore_missing_interfaces,
        } = case.validation;
        for difference in delta.differences(&case.name, ignore_missing_packages, ignore_missing_interfaces) {
            cycle.record_fault(difference)?;
        }

        if loaded.cache_written
            && let Some(cache) = annotations.cache()
        {
            let reread = cache.read(
                Arc::new(InternMap::new("reread")),
                &loaded.stamp,
                &TimingData::new(),
            );
            match reread {
                Some(reread) => {
                    let label = format!("{} cache", case.name);
                    for difference in TargetsDelta::subtract(&reread, targets).differences(&label, false, false) {
                        cycle.record_fault(difference)?;
                    }
                }
                None => cycle.record_fault(message!(
                    "[ {0} ] cache written to [ {1} ] could not be read back",
                    case.name,
                    cache.dir().display()
                ))?,
            }
        }

        let state = cycle.finish()?;
        info!("case [{}] {:?}", case.name, state);

        let names = targets.names();
        Ok(CaseResult {
            name: case.name.clone(),
            options: case.clone(),
            state,
            cache_hit: loaded.from_cache,
            cache_written: loaded.cache_written,
            malformed: loaded.malformed,
            intern_size: names.size(),
            intern_total_length: names.total_length(),
            counts: region_counts(targets),
            timing: annotations.timing_data().snapshot(),
            faults: cycle.faults().iter().map(FaultReport::from).collect(),
        })
    }
}
