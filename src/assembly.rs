//! How a module's class sources are put together, and the per-module
//! annotations object that lazily builds the aggregate and its targets.
//!
//! Variants differ only in how they assemble sources; scanning, caching
//! and release behave the same for all of them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheError, TargetCache};
use crate::classfile::{ClassDecoder, ClassfileDecoder};
use crate::intern::InternMap;
use crate::lazy::Memo;
use crate::policy::ScanPolicy;
use crate::scan::{ScanError, ScanOptions, Scanner};
use crate::source::{ClassSource, ClassSourceAggregate, DirectorySource, JarSource, SourceError};
use crate::targets::Targets;
use crate::timing::TimingData;

pub const WEB_CLASSES: &str = "WEB-INF/classes/";
pub const WEB_LIB: &str = "WEB-INF/lib";

#[derive(Debug, Error)]
pub enum AnnotationsError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// One configured class source: a directory or archive, its policy, and
/// the entry prefix its classes live under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub path: PathBuf,
    pub prefix: String,
    pub policy: ScanPolicy,
}

impl SourceSpec {
    pub fn new(path: impl Into<PathBuf>, policy: ScanPolicy) -> Self {
        let path = path.into();
        Self {
            name: path.to_string_lossy().to_string(),
            path,
            prefix: String::new(),
            policy,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        if !prefix.is_empty() {
            self.name = format!("{}#{}", self.name, prefix);
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn is_archive(&self) -> bool {
        self.path.is_file()
    }

    pub fn open(&self) -> Box<dyn ClassSource> {
        if self.is_archive() {
            Box::new(JarSource::new(&self.name, &self.path, self.policy).with_prefix(&self.prefix))
        } else {
            Box::new(DirectorySource::new(&self.name, &self.path, self.policy).with_prefix(&self.prefix))
        }
    }
}

pub trait SourceAssembly: Send + Sync {
    fn name(&self) -> &str;

    /// Builds the ordered aggregate: internal sources first, then external.
    fn assemble(&self) -> Result<ClassSourceAggregate, SourceError>;
}

/// Sources listed explicitly, kept in the given order.
#[derive(Debug, Clone)]
pub struct GenericAssembly {
    name: String,
    specs: Vec<SourceSpec>,
}

impl GenericAssembly {
    pub fn new(name: impl Into<String>, specs: Vec<SourceSpec>) -> Self {
        Self {
            name: name.into(),
            specs,
        }
    }
}

impl SourceAssembly for GenericAssembly {
    fn name(&self) -> &str {
        &self.name
    }

    fn assemble(&self) -> Result<ClassSourceAggregate, SourceError> {
        let mut aggregate = ClassSourceAggregate::new(&self.name);
        let internal = self.specs.iter().filter(|s| s.policy != ScanPolicy::External);
        let external = self.specs.iter().filter(|s| s.policy == ScanPolicy::External);
        for spec in internal.chain(external) {
            aggregate.add_boxed(spec.open())?;
        }
        Ok(aggregate)
    }
}

/// An exploded web module: `WEB-INF/classes/` is the seed, each jar under
/// `WEB-INF/lib` is partial, in file-name order.
#[derive(Debug, Clone)]
pub struct WebModuleAssembly {
    name: String,
    root: PathBuf,
    externals: Vec<SourceSpec>,
}

impl WebModuleAssembly {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            externals: Vec::new(),
        }
    }

    pub fn with_external(mut self, spec: SourceSpec) -> Self {
        self.externals.push(SourceSpec {
            policy: ScanPolicy::External,
            ..spec
        });
        self
    }

    fn lib_jars(&self) -> Result<Vec<PathBuf>, SourceError> {
        let lib = self.root.join(WEB_LIB);
        if !lib.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&lib).map_err(|cause| SourceError::Open {
            name: WEB_LIB.to_string(),
            path: lib.clone(),
            cause,
        })?;
        let mut jars: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|e| e == "jar"))
            .collect();
        jars.sort();
        Ok(jars)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl SourceAssembly for WebModuleAssembly {
    fn name(&self) -> &str {
        &self.name
    }

    fn assemble(&self) -> Result<ClassSourceAggregate, SourceError> {
        let mut aggregate = ClassSourceAggregate::new(&self.name);

        if self.root.join(WEB_CLASSES).is_dir() {
            aggregate.add(
                DirectorySource::new(WEB_CLASSES.trim_end_matches('/'), &self.root, ScanPolicy::Seed)
                    .with_prefix(WEB_CLASSES),
            )?;
        } else {
            debug!("[{}] has no {WEB_CLASSES}", self.name);
        }

        for jar in self.lib_jars()? {
            let name = format!("{WEB_LIB}/{}", file_name(&jar));
            aggregate.add(JarSource::new(name, &jar, ScanPolicy::Partial))?;
        }

        for spec in &self.externals {
            aggregate.add_boxed(spec.open())?;
        }
        Ok(aggregate)
    }
}

/// Targets together with how they were obtained.
#[derive(Debug)]
pub struct LoadedTargets {
    pub targets: Targets,
    pub stamp: String,
    pub from_cache: bool,
    pub cache_written: bool,
    pub malformed: u64,
}

/// Per-module access to the class source aggregate and its targets. Both
/// are computed on first use and kept until `release`.
pub struct Annotations {
    assembly: Arc<dyn SourceAssembly>,
    scan_options: ScanOptions,
    cache: Option<TargetCache>,
    decoder: Arc<dyn ClassDecoder>,
    class_source: Memo<ClassSourceAggregate>,
    targets: Memo<LoadedTargets>,
    timing: TimingData,
}

impl Annotations {
    pub fn new(assembly: Arc<dyn SourceAssembly>, scan_options: ScanOptions, cache: Option<TargetCache>) -> Self {
        Self {
            assembly,
            scan_options,
            cache,
            decoder: Arc::new(ClassfileDecoder),
            class_source: Memo::new(),
            targets: Memo::new(),
            timing: TimingData::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ClassDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn name(&self) -> &str {
        self.assembly.name()
    }

    pub fn cache(&self) -> Option<&TargetCache> {
        self.cache.as_ref()
    }

    pub fn timing_data(&self) -> &TimingData {
        &self.timing
    }

    pub fn get_class_source(&self) -> Result<Arc<ClassSourceAggregate>, AnnotationsError> {
        self.class_source
            .get_or_try_init(|| Ok(self.assembly.assemble()?))
    }

    /// Cached targets when the cache holds a usable copy, otherwise a fresh
    /// scan, written back unless the cache is read-only. Limited scans
    /// never touch the cache.
    pub fn get_targets(&self) -> Result<Arc<LoadedTargets>, AnnotationsError> {
        self.targets.get_or_try_init(|| self.load_targets())
    }

    fn load_targets(&self) -> Result<LoadedTargets, AnnotationsError> {
        let aggregate = self.get_class_source()?;
        let stamp = self.scan_options.stamp(&aggregate.stamp()?);
        let names = Arc::new(InternMap::new(aggregate.name()));
        let cache = self.cache.as_ref().filter(|_| !self.scan_options.limited);

        if let Some(cache) = cache
            && let Some(targets) = cache.read(Arc::clone(&names), &stamp, &self.timing)
        {
            return Ok(LoadedTargets {
                targets,
                stamp,
                from_cache: true,
                cache_written: false,
                malformed: 0,
            });
        }

        let scanner = Scanner::new(&aggregate, self.scan_options, self.decoder.as_ref());
        let targets = if self.scan_options.limited {
            scanner.scan_limited(names)?
        } else {
            scanner.scan(names)?
        };
        self.timing.absorb(scanner.timing_data());

        let cache_written = match cache {
            Some(cache) => cache.write(&targets, &stamp, &self.timing)?,
            None => false,
        };

        Ok(LoadedTargets {
            targets,
            stamp,
            from_cache: false,
            cache_written,
            malformed: scanner.malformed_count(),
        })
    }

    /// Drops the memoized aggregate and targets; the next access rebuilds.
    pub fn release(&self) {
        let targets = self.targets.release();
        let class_source = self.class_source.release();
        if targets.is_some() || class_source.is_some() {
            info!("[{}] released", self.assembly.name());
        }
    }
}
