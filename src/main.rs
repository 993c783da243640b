use anyhow::{Context, Result};
use annocache::assembly::{Annotations, LoadedTargets, SourceAssembly};
use annocache::cache::{self, CacheOptions, TargetCache};
use annocache::classfile::{ClassDecoder, ClassRecord, ClassfileDecoder};
use annocache::cli::{Cli, Commands, Query, region_mask};
use annocache::config::{
    build_assembly, cache_options, index_path, resolve_cache_root, scan_options, validation_options,
};
use annocache::policy::{AnnotationCategory, ScanPolicies, ScanPolicy};
use annocache::source::{ClassSource, DirectorySource, encode_index};
use annocache::suite::{CaseOptions, CaseResult, RegionCounts, SuiteContext, region_counts, standard_cases};
use annocache::targets::Targets;
use annocache::timing::{Phase, PhaseTiming};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Clear { suffix } => {
            let root = resolve_cache_root(&cli)?;
            match suffix {
                Some(suffix) => {
                    let options = CacheOptions {
                        storage_suffix: suffix,
                        ..CacheOptions::default()
                    };
                    TargetCache::open(&root, options)?.clear()?;
                }
                None => cache::clear_root(&root)?,
            }
        }
        Commands::Stats => {
            let root = resolve_cache_root(&cli)?;
            let stats = cache::stats(&root)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Index { dir, prefix } => {
            let output = write_index(&dir, &prefix)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Scan {
            sources,
            scan,
            cache: cache_args,
        } => {
            let assembly = build_assembly(&sources)?;
            let annotations = open_annotations(&cli, assembly, scan_options(&scan), cache_options(&cache_args))?;
            let start = Instant::now();
            let loaded = annotations.get_targets()?;
            let output = ScanResult::new(&annotations, &loaded, start.elapsed().as_millis() as u64);
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Query {
            sources,
            scan,
            cache: cache_args,
            query_log,
            query,
        } => {
            let assembly = build_assembly(&sources)?;
            let annotations = open_annotations(&cli, assembly, scan_options(&scan), cache_options(&cache_args))?;
            let loaded = annotations.get_targets()?;
            let output = run_query(&loaded.targets, query);
            if let Some(path) = &query_log {
                append_query_log(path, &output)?;
            }
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Verify {
            sources,
            scan,
            cache: cache_args,
            validation,
            suite,
        } => {
            let assembly = build_assembly(&sources)?;
            let context = SuiteContext::new(assembly, resolve_cache_root(&cli)?);
            let validation = validation_options(&validation);

            let cases = if suite {
                standard_cases()
                    .into_iter()
                    .map(|case| case.with_validation(validation))
                    .collect()
            } else {
                let mut case = CaseOptions::new("verify")
                    .with_scan(scan_options(&scan))
                    .with_validation(validation);
                if let Some(options) = cache_options(&cache_args) {
                    case = case.with_cache(options);
                }
                vec![case]
            };

            let results = context.run_all(&cases)?;
            let passed = results.iter().all(|r| r.passed());
            let output = VerifyResult {
                passed,
                cases: results.iter().map(|r| r.as_ref()).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            if !passed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("annocache=info".parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn open_annotations(
    cli: &Cli,
    assembly: Arc<dyn SourceAssembly>,
    scan: annocache::scan::ScanOptions,
    cache: Option<CacheOptions>,
) -> Result<Annotations> {
    let cache = match cache {
        Some(options) => {
            let root = resolve_cache_root(cli)?;
            let cache = TargetCache::open(&root, options)
                .with_context(|| format!("Failed to open cache under {}", root.display()))?;
            Some(cache)
        }
        None => None,
    };
    Ok(Annotations::new(assembly, scan, cache))
}

#[derive(Debug, Serialize)]
struct ScanResult {
    module: String,
    cache_dir: Option<String>,
    stamp: String,
    cache_hit: bool,
    cache_written: bool,
    malformed: u64,
    intern_size: usize,
    intern_total_length: usize,
    counts: BTreeMap<ScanPolicy, RegionCounts>,
    timing: BTreeMap<Phase, PhaseTiming>,
    duration_ms: u64,
}

impl ScanResult {
    fn new(annotations: &Annotations, loaded: &LoadedTargets, duration_ms: u64) -> Self {
        let names = loaded.targets.names();
        Self {
            module: annotations.name().to_string(),
            cache_dir: annotations
                .cache()
                .map(|c| c.dir().to_string_lossy().to_string()),
            stamp: loaded.stamp.clone(),
            cache_hit: loaded.from_cache,
            cache_written: loaded.cache_written,
            malformed: loaded.malformed,
            intern_size: names.size(),
            intern_total_length: names.total_length(),
            counts: region_counts(&loaded.targets),
            timing: annotations.timing_data().snapshot(),
            duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifyResult<'a> {
    passed: bool,
    cases: Vec<&'a CaseResult>,
}

#[derive(Debug, Serialize)]
struct ClassInfo {
    class_name: String,
    policy: Option<ScanPolicy>,
    superclass: Option<String>,
    interfaces: Vec<String>,
    modifiers: Option<u16>,
    is_interface: bool,
    is_abstract: bool,
    annotations: BTreeMap<AnnotationCategory, Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum QueryResult {
    Names { query: String, names: Vec<String> },
    Class(ClassInfo),
}

fn names<'a>(it: impl IntoIterator<Item = &'a Arc<str>>) -> Vec<String> {
    it.into_iter().map(|n| n.to_string()).collect()
}

fn run_query(targets: &Targets, query: Query) -> QueryResult {
    let (label, found) = match query {
        Query::Annotated {
            annotation,
            category,
            regions,
            source,
        } => match source {
            Some(source) => (
                format!("annotated {annotation} of {source}"),
                targets.get_annotated_classes_of_source(&source, &annotation),
            ),
            None => (
                format!("annotated {annotation}"),
                targets.annotated(category.into(), &annotation, region_mask(&regions)),
            ),
        },
        Query::Inherited { annotation } => (
            format!("inherited {annotation}"),
            targets.get_all_inherited_annotated_classes(&annotation, ScanPolicies::SEED, ScanPolicies::SEED),
        ),
        Query::Implementors { interface } => (
            format!("implementors {interface}"),
            targets.get_all_implementors_of(&interface),
        ),
        Query::Subclasses { superclass } => (
            format!("subclasses {superclass}"),
            targets.get_subclass_names(&superclass),
        ),
        Query::Classes { regions, source } => match source {
            Some(source) => (
                format!("classes of {source}"),
                targets.get_class_names_of_source(&source),
            ),
            None => ("classes".to_string(), targets.get_class_names(region_mask(&regions))),
        },
        Query::Class { class_name } => return QueryResult::Class(class_info(targets, &class_name)),
    };
    QueryResult::Names {
        query: label,
        names: names(&found),
    }
}

fn append_query_log(path: &Path, output: &QueryResult) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open query log: {}", path.display()))?;
    let mut line = serde_json::to_vec(output)?;
    line.push(b'\n');
    file.write_all(&line)
        .with_context(|| format!("Failed to write query log: {}", path.display()))?;
    Ok(())
}

fn class_info(targets: &Targets, class_name: &str) -> ClassInfo {
    let annotations = AnnotationCategory::ALL
        .into_iter()
        .filter(|c| *c != AnnotationCategory::Package)
        .map(|c| (c, names(&targets.annotations_of(c, class_name, ScanPolicies::ALL))))
        .collect();
    ClassInfo {
        class_name: class_name.to_string(),
        policy: targets.policy_of(class_name),
        superclass: targets.get_superclass_name(class_name).map(|n| n.to_string()),
        interfaces: names(targets.get_interface_names(class_name)),
        modifiers: targets.get_modifiers(class_name),
        is_interface: targets.is_interface(class_name),
        is_abstract: targets.is_abstract(class_name),
        annotations,
    }
}

#[derive(Debug, Serialize)]
struct IndexResult {
    index_path: String,
    classes_indexed: usize,
    skipped: Vec<String>,
    duration_ms: u64,
}

fn write_index(dir: &Path, prefix: &str) -> Result<IndexResult> {
    let start = Instant::now();
    let source = DirectorySource::new(dir.to_string_lossy(), dir, ScanPolicy::Seed).with_prefix(prefix);
    let listed = source
        .entries()
        .with_context(|| format!("Failed to list classes under {}", dir.display()))?;

    let decoder = ClassfileDecoder;
    let mut records: Vec<ClassRecord> = Vec::with_capacity(listed.entries.len());
    let mut skipped = listed.unreadable;
    for entry in listed.entries {
        match decoder.decode(&entry.bytes) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("skipping {}: {e}", entry.resource);
                skipped.push(entry.resource);
            }
        }
    }

    let path = index_path(dir, prefix);
    let bytes = encode_index(&records).context("Failed to encode class index")?;
    publish_index(&path, &bytes)?;
    info!("indexed {} classes into {}", records.len(), path.display());

    Ok(IndexResult {
        index_path: path.to_string_lossy().to_string(),
        classes_indexed: records.len(),
        skipped,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn publish_index(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create index directory: {}", parent.display()))?;
    }

    let mut tmp_os = path.as_os_str().to_os_string();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("Failed to write index file: {}", tmp.display()))?;

    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to atomically replace index file: {}", path.display()))?;
    Ok(())
}
