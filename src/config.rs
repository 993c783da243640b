use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::assembly::{GenericAssembly, SourceAssembly, SourceSpec, WebModuleAssembly};
use crate::cache::CacheOptions;
use crate::cli::{CacheArgs, Cli, ScanArgs, SourceArgs, ValidationArgs};
use crate::policy::ScanPolicy;
use crate::scan::ScanOptions;
use crate::suite::ValidationOptions;

pub const CACHE_DIR_ENV: &str = "ANNOCACHE_DIR";

pub fn resolve_cache_root(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.cache_dir.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var(CACHE_DIR_ENV)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    annocache_home()
}

fn annocache_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("annocache"))
}

/// Parses `PATH[#PREFIX]`. The path must exist.
pub fn parse_source_spec(raw: &str, policy: ScanPolicy) -> Result<SourceSpec> {
    let (path, prefix) = match raw.rsplit_once('#') {
        Some((path, prefix)) => (path, prefix),
        None => (raw, ""),
    };
    if path.is_empty() {
        anyhow::bail!("Empty path in {policy} source: {raw:?}");
    }

    let path = PathBuf::from(path);
    std::fs::metadata(&path)
        .with_context(|| format!("Failed to open {policy} source: {}", path.display()))?;

    Ok(SourceSpec::new(path, policy).with_prefix(prefix))
}

pub fn build_assembly(args: &SourceArgs) -> Result<Arc<dyn SourceAssembly>> {
    let externals = parse_all(&args.external, ScanPolicy::External)?;

    if let Some(war) = &args.war {
        if !args.seed.is_empty() || !args.partial.is_empty() || !args.excluded.is_empty() {
            anyhow::bail!("--war cannot be combined with --seed, --partial or --excluded");
        }
        if !war.is_dir() {
            anyhow::bail!("Web module root is not a directory: {}", war.display());
        }
        let assembly = externals
            .into_iter()
            .fold(WebModuleAssembly::new(&args.module, war), |assembly, spec| {
                assembly.with_external(spec)
            });
        return Ok(Arc::new(assembly));
    }

    let mut specs = parse_all(&args.seed, ScanPolicy::Seed)?;
    specs.extend(parse_all(&args.partial, ScanPolicy::Partial)?);
    specs.extend(parse_all(&args.excluded, ScanPolicy::Excluded)?);
    if specs.is_empty() {
        anyhow::bail!("No internal class sources: use --seed, --partial, --excluded or --war");
    }
    specs.extend(externals);

    Ok(Arc::new(GenericAssembly::new(&args.module, specs)))
}

fn parse_all(raws: &[String], policy: ScanPolicy) -> Result<Vec<SourceSpec>> {
    raws.iter().map(|raw| parse_source_spec(raw, policy)).collect()
}

pub fn scan_options(args: &ScanArgs) -> ScanOptions {
    ScanOptions {
        use_jandex: args.jandex,
        scan_threads: args.scan_threads,
        strict: args.strict,
        limited: args.limited,
    }
}

/// `None` when caching is switched off.
pub fn cache_options(args: &CacheArgs) -> Option<CacheOptions> {
    if args.no_cache {
        return None;
    }
    Some(CacheOptions {
        storage_suffix: args.suffix.clone(),
        clean_storage: args.clean,
        read_only: args.read_only,
        always_valid: args.always_valid,
        write_threads: args.write_threads,
        use_jandex_format: args.jandex_format,
        use_binary_format: args.binary_format,
    })
}

pub fn validation_options(args: &ValidationArgs) -> ValidationOptions {
    ValidationOptions {
        ignore_missing_packages: args.ignore_missing_packages,
        ignore_missing_interfaces: args.ignore_missing_interfaces,
    }
}

/// Where `index` writes: `<dir>/<prefix>/META-INF/jandex.json`.
pub fn index_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(crate::source::normalize_prefix(prefix))
        .join(crate::source::JANDEX_INDEX)
}
