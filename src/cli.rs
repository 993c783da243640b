use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::policy::{AnnotationCategory, ScanPolicies, ScanPolicy};

#[derive(Debug, Clone, Parser)]
#[command(name = "annocache")]
#[command(about = "Scan Java class sources into a cached annotation index and verify it")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Load targets (from the cache when usable) and print region counts.
    Scan {
        #[command(flatten)]
        sources: SourceArgs,
        #[command(flatten)]
        scan: ScanArgs,
        #[command(flatten)]
        cache: CacheArgs,
    },
    Query {
        #[command(flatten)]
        sources: SourceArgs,
        #[command(flatten)]
        scan: ScanArgs,
        #[command(flatten)]
        cache: CacheArgs,

        /// Append each query and its answer to FILE as one JSON line.
        #[arg(long, value_name = "FILE")]
        query_log: Option<PathBuf>,

        #[command(subcommand)]
        query: Query,
    },
    /// Run one scan / validate cycle, or the standard case matrix with `--suite`.
    Verify {
        #[command(flatten)]
        sources: SourceArgs,
        #[command(flatten)]
        scan: ScanArgs,
        #[command(flatten)]
        cache: CacheArgs,
        #[command(flatten)]
        validation: ValidationArgs,

        #[arg(long)]
        suite: bool,
    },
    /// Write a pre-built index (META-INF/jandex.json) for a class directory.
    Index {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, value_name = "PREFIX", default_value = "")]
        prefix: String,
    },
    Stats,
    Clear {
        #[arg(long, value_name = "SUFFIX")]
        suffix: Option<String>,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum Query {
    Annotated {
        annotation: String,

        #[arg(long, value_enum, default_value_t = CategoryArg::Class)]
        category: CategoryArg,

        #[arg(long = "region", value_enum)]
        regions: Vec<RegionArg>,

        /// Seed classes of one source only.
        #[arg(long, value_name = "SOURCE", conflicts_with_all = ["category", "regions"])]
        source: Option<String>,
    },
    /// Classes carrying the annotation plus all of their subclasses.
    Inherited {
        annotation: String,
    },
    Implementors {
        interface: String,
    },
    Subclasses {
        superclass: String,
    },
    Class {
        class_name: String,
    },
    Classes {
        #[arg(long = "region", value_enum)]
        regions: Vec<RegionArg>,

        #[arg(long, value_name = "SOURCE")]
        source: Option<String>,
    },
}

/// Class sources, each given as `PATH[#PREFIX]`.
#[derive(Debug, Clone, Default, Args)]
pub struct SourceArgs {
    #[arg(long, value_name = "NAME", default_value = "module")]
    pub module: String,

    #[arg(long, value_name = "PATH[#PREFIX]")]
    pub seed: Vec<String>,

    #[arg(long, value_name = "PATH[#PREFIX]")]
    pub partial: Vec<String>,

    #[arg(long, value_name = "PATH[#PREFIX]")]
    pub excluded: Vec<String>,

    #[arg(long, value_name = "PATH[#PREFIX]")]
    pub external: Vec<String>,

    #[arg(long, value_name = "DIR")]
    pub war: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ScanArgs {
    #[arg(long)]
    pub jandex: bool,

    #[arg(long, value_name = "N", default_value_t = 1, allow_negative_numbers = true)]
    pub scan_threads: i32,

    #[arg(long)]
    pub strict: bool,

    /// Scan seed sources only, without external resolution or the cache.
    #[arg(long)]
    pub limited: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct CacheArgs {
    #[arg(long, value_name = "SUFFIX", default_value = "default")]
    pub suffix: String,

    #[arg(long)]
    pub clean: bool,

    #[arg(long)]
    pub read_only: bool,

    #[arg(long)]
    pub always_valid: bool,

    #[arg(long, value_name = "N", default_value_t = 0, allow_negative_numbers = true)]
    pub write_threads: i32,

    #[arg(long)]
    pub jandex_format: bool,

    #[arg(long)]
    pub binary_format: bool,

    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ValidationArgs {
    #[arg(long)]
    pub ignore_missing_packages: bool,

    #[arg(long)]
    pub ignore_missing_interfaces: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum RegionArg {
    Seed,
    Partial,
    Excluded,
    External,
    Internal,
    All,
}

impl RegionArg {
    pub fn policies(self) -> ScanPolicies {
        match self {
            RegionArg::Seed => ScanPolicy::Seed.into(),
            RegionArg::Partial => ScanPolicy::Partial.into(),
            RegionArg::Excluded => ScanPolicy::Excluded.into(),
            RegionArg::External => ScanPolicy::External.into(),
            RegionArg::Internal => ScanPolicies::INTERNAL,
            RegionArg::All => ScanPolicies::ALL,
        }
    }
}

/// Union of the selected regions; SEED when none are given.
pub fn region_mask(regions: &[RegionArg]) -> ScanPolicies {
    if regions.is_empty() {
        return ScanPolicies::SEED;
    }
    regions
        .iter()
        .fold(ScanPolicies::NONE, |mask, region| mask | region.policies())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum CategoryArg {
    Package,
    Class,
    Field,
    Method,
}

impl From<CategoryArg> for AnnotationCategory {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Package => AnnotationCategory::Package,
            CategoryArg::Class => AnnotationCategory::Class,
            CategoryArg::Field => AnnotationCategory::Field,
            CategoryArg::Method => AnnotationCategory::Method,
        }
    }
}
