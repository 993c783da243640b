//! Persistent cache of scanned targets.
//!
//! One directory per storage suffix under a common root. Each holds one
//! encoded file per policy table plus two marker files written last: the
//! encoding tag (`format`) and the aggregate stamp the tables were built
//! from (`stamp`). A directory missing either marker is never read.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{CacheFormat, EncodingError};
use crate::intern::InternMap;
use crate::policy::ScanPolicy;
use crate::scan::{MAX_THREADS, available_threads};
use crate::table::TableData;
use crate::targets::Targets;
use crate::timing::{Phase, TimingData};

pub const FORMAT_FILE: &str = "format";
pub const STAMP_FILE: &str = "stamp";
const LOCK_FILE: &str = ".lock";
/// A writer lock older than this is assumed abandoned and is broken.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache options select both the jandex and the binary format")]
    ConflictingFormats,
    #[error("invalid storage suffix {0:?}")]
    InvalidSuffix(String),
    #[error("cache io at {}: {cause}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("cache lock {} is held by another writer (remove it if no writer is running)", .0.display())]
    Locked(PathBuf),
    #[error("failed to encode {policy} table: {cause}")]
    Encode {
        policy: ScanPolicy,
        #[source]
        cause: EncodingError,
    },
    #[error("failed to decode {policy} table: {cause}")]
    Decode {
        policy: ScanPolicy,
        #[source]
        cause: EncodingError,
    },
    #[error("failed to build cache write pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |cause| CacheError::Io {
        path: path.to_path_buf(),
        cause,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub storage_suffix: String,
    /// Wipe the suffix directory when the cache is opened.
    pub clean_storage: bool,
    /// Never write; reads still happen.
    pub read_only: bool,
    /// Accept any present cache without comparing stamps.
    pub always_valid: bool,
    /// `0`: write tables on the calling thread. Negative: one worker per
    /// processor. Otherwise an upper bound.
    pub write_threads: i32,
    pub use_jandex_format: bool,
    pub use_binary_format: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            storage_suffix: "default".to_string(),
            clean_storage: false,
            read_only: false,
            always_valid: false,
            write_threads: 0,
            use_jandex_format: false,
            use_binary_format: false,
        }
    }
}

impl CacheOptions {
    pub fn format(&self) -> Result<CacheFormat, CacheError> {
        match (self.use_jandex_format, self.use_binary_format) {
            (true, true) => Err(CacheError::ConflictingFormats),
            (true, false) => Ok(CacheFormat::Jandex),
            (false, true) => Ok(CacheFormat::Binary),
            (false, false) => Ok(CacheFormat::Plain),
        }
    }

    pub fn validate(&self) -> Result<CacheFormat, CacheError> {
        let suffix = self.storage_suffix.as_str();
        if suffix.is_empty()
            || suffix == "."
            || suffix == ".."
            || suffix.contains(['/', '\\'])
        {
            return Err(CacheError::InvalidSuffix(self.storage_suffix.clone()));
        }
        self.format()
    }
}

pub fn resolve_write_threads(requested: i32) -> usize {
    match requested {
        0 => 0,
        n if n < 0 => available_threads(),
        n => (n as usize).min(MAX_THREADS),
    }
}

pub fn table_file_name(policy: ScanPolicy, format: CacheFormat) -> String {
    format!("{}.{}", policy.tag(), format.extension())
}

#[derive(Debug)]
pub struct TargetCache {
    root: PathBuf,
    dir: PathBuf,
    options: CacheOptions,
    format: CacheFormat,
    write_lock: Mutex<()>,
}

/// Removes the lock file when the write finishes, successfully or not.
struct WriterLock {
    path: PathBuf,
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl TargetCache {
    pub fn open(root: impl Into<PathBuf>, options: CacheOptions) -> Result<Self, CacheError> {
        let format = options.validate()?;
        let root = root.into();
        let dir = root.join(&options.storage_suffix);

        if options.clean_storage && !options.read_only && dir.exists() {
            info!("cleaning cache storage {}", dir.display());
            fs::remove_dir_all(&dir).map_err(io_error(&dir))?;
        }

        Ok(Self {
            root,
            dir,
            options,
            format,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn format(&self) -> CacheFormat {
        self.format
    }

    /// Loads cached targets. Any failure, a format mismatch, or a stale
    /// stamp (unless `always_valid`) is a miss.
    pub fn read(&self, names: Arc<InternMap>, expected_stamp: &str, timing: &TimingData) -> Option<Targets> {
        let start = Instant::now();
        match self.try_read(names, expected_stamp) {
            Ok(Some(targets)) => {
                let classes = ScanPolicy::ALL
                    .iter()
                    .map(|p| targets.class_count(*p) as u64)
                    .sum();
                timing.add(Phase::CacheRead, ScanPolicy::ALL.len() as u64, start.elapsed(), classes);
                info!("cache hit at {}", self.dir.display());
                Some(targets)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("cache at {} unreadable, treating as a miss: {e}", self.dir.display());
                None
            }
        }
    }

    fn try_read(&self, names: Arc<InternMap>, expected_stamp: &str) -> Result<Option<Targets>, CacheError> {
        let format_path = self.dir.join(FORMAT_FILE);
        let stamp_path = self.dir.join(STAMP_FILE);
        if !format_path.exists() || !stamp_path.exists() {
            debug!("cache miss: no complete cache at {}", self.dir.display());
            return Ok(None);
        }

        let stored_format = fs::read_to_string(&format_path).map_err(io_error(&format_path))?;
        if CacheFormat::from_tag(stored_format.trim()) != Some(self.format) {
            info!(
                "cache miss: stored format {} does not match {}",
                stored_format.trim(),
                self.format
            );
            return Ok(None);
        }

        if !self.options.always_valid {
            let stored_stamp = fs::read_to_string(&stamp_path).map_err(io_error(&stamp_path))?;
            if stored_stamp.trim() != expected_stamp {
                info!("cache miss: stale stamp at {}", self.dir.display());
                return Ok(None);
            }
        }

        let mut tables = Vec::with_capacity(ScanPolicy::ALL.len());
        for policy in ScanPolicy::ALL {
            let path = self.dir.join(table_file_name(policy, self.format));
            let bytes = fs::read(&path).map_err(io_error(&path))?;
            let table = self
                .format
                .decode(&bytes)
                .map_err(|cause| CacheError::Decode { policy, cause })?;
            if table.policy != policy {
                warn!("cache table {} holds {} data", path.display(), table.policy);
                return Ok(None);
            }
            tables.push(table);
        }

        Ok(Some(Targets::from_data(names, &tables)))
    }

    /// Persists every policy table, then the format and stamp markers.
    /// Answers false when the cache is read-only and nothing was written.
    pub fn write(&self, targets: &Targets, stamp: &str, timing: &TimingData) -> Result<bool, CacheError> {
        if self.options.read_only {
            debug!("cache at {} is read-only, skipping write", self.dir.display());
            return Ok(false);
        }

        let start = Instant::now();
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let _lock = self.acquire_writer_lock()?;

        for marker in [STAMP_FILE, FORMAT_FILE] {
            let path = self.dir.join(marker);
            if path.exists() {
                fs::remove_file(&path).map_err(io_error(&path))?;
            }
        }

        let tables = targets.to_data();
        let threads = resolve_write_threads(self.options.write_threads);
        if threads == 0 {
            for table in &tables {
                self.write_table(table)?;
            }
        } else {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
            pool.install(|| {
                tables
                    .par_iter()
                    .map(|table| self.write_table(table))
                    .collect::<Result<Vec<()>, CacheError>>()
            })?;
        }

        publish(&self.dir.join(FORMAT_FILE), self.format.tag().as_bytes())?;
        publish(&self.dir.join(STAMP_FILE), stamp.as_bytes())?;

        let classes = tables.iter().map(|t| t.records.len() as u64).sum();
        timing.add(Phase::CacheWrite, tables.len() as u64, start.elapsed(), classes);
        info!(
            "wrote {} cache to {} on {} threads",
            self.format,
            self.dir.display(),
            threads
        );
        Ok(true)
    }

    fn write_table(&self, table: &TableData) -> Result<(), CacheError> {
        let bytes = self.format.encode(table).map_err(|cause| CacheError::Encode {
            policy: table.policy,
            cause,
        })?;
        let path = self.dir.join(table_file_name(table.policy, self.format));
        debug!("writing {} ({} bytes)", path.display(), bytes.len());
        publish(&path, &bytes)
    }

    /// Creates the lock file holding `<pid> <unix seconds>`. An existing
    /// lock past `LOCK_STALE_AFTER` is removed once and creation retried.
    fn acquire_writer_lock(&self) -> Result<WriterLock, CacheError> {
        let path = self.dir.join(LOCK_FILE);
        let mut broken = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lock = WriterLock { path };
                    let secs = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    writeln!(file, "{} {}", std::process::id(), secs).map_err(io_error(&lock.path))?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if broken || !lock_is_stale(&path) {
                        return Err(CacheError::Locked(path));
                    }
                    warn!("breaking stale cache lock {}", path.display());
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(cause) => return Err(CacheError::Io { path, cause }),
                    }
                    broken = true;
                }
                Err(cause) => return Err(CacheError::Io { path, cause }),
            }
        }
    }

    /// Removes this suffix's directory.
    pub fn clear(&self) -> Result<(), CacheError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        }
        Ok(())
    }
}

/// Age from the timestamp recorded in the lock, else from its mtime.
fn lock_is_stale(path: &Path) -> bool {
    let written = fs::read_to_string(path)
        .ok()
        .and_then(|content| content.split_whitespace().nth(1)?.parse::<u64>().ok())
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
        .or_else(|| fs::metadata(path).and_then(|m| m.modified()).ok());
    written
        .and_then(|at| SystemTime::now().duration_since(at).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

/// Writes to a sibling temp file, then renames over the target.
fn publish(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut tmp_os = path.as_os_str().to_os_string();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);
    fs::write(&tmp, bytes).map_err(io_error(&tmp))?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).map_err(io_error(path))?;
    Ok(())
}

/// Removes every suffix under the cache root.
pub fn clear_root(root: &Path) -> Result<(), CacheError> {
    if root.exists() {
        fs::remove_dir_all(root).map_err(io_error(root))?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct TableStats {
    pub policy: ScanPolicy,
    pub file: String,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct SuffixStats {
    pub suffix: String,
    pub format: Option<CacheFormat>,
    pub stamp: Option<String>,
    pub complete: bool,
    pub tables: Vec<TableStats>,
    pub total_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub root: String,
    pub suffixes: Vec<SuffixStats>,
}

pub fn stats(root: &Path) -> Result<CacheStats, CacheError> {
    let mut suffixes = Vec::new();
    if root.exists() {
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .map_err(io_error(root))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        for dir in dirs {
            suffixes.push(suffix_stats(&dir));
        }
    }
    Ok(CacheStats {
        root: root.to_string_lossy().to_string(),
        suffixes,
    })
}

fn suffix_stats(dir: &Path) -> SuffixStats {
    let read_marker = |name: &str| {
        fs::read_to_string(dir.join(name))
            .ok()
            .map(|s| s.trim().to_string())
    };
    let format = read_marker(FORMAT_FILE).and_then(|tag| CacheFormat::from_tag(&tag));
    let stamp = read_marker(STAMP_FILE);

    let mut tables = Vec::new();
    if let Some(format) = format {
        for policy in ScanPolicy::ALL {
            let file = table_file_name(policy, format);
            if let Ok(meta) = fs::metadata(dir.join(&file)) {
                tables.push(TableStats {
                    policy,
                    file,
                    bytes: meta.len(),
                });
            }
        }
    }

    SuffixStats {
        suffix: dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        complete: format.is_some() && stamp.is_some() && tables.len() == ScanPolicy::ALL.len(),
        format,
        stamp,
        total_bytes: tables.iter().map(|t| t.bytes).sum(),
        tables,
    }
}
