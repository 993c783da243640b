//! Class sources: directories, archives and class-loader views that yield
//! class bytes by name, grouped into an ordered aggregate.
//!
//! Every source carries a scan policy and an optional entry prefix (for
//! content rooted below the container, e.g. `WEB-INF/classes/`). Resource
//! paths handed to and returned from a source are relative to that prefix.

use ignore::WalkBuilder;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::classfile::ClassRecord;
use crate::policy::ScanPolicy;

/// Resource holding a pre-built class index (a JSON list of class records).
pub const JANDEX_INDEX: &str = "META-INF/jandex.json";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open class source [{name}] at {}: {cause}", .path.display())]
    Open {
        name: String,
        path: PathBuf,
        #[source]
        cause: io::Error,
    },
    #[error("failed to read archive [{name}] at {}: {cause}", .path.display())]
    Archive {
        name: String,
        path: PathBuf,
        #[source]
        cause: ZipError,
    },
    #[error("class source name [{0}] is already used in the aggregate")]
    DuplicateName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Directory,
    Jar,
    Memory,
}

#[derive(Debug, Clone)]
pub struct ClassEntry {
    pub class_name: String,
    pub resource: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SourceEntries {
    pub entries: Vec<ClassEntry>,
    /// Class resources that were listed but could not be read.
    pub unreadable: Vec<String>,
}

pub trait ClassSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn policy(&self) -> ScanPolicy;
    fn kind(&self) -> SourceKind;
    fn prefix(&self) -> &str;

    /// Fingerprint of the source's current content, used for cache staleness.
    fn stamp(&self) -> Result<String, SourceError>;

    /// Every class resource below the prefix, ordered by resource path.
    fn entries(&self) -> Result<SourceEntries, SourceError>;

    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>, SourceError>;

    fn lookup(&self, class_name: &str) -> Result<Option<Vec<u8>>, SourceError> {
        self.resource(&class_name_to_class_path(class_name))
    }
}

pub fn class_name_to_class_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// Maps `a/b/C.class` to `a.b.C`. Module descriptors are not classes.
pub fn resource_to_class_name(resource: &str) -> Option<String> {
    let stem = resource.strip_suffix(".class")?;
    if stem.is_empty() || stem == "module-info" || stem.ends_with("/module-info") {
        return None;
    }
    Some(stem.replace(['/', '\\'], "."))
}

pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

pub fn encode_index(records: &[ClassRecord]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(records)
}

pub fn decode_index(bytes: &[u8]) -> Result<Vec<ClassRecord>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

fn digest_hex(hasher: Sha256) -> String {
    hex::encode(hasher.finalize())
}

fn mtime_nanos(meta: &std::fs::Metadata) -> u64 {
    let nanos = meta
        .modified()
        .unwrap_or(UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
pub struct DirectorySource {
    name: String,
    root: PathBuf,
    prefix: String,
    policy: ScanPolicy,
}

impl DirectorySource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, policy: ScanPolicy) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            prefix: String::new(),
            policy,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = normalize_prefix(prefix);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base(&self) -> PathBuf {
        self.root.join(&self.prefix)
    }

    fn ensure_root(&self) -> Result<(), SourceError> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SourceError::Open {
                name: self.name.clone(),
                path: self.root.clone(),
                cause: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            }),
            Err(cause) => Err(SourceError::Open {
                name: self.name.clone(),
                path: self.root.clone(),
                cause,
            }),
        }
    }

    /// Class files below the base directory, as sorted relative resource
    /// paths. Any entry the walker cannot read fails the whole walk.
    fn walk(&self) -> Result<Vec<(String, PathBuf)>, SourceError> {
        let base = self.base();
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let (tx, rx) = mpsc::channel();
        let walker = WalkBuilder::new(&base)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .ignore(false)
            .parents(false)
            .follow_links(true)
            .build_parallel();

        walker.run(|| {
            let tx = tx.clone();
            let base = base.clone();
            Box::new(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return ignore::WalkState::Quit;
                    }
                };
                let path = entry.path();
                if path.is_file()
                    && path.extension().is_some_and(|e| e == "class")
                    && let Ok(rel) = path.strip_prefix(&base)
                {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    let _ = tx.send(Ok((rel, path.to_path_buf())));
                }
                ignore::WalkState::Continue
            })
        });

        drop(tx);
        let mut found = Vec::new();
        for item in rx {
            found.push(item.map_err(|err| self.walk_error(&base, err))?);
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    fn walk_error(&self, base: &Path, err: ignore::Error) -> SourceError {
        let kind = err.io_error().map_or(io::ErrorKind::Other, io::Error::kind);
        SourceError::Open {
            name: self.name.clone(),
            path: base.to_path_buf(),
            cause: io::Error::new(kind, err.to_string()),
        }
    }
}

impl ClassSource for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> ScanPolicy {
        self.policy
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Directory
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn stamp(&self) -> Result<String, SourceError> {
        self.ensure_root()?;
        let mut hasher = Sha256::new();
        let mut files = self.walk()?;
        let index = self.base().join(JANDEX_INDEX);
        if index.is_file() {
            files.push((JANDEX_INDEX.to_string(), index));
        }
        for (rel, path) in files {
            let meta = std::fs::metadata(&path).map_err(|cause| SourceError::Open {
                name: self.name.clone(),
                path: path.clone(),
                cause,
            })?;
            let (len, mtime) = (meta.len(), mtime_nanos(&meta));
            hasher.update(format!("{rel}|{len}|{mtime}\n").as_bytes());
        }
        Ok(digest_hex(hasher))
    }

    fn entries(&self) -> Result<SourceEntries, SourceError> {
        self.ensure_root()?;
        let mut out = SourceEntries::default();
        for (rel, path) in self.walk()? {
            let Some(class_name) = resource_to_class_name(&rel) else {
                continue;
            };
            match std::fs::read(&path) {
                Ok(bytes) => out.entries.push(ClassEntry {
                    class_name,
                    resource: rel,
                    bytes,
                }),
                Err(_) => out.unreadable.push(rel),
            }
        }
        Ok(out)
    }

    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>, SourceError> {
        self.ensure_root()?;
        let full = self.base().join(path);
        if !full.is_file() {
            return Ok(None);
        }
        std::fs::read(&full).map(Some).map_err(|cause| SourceError::Open {
            name: self.name.clone(),
            path: full,
            cause,
        })
    }
}

#[derive(Debug, Clone)]
pub struct JarSource {
    name: String,
    path: PathBuf,
    prefix: String,
    policy: ScanPolicy,
}

impl JarSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, policy: ScanPolicy) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            prefix: String::new(),
            policy,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = normalize_prefix(prefix);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_mmap(&self) -> Result<Mmap, SourceError> {
        let file = File::open(&self.path).map_err(|cause| SourceError::Open {
            name: self.name.clone(),
            path: self.path.clone(),
            cause,
        })?;
        // SAFETY: The file is opened read-only and every archive reading from
        // the map is dropped before the map itself.
        unsafe { Mmap::map(&file) }.map_err(|cause| SourceError::Open {
            name: self.name.clone(),
            path: self.path.clone(),
            cause,
        })
    }

    fn archive_error(&self, cause: ZipError) -> SourceError {
        SourceError::Archive {
            name: self.name.clone(),
            path: self.path.clone(),
            cause,
        }
    }
}

impl ClassSource for JarSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> ScanPolicy {
        self.policy
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Jar
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn stamp(&self) -> Result<String, SourceError> {
        let meta = std::fs::metadata(&self.path).map_err(|cause| SourceError::Open {
            name: self.name.clone(),
            path: self.path.clone(),
            cause,
        })?;
        let mut hasher = Sha256::new();
        hasher.update(format!("{}|{}|{}", self.prefix, meta.len(), mtime_nanos(&meta)).as_bytes());
        Ok(digest_hex(hasher))
    }

    fn entries(&self) -> Result<SourceEntries, SourceError> {
        let mmap = self.open_mmap()?;
        let mut archive =
            ZipArchive::new(Cursor::new(&mmap[..])).map_err(|e| self.archive_error(e))?;

        let mut out = SourceEntries::default();
        for i in 0..archive.len() {
            let mut entry = match archive.by_index(i) {
                Ok(entry) => entry,
                Err(_) => {
                    out.unreadable.push(format!("#{i}"));
                    continue;
                }
            };
            let Some(rel) = entry.name().strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            let rel = rel.to_string();
            let Some(class_name) = resource_to_class_name(&rel) else {
                continue;
            };
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            match entry.read_to_end(&mut bytes) {
                Ok(_) => out.entries.push(ClassEntry {
                    class_name,
                    resource: rel,
                    bytes,
                }),
                Err(_) => out.unreadable.push(rel),
            }
        }
        out.entries.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(out)
    }

    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>, SourceError> {
        let mmap = self.open_mmap()?;
        let mut archive =
            ZipArchive::new(Cursor::new(&mmap[..])).map_err(|e| self.archive_error(e))?;
        let full = format!("{}{}", self.prefix, path);
        let mut entry = match archive.by_name(&full) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(self.archive_error(e)),
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|cause| SourceError::Open {
                name: self.name.clone(),
                path: self.path.join(&full),
                cause,
            })?;
        Ok(Some(bytes))
    }
}

/// An in-memory view over resources supplied by a class loader or a test.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    prefix: String,
    policy: ScanPolicy,
    resources: BTreeMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, policy: ScanPolicy) -> Self {
        Self {
            name: name.into(),
            prefix: String::new(),
            policy,
            resources: BTreeMap::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = normalize_prefix(prefix);
        self
    }

    /// Adds a resource by its full path, prefix included.
    pub fn with_resource(mut self, path: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.resources.insert(path.into(), bytes);
        self
    }

    pub fn with_class(self, class_name: &str, bytes: Vec<u8>) -> Self {
        let path = format!("{}{}", self.prefix, class_name_to_class_path(class_name));
        self.with_resource(path, bytes)
    }
}

impl ClassSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> ScanPolicy {
        self.policy
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Memory
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn stamp(&self) -> Result<String, SourceError> {
        let mut hasher = Sha256::new();
        for (path, bytes) in &self.resources {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(bytes);
        }
        Ok(digest_hex(hasher))
    }

    fn entries(&self) -> Result<SourceEntries, SourceError> {
        let mut out = SourceEntries::default();
        for (path, bytes) in &self.resources {
            let Some(rel) = path.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            if let Some(class_name) = resource_to_class_name(rel) {
                out.entries.push(ClassEntry {
                    class_name,
                    resource: rel.to_string(),
                    bytes: bytes.clone(),
                });
            }
        }
        Ok(out)
    }

    fn resource(&self, path: &str) -> Result<Option<Vec<u8>>, SourceError> {
        Ok(self.resources.get(&format!("{}{}", self.prefix, path)).cloned())
    }
}

/// Ordered list of class sources. Order decides which source owns a class
/// that appears in more than one of them.
#[derive(Debug)]
pub struct ClassSourceAggregate {
    name: String,
    sources: Vec<Box<dyn ClassSource>>,
}

impl ClassSourceAggregate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, source: impl ClassSource + 'static) -> Result<(), SourceError> {
        self.add_boxed(Box::new(source))
    }

    pub fn add_boxed(&mut self, source: Box<dyn ClassSource>) -> Result<(), SourceError> {
        if self.sources.iter().any(|s| s.name() == source.name()) {
            return Err(SourceError::DuplicateName(source.name().to_string()));
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn sources(&self) -> &[Box<dyn ClassSource>] {
        &self.sources
    }

    pub fn internal_sources(&self) -> impl Iterator<Item = &dyn ClassSource> {
        self.sources
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| s.policy() != ScanPolicy::External)
    }

    pub fn external_sources(&self) -> impl Iterator<Item = &dyn ClassSource> {
        self.sources
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| s.policy() == ScanPolicy::External)
    }

    pub fn source_names(&self) -> BTreeSet<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Combined fingerprint over every source, in order.
    pub fn stamp(&self) -> Result<String, SourceError> {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for source in &self.sources {
            let line = format!(
                "\n{}|{}|{:?}|{}|{}",
                source.name(),
                source.policy(),
                source.kind(),
                source.prefix(),
                source.stamp()?
            );
            hasher.update(line.as_bytes());
        }
        Ok(digest_hex(hasher))
    }
}
