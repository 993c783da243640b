#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "annocache_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

/// Writes `bytes` as the class file for `class_name` below `root`.
pub fn write_class(root: &Path, class_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let path = root.join(format!("{}.class", class_name.replace('.', "/")));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, bytes)?;
    Ok(path)
}

pub fn class_path(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// Class file with a name, supertypes and class-level annotations. No
/// members.
#[derive(Debug, Clone)]
pub struct ClassFile {
    name: String,
    superclass: String,
    interfaces: Vec<String>,
    access: u16,
    annotations: Vec<String>,
}

impl ClassFile {
    pub fn class(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: "java.lang.Object".to_string(),
            interfaces: Vec::new(),
            access: 0x0021,
            annotations: Vec::new(),
        }
    }

    pub fn interface(name: &str) -> Self {
        Self {
            access: 0x0601,
            ..Self::class(name)
        }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = superclass.to_string();
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn annotated(mut self, annotation: &str) -> Self {
        self.annotations.push(annotation.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut pool = Pool::default();
        let this_class = pool.class(&self.name);
        let super_class = pool.class(&self.superclass);
        let interfaces: Vec<u16> = self.interfaces.iter().map(|i| pool.class(i)).collect();

        let attribute = if self.annotations.is_empty() {
            None
        } else {
            let attr_name = pool.utf8("RuntimeVisibleAnnotations");
            let mut body = Vec::new();
            body.extend_from_slice(&(self.annotations.len() as u16).to_be_bytes());
            for ann in &self.annotations {
                let descriptor = format!("L{};", ann.replace('.', "/"));
                body.extend_from_slice(&pool.utf8(&descriptor).to_be_bytes());
                body.extend_from_slice(&0u16.to_be_bytes());
            }
            let mut attr = Vec::new();
            attr.extend_from_slice(&attr_name.to_be_bytes());
            attr.extend_from_slice(&(body.len() as u32).to_be_bytes());
            attr.extend_from_slice(&body);
            Some(attr)
        };

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFEBABE_u32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&52u16.to_be_bytes());
        out.extend_from_slice(&((pool.entries.len() + 1) as u16).to_be_bytes());
        for entry in &pool.entries {
            out.extend_from_slice(entry);
        }
        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&this_class.to_be_bytes());
        out.extend_from_slice(&super_class.to_be_bytes());
        out.extend_from_slice(&(interfaces.len() as u16).to_be_bytes());
        for i in interfaces {
            out.extend_from_slice(&i.to_be_bytes());
        }
        // no fields, no methods
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        match attribute {
            Some(attr) => {
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&attr);
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out
    }
}

#[derive(Default)]
struct Pool {
    entries: Vec<Vec<u8>>,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
}

impl Pool {
    fn utf8(&mut self, value: &str) -> u16 {
        if let Some(idx) = self.utf8.get(value) {
            return *idx;
        }
        let mut entry = vec![1u8];
        entry.extend_from_slice(&(value.len() as u16).to_be_bytes());
        entry.extend_from_slice(value.as_bytes());
        self.entries.push(entry);
        let idx = self.entries.len() as u16;
        self.utf8.insert(value.to_string(), idx);
        idx
    }

    fn class(&mut self, dotted: &str) -> u16 {
        if let Some(idx) = self.classes.get(dotted) {
            return *idx;
        }
        let name_index = self.utf8(&dotted.replace('.', "/"));
        let mut entry = vec![7u8];
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.entries.push(entry);
        let idx = self.entries.len() as u16;
        self.classes.insert(dotted.to_string(), idx);
        idx
    }
}

/// A module on disk:
///
/// - `seed/`: `com.app.Foo` (extends `lib.Base`, implements `com.app.Service`,
///   `@com.app.Component`), `com.app.Bar` (extends `com.app.Foo`, implements
///   `missing.Gone`), `com.app.Service`, and `com.app.package-info`
///   (`@com.app.Pkg`).
/// - `lib.jar` (partial): `lib.Base` implementing `ext.Api`, and `lib.Util`.
/// - `ext/` (external): `ext.Api`, `ext.Unused`.
pub struct Module {
    pub root: PathBuf,
    pub seed: PathBuf,
    pub lib: PathBuf,
    pub ext: PathBuf,
}

impl Module {
    pub fn create(name: &str) -> Self {
        let root = temp_dir(name);
        let seed = root.join("seed");
        let lib = root.join("lib.jar");
        let ext = root.join("ext");

        write_class(
            &seed,
            "com.app.Foo",
            &ClassFile::class("com.app.Foo")
                .extends("lib.Base")
                .implements("com.app.Service")
                .annotated("com.app.Component")
                .build(),
        )
        .unwrap();
        write_class(
            &seed,
            "com.app.Bar",
            &ClassFile::class("com.app.Bar")
                .extends("com.app.Foo")
                .implements("missing.Gone")
                .build(),
        )
        .unwrap();
        write_class(&seed, "com.app.Service", &ClassFile::interface("com.app.Service").build()).unwrap();
        write_class(
            &seed,
            "com.app.package-info",
            &ClassFile::interface("com.app.package-info")
                .annotated("com.app.Pkg")
                .build(),
        )
        .unwrap();

        let base = ClassFile::class("lib.Base").implements("ext.Api").build();
        let util = ClassFile::class("lib.Util").build();
        write_jar(
            &lib,
            &[
                (class_path("lib.Base").as_str(), base.as_slice()),
                (class_path("lib.Util").as_str(), util.as_slice()),
            ],
        )
        .unwrap();

        write_class(&ext, "ext.Api", &ClassFile::interface("ext.Api").build()).unwrap();
        write_class(&ext, "ext.Unused", &ClassFile::class("ext.Unused").build()).unwrap();

        Self { root, seed, lib, ext }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn remove(&self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
