//! Structural class-file reading.
//!
//! Scanning only needs a class's name, access flags, supertypes and the
//! annotation types attached to it and to its members. `ClassDecoder` is the
//! seam for whatever bytecode reader supplies that; `ClassfileDecoder` reads
//! exactly those parts of the JVM class-file format and skips the rest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

pub const PACKAGE_INFO: &str = "package-info";
const ROOT_CLASS: &str = "java.lang.Object";
/// Deepest nesting of annotation and array element values read.
const MAX_ELEMENT_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ClassParseError {
    #[error("unexpected end of class file")]
    UnexpectedEof,
    #[error("invalid class file magic header")]
    InvalidMagic,
    #[error("unsupported constant pool tag {tag}")]
    UnsupportedConstant { tag: u8 },
    #[error("invalid constant pool index {index}")]
    InvalidConstantIndex { index: u16 },
    #[error("invalid modified UTF-8 in constant pool string at byte {offset}")]
    Utf8Decode { offset: usize },
    #[error("malformed annotation descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("malformed element value tag {tag:#04x}")]
    InvalidElementTag { tag: u8 },
    #[error("element values nested deeper than {}", MAX_ELEMENT_DEPTH)]
    ElementNesting,
}

/// Everything the scanner keeps about one class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub name: String,
    #[serde(default)]
    pub superclass: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub modifiers: u16,
    #[serde(default)]
    pub class_annotations: Vec<String>,
    #[serde(default)]
    pub field_annotations: Vec<String>,
    #[serde(default)]
    pub method_annotations: Vec<String>,
}

impl ClassRecord {
    /// A record carrying only a name, used for classes that were referenced
    /// or listed but whose bytes could not be read.
    pub fn name_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn package_name(&self) -> &str {
        self.name.rsplit_once('.').map(|(pkg, _)| pkg).unwrap_or("")
    }

    pub fn is_package_info(&self) -> bool {
        self.name == PACKAGE_INFO || self.name.ends_with(".package-info")
    }

    pub fn is_interface(&self) -> bool {
        self.modifiers & ACC_INTERFACE != 0
    }

    /// Names of the supertypes this class references.
    pub fn referenced_supertypes(&self) -> impl Iterator<Item = &str> {
        self.superclass
            .as_deref()
            .into_iter()
            .chain(self.interfaces.iter().map(String::as_str))
    }
}

pub trait ClassDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<ClassRecord, ClassParseError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassfileDecoder;

impl ClassDecoder for ClassfileDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<ClassRecord, ClassParseError> {
        parse_class(bytes)
    }
}

pub fn parse_class(bytes: &[u8]) -> Result<ClassRecord, ClassParseError> {
    let mut reader = ClassReader::new(bytes);
    reader.expect_magic()?;
    let _minor_version = reader.read_u2()?;
    let _major_version = reader.read_u2()?;
    let pool = ConstantPool::parse(&mut reader)?;

    let modifiers = reader.read_u2()?;
    let this_class = reader.read_u2()?;
    let super_class = reader.read_u2()?;

    let name = binary_to_dotted(&pool.class_name(this_class)?);
    let superclass = if super_class == 0 {
        None
    } else {
        let sup = binary_to_dotted(&pool.class_name(super_class)?);
        (sup != ROOT_CLASS).then_some(sup)
    };

    let interfaces_count = reader.read_u2()?;
    let mut interfaces = Vec::with_capacity(interfaces_count as usize);
    for _ in 0..interfaces_count {
        let index = reader.read_u2()?;
        interfaces.push(binary_to_dotted(&pool.class_name(index)?));
    }

    let mut field_annotations = BTreeSet::new();
    let fields_count = reader.read_u2()?;
    for _ in 0..fields_count {
        read_member(&mut reader, &pool, &mut field_annotations)?;
    }

    let mut method_annotations = BTreeSet::new();
    let methods_count = reader.read_u2()?;
    for _ in 0..methods_count {
        read_member(&mut reader, &pool, &mut method_annotations)?;
    }

    let mut class_annotations = BTreeSet::new();
    let attributes_count = reader.read_u2()?;
    read_attributes(&mut reader, &pool, attributes_count, &mut class_annotations)?;

    Ok(ClassRecord {
        name,
        superclass,
        interfaces,
        modifiers,
        class_annotations: class_annotations.into_iter().collect(),
        field_annotations: field_annotations.into_iter().collect(),
        method_annotations: method_annotations.into_iter().collect(),
    })
}

pub fn binary_to_dotted(name: &str) -> String {
    name.replace('/', ".")
}

fn read_member(
    reader: &mut ClassReader<'_>,
    pool: &ConstantPool,
    annotations: &mut BTreeSet<String>,
) -> Result<(), ClassParseError> {
    let _access_flags = reader.read_u2()?;
    let _name_index = reader.read_u2()?;
    let _descriptor_index = reader.read_u2()?;
    let attributes_count = reader.read_u2()?;
    read_attributes(reader, pool, attributes_count, annotations)
}

fn read_attributes(
    reader: &mut ClassReader<'_>,
    pool: &ConstantPool,
    count: u16,
    annotations: &mut BTreeSet<String>,
) -> Result<(), ClassParseError> {
    for _ in 0..count {
        let name_index = reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        let attribute_name = pool.utf8(name_index)?;
        if attribute_name == "RuntimeVisibleAnnotations"
            || attribute_name == "RuntimeInvisibleAnnotations"
        {
            let slice = reader.read_slice(length)?;
            let mut sub = ClassReader::new(slice);
            let num_annotations = sub.read_u2()?;
            for _ in 0..num_annotations {
                annotations.insert(read_annotation(&mut sub, pool, 0)?);
            }
        } else {
            reader.skip(length)?;
        }
    }
    Ok(())
}

fn read_annotation(reader: &mut ClassReader<'_>, pool: &ConstantPool, depth: usize) -> Result<String, ClassParseError> {
    let type_index = reader.read_u2()?;
    let descriptor = pool.utf8(type_index)?;
    let type_name = descriptor
        .strip_prefix('L')
        .and_then(|d| d.strip_suffix(';'))
        .ok_or_else(|| ClassParseError::InvalidDescriptor(descriptor.to_string()))?;

    let pairs = reader.read_u2()?;
    for _ in 0..pairs {
        let _element_name_index = reader.read_u2()?;
        skip_element_value(reader, pool, depth + 1)?;
    }
    Ok(binary_to_dotted(type_name))
}

fn skip_element_value(reader: &mut ClassReader<'_>, pool: &ConstantPool, depth: usize) -> Result<(), ClassParseError> {
    if depth > MAX_ELEMENT_DEPTH {
        return Err(ClassParseError::ElementNesting);
    }
    let tag = reader.read_u1()?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            reader.read_u2()?;
        }
        b'e' => {
            reader.read_u2()?; // type_name_index
            reader.read_u2()?; // const_name_index
        }
        b'@' => {
            read_annotation(reader, pool, depth)?;
        }
        b'[' => {
            let count = reader.read_u2()?;
            for _ in 0..count {
                skip_element_value(reader, pool, depth + 1)?;
            }
        }
        other => return Err(ClassParseError::InvalidElementTag { tag: other }),
    }
    Ok(())
}

/// Decodes the class-file string encoding: NUL is `C0 80` and characters
/// outside the BMP are surrogate pairs, each half a three-byte sequence.
/// Unpaired surrogates become U+FFFD.
fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassParseError> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.to_string());
    }

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        let start = pos;
        let continuation = |at: usize| match bytes.get(at) {
            Some(b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
            _ => Err(ClassParseError::Utf8Decode { offset: start }),
        };
        let lead = bytes[pos];
        let (unit, width) = if lead & 0x80 == 0 {
            (u16::from(lead), 1)
        } else if lead & 0xE0 == 0xC0 {
            ((u16::from(lead & 0x1F) << 6) | continuation(pos + 1)?, 2)
        } else if lead & 0xF0 == 0xE0 {
            (
                (u16::from(lead & 0x0F) << 12) | (continuation(pos + 1)? << 6) | continuation(pos + 2)?,
                3,
            )
        } else {
            return Err(ClassParseError::Utf8Decode { offset: start });
        };
        units.push(unit);
        pos += width;
    }

    Ok(char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}

#[derive(Debug, Clone)]
enum Constant {
    Utf8(String),
    Class { name_index: u16 },
    Other,
    Unusable,
}

struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    fn parse(reader: &mut ClassReader<'_>) -> Result<Self, ClassParseError> {
        let count = reader.read_u2()? as usize;
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Unusable); // index 0 unused

        let mut index = 1;
        while index < count {
            let tag = reader.read_u1()?;
            let entry = match tag {
                1 => {
                    let length = reader.read_u2()? as usize;
                    let bytes = reader.read_slice(length)?;
                    Constant::Utf8(decode_modified_utf8(bytes)?)
                }
                3 | 4 => {
                    reader.skip(4)?;
                    Constant::Other
                }
                // Long and double take two slots.
                5 | 6 => {
                    reader.skip(8)?;
                    entries.push(Constant::Other);
                    index += 1;
                    Constant::Unusable
                }
                7 => Constant::Class {
                    name_index: reader.read_u2()?,
                },
                8 | 16 | 19 | 20 => {
                    reader.read_u2()?;
                    Constant::Other
                }
                9 | 10 | 11 | 12 | 17 | 18 => {
                    reader.skip(4)?;
                    Constant::Other
                }
                15 => {
                    reader.skip(3)?;
                    Constant::Other
                }
                other => return Err(ClassParseError::UnsupportedConstant { tag: other }),
            };
            entries.push(entry);
            index += 1;
        }

        Ok(Self { entries })
    }

    fn get(&self, index: u16) -> Result<&Constant, ClassParseError> {
        self.entries
            .get(index as usize)
            .ok_or(ClassParseError::InvalidConstantIndex { index })
    }

    fn utf8(&self, index: u16) -> Result<&str, ClassParseError> {
        match self.get(index)? {
            Constant::Utf8(value) => Ok(value.as_str()),
            _ => Err(ClassParseError::InvalidConstantIndex { index }),
        }
    }

    fn class_name(&self, index: u16) -> Result<String, ClassParseError> {
        match self.get(index)? {
            Constant::Class { name_index } => Ok(self.utf8(*name_index)?.to_string()),
            _ => Err(ClassParseError::InvalidConstantIndex { index }),
        }
    }
}

struct ClassReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ClassReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn expect_magic(&mut self) -> Result<(), ClassParseError> {
        const MAGIC: u32 = 0xCAFEBABE;
        if self.read_u4()? != MAGIC {
            return Err(ClassParseError::InvalidMagic);
        }
        Ok(())
    }

    fn read_u1(&mut self) -> Result<u8, ClassParseError> {
        let value = *self.data.get(self.pos).ok_or(ClassParseError::UnexpectedEof)?;
        self.pos += 1;
        Ok(value)
    }

    fn read_u2(&mut self) -> Result<u16, ClassParseError> {
        let bytes = self.read_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ClassParseError> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ClassParseError> {
        if self.pos + len > self.data.len() {
            return Err(ClassParseError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), ClassParseError> {
        self.read_slice(len).map(|_| ())
    }
}

/// Minimal class-file writer for unit-test fixtures.
#[cfg(test)]
pub(crate) mod fixture {
    use std::collections::HashMap;

    #[derive(Debug, Clone, Default)]
    pub struct ClassBytes {
        pub name: String,
        pub superclass: Option<String>,
        pub interfaces: Vec<String>,
        pub access: u16,
        pub class_annotations: Vec<String>,
        pub field_annotations: Vec<(String, String)>,
        pub method_annotations: Vec<(String, String)>,
        /// Utf8 constants written byte for byte, e.g. modified UTF-8.
        pub raw_utf8: Vec<Vec<u8>>,
    }

    impl ClassBytes {
        pub fn class(name: &str) -> Self {
            Self {
                name: name.to_string(),
                access: 0x0021,
                ..Self::default()
            }
        }

        pub fn interface(name: &str) -> Self {
            Self {
                name: name.to_string(),
                access: 0x0601,
                ..Self::default()
            }
        }

        pub fn extends(mut self, superclass: &str) -> Self {
            self.superclass = Some(superclass.to_string());
            self
        }

        pub fn implements(mut self, interface: &str) -> Self {
            self.interfaces.push(interface.to_string());
            self
        }

        pub fn annotated(mut self, annotation: &str) -> Self {
            self.class_annotations.push(annotation.to_string());
            self
        }

        pub fn field(mut self, field: &str, annotation: &str) -> Self {
            self.field_annotations.push((field.to_string(), annotation.to_string()));
            self
        }

        pub fn method(mut self, method: &str, annotation: &str) -> Self {
            self.method_annotations.push((method.to_string(), annotation.to_string()));
            self
        }

        pub fn raw_utf8(mut self, bytes: &[u8]) -> Self {
            self.raw_utf8.push(bytes.to_vec());
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let mut pool = Pool::default();
            for raw in &self.raw_utf8 {
                let mut entry = vec![1u8];
                entry.extend_from_slice(&(raw.len() as u16).to_be_bytes());
                entry.extend_from_slice(raw);
                pool.entries.push(entry);
            }
            let this_class = pool.class(&self.name);
            let super_class = pool.class(self.superclass.as_deref().unwrap_or("java.lang.Object"));
            let interfaces: Vec<u16> = self.interfaces.iter().map(|i| pool.class(i)).collect();
            let fields: Vec<Vec<u8>> = self
                .field_annotations
                .iter()
                .map(|(name, ann)| member(&mut pool, name, "I", std::slice::from_ref(ann)))
                .collect();
            let methods: Vec<Vec<u8>> = self
                .method_annotations
                .iter()
                .map(|(name, ann)| member(&mut pool, name, "()V", std::slice::from_ref(ann)))
                .collect();
            let class_attrs = annotations_attribute(&mut pool, &self.class_annotations);

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
            out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
            for f in fields {
                out.extend_from_slice(&f);
            }
            out.extend_from_slice(&(methods.len() as u16).to_be_bytes());
            for m in methods {
                out.extend_from_slice(&m);
            }
            match class_attrs {
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

    fn member(pool: &mut Pool, name: &str, descriptor: &str, annotations: &[String]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x0001u16.to_be_bytes());
        out.extend_from_slice(&pool.utf8(name).to_be_bytes());
        out.extend_from_slice(&pool.utf8(descriptor).to_be_bytes());
        match annotations_attribute(pool, annotations) {
            Some(attr) => {
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&attr);
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out
    }

    // Each annotation carries one `value = "..."` pair so readers must skip element values.
    fn annotations_attribute(pool: &mut Pool, annotations: &[String]) -> Option<Vec<u8>> {
        if annotations.is_empty() {
            return None;
        }
        let attr_name = pool.utf8("RuntimeVisibleAnnotations");
        let value_name = pool.utf8("value");
        let value = pool.utf8("fixture");
        let mut body = Vec::new();
        body.extend_from_slice(&(annotations.len() as u16).to_be_bytes());
        for ann in annotations {
            let descriptor = format!("L{};", ann.replace('.', "/"));
            body.extend_from_slice(&pool.utf8(&descriptor).to_be_bytes());
            body.extend_from_slice(&1u16.to_be_bytes());
            body.extend_from_slice(&value_name.to_be_bytes());
            body.push(b's');
            body.extend_from_slice(&value.to_be_bytes());
        }
        let mut out = Vec::new();
        out.extend_from_slice(&attr_name.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Some(out)
    }
}
