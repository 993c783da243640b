//! On-disk encodings of one policy table.
//!
//! - `Plain`: line-oriented text, one `class` line per record followed by
//!   indented attribute lines.
//! - `Jandex`: the JSON form of the table records, the same record shape a
//!   source's `META-INF/jandex.json` uses.
//! - `Binary`: bincode.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::classfile::ClassRecord;
use crate::policy::ScanPolicy;
use crate::table::{SourcedRecord, TableData};

const PLAIN_HEADER: &str = "# annocache plain v1";

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("line {line}: {reason}")]
    Plain { line: usize, reason: String },
    #[error("plain table is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("json table: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary table: {0}")]
    Binary(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheFormat {
    #[default]
    Plain,
    Jandex,
    Binary,
}

impl CacheFormat {
    pub fn tag(self) -> &'static str {
        match self {
            CacheFormat::Plain => "plain",
            CacheFormat::Jandex => "jandex",
            CacheFormat::Binary => "binary",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        [CacheFormat::Plain, CacheFormat::Jandex, CacheFormat::Binary]
            .into_iter()
            .find(|f| f.tag() == tag)
    }

    pub fn extension(self) -> &'static str {
        match self {
            CacheFormat::Plain => "txt",
            CacheFormat::Jandex => "json",
            CacheFormat::Binary => "bin",
        }
    }

    pub fn encode(self, table: &TableData) -> Result<Vec<u8>, EncodingError> {
        match self {
            CacheFormat::Plain => Ok(encode_plain(table).into_bytes()),
            CacheFormat::Jandex => Ok(serde_json::to_vec(table)?),
            CacheFormat::Binary => Ok(bincode::serialize(table)?),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<TableData, EncodingError> {
        match self {
            CacheFormat::Plain => decode_plain(std::str::from_utf8(bytes)?),
            CacheFormat::Jandex => Ok(serde_json::from_slice(bytes)?),
            CacheFormat::Binary => Ok(bincode::deserialize(bytes)?),
        }
    }
}

impl fmt::Display for CacheFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn encode_plain(table: &TableData) -> String {
    let mut out = String::new();
    out.push_str(PLAIN_HEADER);
    out.push('\n');
    out.push_str(&format!("policy {}\n", table.policy));
    for entry in &table.records {
        let record = &entry.record;
        out.push_str(&format!("class {}\n", record.name));
        if let Some(source) = &entry.source {
            out.push_str(&format!("  source {source}\n"));
        }
        if let Some(sup) = &record.superclass {
            out.push_str(&format!("  super {sup}\n"));
        }
        for interface in &record.interfaces {
            out.push_str(&format!("  interface {interface}\n"));
        }
        if record.modifiers != 0 {
            out.push_str(&format!("  modifiers {}\n", record.modifiers));
        }
        for ann in &record.class_annotations {
            out.push_str(&format!("  class-annotation {ann}\n"));
        }
        for ann in &record.field_annotations {
            out.push_str(&format!("  field-annotation {ann}\n"));
        }
        for ann in &record.method_annotations {
            out.push_str(&format!("  method-annotation {ann}\n"));
        }
    }
    out
}

fn decode_plain(text: &str) -> Result<TableData, EncodingError> {
    let fail = |line: usize, reason: String| EncodingError::Plain { line, reason };

    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));
    match lines.next() {
        Some((_, PLAIN_HEADER)) => {}
        _ => return Err(fail(1, "missing header".to_string())),
    }
    let policy = match lines.next() {
        Some((n, line)) => {
            let tag = line
                .strip_prefix("policy ")
                .ok_or_else(|| fail(n, "expected policy line".to_string()))?;
            ScanPolicy::from_tag(tag).ok_or_else(|| fail(n, format!("unknown policy {tag}")))?
        }
        None => return Err(fail(2, "missing policy line".to_string())),
    };

    let mut records: Vec<SourcedRecord> = Vec::new();
    for (n, line) in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix("class ") {
            records.push(SourcedRecord {
                source: None,
                record: ClassRecord::name_only(name),
            });
            continue;
        }

        let attribute = line
            .strip_prefix("  ")
            .ok_or_else(|| fail(n, format!("unexpected line {line:?}")))?;
        let (key, value) = attribute
            .split_once(' ')
            .ok_or_else(|| fail(n, format!("attribute without value {attribute:?}")))?;
        let entry = records
            .last_mut()
            .ok_or_else(|| fail(n, "attribute before any class".to_string()))?;
        let record = &mut entry.record;
        match key {
            "source" => entry.source = Some(value.to_string()),
            "super" => record.superclass = Some(value.to_string()),
            "interface" => record.interfaces.push(value.to_string()),
            "modifiers" => {
                record.modifiers = value
                    .parse()
                    .map_err(|_| fail(n, format!("bad modifiers {value}")))?;
            }
            "class-annotation" => record.class_annotations.push(value.to_string()),
            "field-annotation" => record.field_annotations.push(value.to_string()),
            "method-annotation" => record.method_annotations.push(value.to_string()),
            other => return Err(fail(n, format!("unknown attribute {other}"))),
        }
    }

    Ok(TableData { policy, records })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableData {
        TableData {
            policy: ScanPolicy::Partial,
            records: vec![
                SourcedRecord {
                    source: Some("WEB-INF/lib/a b.jar".to_string()),
                    record: ClassRecord {
                        name: "com.example.Foo".to_string(),
                        superclass: Some("com.example.Base".to_string()),
                        interfaces: vec!["com.example.Bar".to_string(), "java.io.Serializable".to_string()],
                        modifiers: 0x0421,
                        class_annotations: vec!["A".to_string()],
                        field_annotations: vec!["F".to_string()],
                        method_annotations: vec!["M".to_string()],
                    },
                },
                SourcedRecord {
                    source: None,
                    record: ClassRecord::name_only("com.example.Missing"),
                },
            ],
        }
    }

    #[test]
    fn every_format_reproduces_the_table() {
        let table = table();
        for format in [CacheFormat::Plain, CacheFormat::Jandex, CacheFormat::Binary] {
            let bytes = format.encode(&table).unwrap();
            assert_eq!(format.decode(&bytes).unwrap(), table, "{format}");
        }
    }

    #[test]
    fn plain_rejects_unknown_attributes() {
        let text = format!("{PLAIN_HEADER}\npolicy seed\nclass a.B\n  colour red\n");
        let err = CacheFormat::Plain.decode(text.as_bytes()).unwrap_err();
        assert!(matches!(err, EncodingError::Plain { line: 4, .. }));
    }

    #[test]
    fn truncated_binary_is_an_error() {
        let bytes = CacheFormat::Binary.encode(&table()).unwrap();
        assert!(CacheFormat::Binary.decode(&bytes[..bytes.len() / 2]).is_err());
    }
}
