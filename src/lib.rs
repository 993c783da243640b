//! # annocache
//!
//! Annotation target scanning, caching and verification for Java modules.
//!
//! ## Architecture
//!
//! - **intern**: Canonical shared name strings
//! - **bidi**: Holder/held many-to-many maps for annotations
//! - **policy**: Scan policies, policy masks and annotation categories
//! - **classfile**: Structural class-file reader behind the `ClassDecoder` seam
//! - **source**: Directory, jar and in-memory class sources and their aggregate
//! - **table**: One policy region of scanned class data
//! - **targets**: The four regions together with subclass and implementor indexes
//! - **scan**: Parallel aggregate scanner with external supertype resolution
//! - **encoding**: Plain, Jandex-style and binary table encodings
//! - **cache**: Persistent per-suffix target cache
//! - **delta**: Table differences and their messages
//! - **validate**: Structural checks and the validation cycle
//! - **assembly**: Module source layouts and lazily loaded targets
//! - **suite**: Option cases run against a reference scan

pub mod fault;

pub mod assembly;
pub mod bidi;
pub mod cache;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod delta;
pub mod encoding;
pub mod intern;
pub mod lazy;
pub mod policy;
pub mod scan;
pub mod source;
pub mod suite;
pub mod table;
pub mod targets;
pub mod timing;
pub mod validate;
