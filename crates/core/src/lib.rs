//! Generic immutable value runtime: foundation layer.
//!
//! This crate provides the tagged value word, the allocator capability
//! contract and its concrete variants (bump, growable/mremap, malloc,
//! content-addressed dedup, auto-selecting), the allocator configuration
//! grammar, and the builder that ties a value representation to an
//! allocator and a tag.
//!
//! Everything here is allocation-and-representation plumbing. The
//! persistent update engine, collection operations, and thread pool that
//! operate *on* values built here live in `fy-value-runtime`.
//!
//! # Modules
//!
//! - `error`: the `CoreError` enum shared by every fallible entry point.
//! - `value`: the NaN-boxed `Value` word, its kinds, and its pure inspectors.
//! - `records`: the raw composite records (string/sequence/mapping/alias)
//!   a boxed `Value` points into.
//! - `allocator`: the `Allocator` trait, capability bitset, and the bump /
//!   growable / malloc / dedup / auto implementations.
//! - `config`: the allocator configuration string grammar.
//! - `builder`: the sole public factory for values.

pub mod allocator;
pub mod builder;
pub mod config;
pub mod error;
pub mod records;
pub mod value;

pub use allocator::{Allocator, AllocatorDump, CapFlags, Tag, TAG_DEFAULT, TAG_ERROR, TAG_NONE};
pub use builder::{Builder, BuilderConfig, BuilderPolicy, Document};
pub use error::{CoreError, CoreResult};
pub use value::{structural_eq, Kind, Value};
