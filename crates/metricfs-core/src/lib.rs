//! # metricfs-core
//!
//! Core library for metricfs — a read-only, user-space filesystem view over
//! directories of newline-delimited metric files in which every record is
//! hidden from the caller unless an authorization oracle grants a specific
//! permission on an object derived from that record.
//!
//! The crate is organized around four components:
//!
//! - **`authz`**: the `(object_type, object_id, permission)` candidate key,
//!   the [`Authorizer`](authz::Authorizer) oracle interface, and its
//!   set-backed, deny-all, and SpiceDB-backed implementations.
//! - **`mapper`**: discovery and parsing of per-directory mapping files,
//!   rule selection, canonical rule hashing, and per-record evaluation into
//!   candidate keys.
//! - **`index`**: the per-file line index that memoizes mapping results in a
//!   content-addressed on-disk cache, plus visibility computation and the
//!   byte-exact filter that copies visible line ranges to a sink.
//! - **`project`**: streaming projection of compressed variants
//!   (`.jsonl.gz`, `.jsonl.tar.gz`) through the mapper and authorizer
//!   without materializing an index.
//!
//! The filesystem mount adapter and the command-line surface live in the
//! `metricfs-cli` crate; everything here is plain library code.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod authz;
pub mod index;
pub mod mapper;
pub mod project;

pub use authz::{Authorizer, CandidateKey};
pub use index::{FileIndex, IndexOptions, LineIndex};
pub use mapper::{MappingRule, SelectedRule};
