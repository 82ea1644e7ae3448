//! # Suitcase Protocol
//!
//! Wire types for the Aggregate table API.
//!
//! This crate provides:
//! - `TableResource` / `TableDefinition` / `TableSchema` for table metadata
//! - `RowResource` and `RowPage` for cursor-paginated row data
//! - `AttachmentManifest` for per-row binary file references
//! - `AlterRowsRequest` / `RowOutcomeList` for uploads
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachment;
mod error;
mod row;
mod table;

pub use attachment::{AttachmentManifest, ManifestEntry};
pub use error::{ProtocolError, ProtocolResult};
pub use row::{AlterRowsRequest, Outcome, RowMetadata, RowOutcome, RowOutcomeList, RowPage, RowResource};
pub use table::{ColumnDefinition, ColumnType, TableDefinition, TableResource, TableSchema};
