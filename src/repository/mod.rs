//! Content-addressed storage of record files.
//!
//! A repository maps [`FileId`]s to Parquet files one-to-one: the id encodes
//! the path and the path encodes the id. Enumeration yields ids in ascending
//! canonical order, writes become visible atomically on close, and nothing
//! inside the tree is ever interpreted as state beyond the paths themselves.

mod local;

use std::{future::Future, io};

use arrow::{array::RecordBatch, error::ArrowError};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use parquet::errors::ParquetError;
use thiserror::Error;

pub use self::local::{LocalRepository, LocalWriter};
use crate::{id::FileId, symbol::Subject};

/// Errors from repository enumeration, reads and writes.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The requested file is not in the repository.
    #[error("file not found: {0}")]
    NotFound(FileId),
    /// Enumeration yielded ids out of ascending order: external tampering or
    /// a walk bug, never a well-formed tree.
    #[error("enumeration order violated: {current} does not sort after {previous}")]
    Consistency {
        /// Id yielded before the violation.
        previous: Box<FileId>,
        /// Id that failed to sort after it.
        current: Box<FileId>,
    },
    /// Filesystem failure.
    #[error("repository io error: {0}")]
    Io(#[from] io::Error),
    /// Parquet encode or decode failure.
    #[error("repository parquet error: {0}")]
    Parquet(#[from] ParquetError),
    /// Arrow failure while assembling batches.
    #[error("repository arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

/// Read and write surface over one repository root.
pub trait RecordsRepository {
    /// Writer type produced by [`RecordsRepository::writer`].
    type Writer: RecordsWriter;

    /// Enumerates stored files in ascending [`FileId`] order, optionally
    /// confined to one subject. Every yielded id sorts strictly after the
    /// previous one; a violation surfaces as [`RepositoryError::Consistency`].
    fn find(
        &self,
        subject: Option<Subject>,
    ) -> impl Stream<Item = Result<FileId, RepositoryError>> + Send;

    /// Reads a whole stored file into one record batch.
    fn get(
        &self,
        file: &FileId,
    ) -> impl Future<Output = Result<RecordBatch, RepositoryError>> + Send;

    /// Latest event time recorded in the file's footer statistics, if any.
    fn last_time(
        &self,
        file: &FileId,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, RepositoryError>> + Send;

    /// Opens a writer that will become visible as `file` once closed.
    fn writer(&self, file: &FileId) -> Self::Writer;
}

/// Incremental writer for one stored file.
///
/// Nothing is visible until [`RecordsWriter::close`] succeeds; a writer
/// dropped before that leaves at most an invisible temporary. Closing
/// consumes the writer, so a finished file cannot be appended to by
/// construction.
pub trait RecordsWriter: Send {
    /// Appends a batch to the file.
    fn write(
        &mut self,
        records: RecordBatch,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Flushes buffered rows, finalizes the footer and atomically publishes
    /// the file. Closing a writer that never received rows is a no-op.
    fn close(self) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
