use std::path::PathBuf;

use chrono::TimeDelta;
use parquet::{
    basic::{Compression, ZstdLevel},
    file::properties::{WriterProperties, WriterVersion},
};

use crate::{id::FileId, symbol::Subject};

/// Configuration for a store rooted at one directory.
///
/// Construct from the root path and override knobs with the builder methods:
///
/// ```no_run
/// use tickstore::StoreOption;
///
/// let option = StoreOption::from("/var/data/ticks").write_workers(8);
/// ```
#[derive(Debug, Clone)]
pub struct StoreOption {
    pub(crate) path: PathBuf,
    pub(crate) row_group_size: usize,
    pub(crate) freshness_threshold: TimeDelta,
    pub(crate) write_workers: usize,
    pub(crate) compaction_queue: usize,
    pub(crate) write_parquet_option: Option<WriterProperties>,
}

impl<P> From<P> for StoreOption
where
    P: Into<PathBuf>,
{
    fn from(path: P) -> Self {
        StoreOption {
            path: path.into(),
            row_group_size: 1_000_000,
            freshness_threshold: TimeDelta::minutes(5),
            write_workers: 4,
            compaction_queue: 16,
            write_parquet_option: None,
        }
    }
}

impl StoreOption {
    /// Root directory of the store.
    pub fn path(self, path: impl Into<PathBuf>) -> Self {
        StoreOption {
            path: path.into(),
            ..self
        }
    }

    /// Rows per Parquet row group; written files are re-chunked to this size.
    pub fn row_group_size(self, row_group_size: usize) -> Self {
        StoreOption {
            row_group_size,
            ..self
        }
    }

    /// Minimum age of a coarse file before the files it shadows may be
    /// removed. Guards against racing an in-flight write or compaction.
    pub fn freshness_threshold(self, freshness_threshold: TimeDelta) -> Self {
        StoreOption {
            freshness_threshold,
            ..self
        }
    }

    /// Concurrent per-batch write jobs across markets.
    pub fn write_workers(self, write_workers: usize) -> Self {
        StoreOption {
            write_workers,
            ..self
        }
    }

    /// Depth of the compaction job queue.
    pub fn compaction_queue(self, compaction_queue: usize) -> Self {
        StoreOption {
            compaction_queue,
            ..self
        }
    }

    /// Parquet writer properties, replacing the zstd defaults.
    pub fn write_parquet_option(self, write_parquet_option: WriterProperties) -> Self {
        StoreOption {
            write_parquet_option: Some(write_parquet_option),
            ..self
        }
    }
}

impl StoreOption {
    pub(crate) fn subject_path(&self, subject: Subject) -> PathBuf {
        self.path.join(subject.as_str())
    }

    /// Directory a file lives in: subject, source, exchange, instrument
    /// (slashes flattened to underscores) and claim year, one level each.
    pub(crate) fn directory_path(&self, file: &FileId) -> PathBuf {
        let mut path = self
            .subject_path(file.subject)
            .join(file.source.as_str())
            .join(file.market.exchange().as_str());
        let mut instrument = String::new();
        for part in file.market.instrument().parts() {
            if !instrument.is_empty() {
                instrument.push('_');
            }
            instrument.push_str(part);
        }
        path = path.join(instrument);
        path.join(format!("{:04}", file.time.year()))
    }

    /// Name of a file inside its directory: the time component, source,
    /// exchange and instrument parts joined by underscores, then the subject
    /// and the `parquet` suffix as dot extensions.
    pub(crate) fn file_name(file: &FileId) -> String {
        let mut name = file.time.file_name_part();
        name.push('_');
        name.push_str(file.source.as_str());
        name.push('_');
        name.push_str(file.market.exchange().as_str());
        for part in file.market.instrument().parts() {
            name.push('_');
            name.push_str(part);
        }
        name.push('.');
        name.push_str(file.subject.as_str());
        name.push_str(".parquet");
        name
    }

    pub(crate) fn file_path(&self, file: &FileId) -> PathBuf {
        self.directory_path(file).join(Self::file_name(file))
    }

    pub(crate) fn write_parquet_properties(&self) -> WriterProperties {
        match &self.write_parquet_option {
            Some(properties) => properties.clone(),
            None => WriterProperties::builder()
                .set_writer_version(WriterVersion::PARQUET_2_0)
                .set_compression(Compression::ZSTD(ZstdLevel::default()))
                .set_max_row_group_size(self.row_group_size)
                .build(),
        }
    }
}
