use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use arrow::{array::RecordBatch, compute::concat_batches, datatypes::SchemaRef};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use futures_util::StreamExt;
use parquet::{
    arrow::{
        async_reader::ParquetRecordBatchStream, AsyncArrowWriter, ParquetRecordBatchStreamBuilder,
    },
    file::{properties::WriterProperties, statistics::Statistics},
};
use tokio::fs::File;
use tracing::debug;
use ulid::Ulid;

use crate::{
    chunker::Chunker,
    id::FileId,
    option::StoreOption,
    repository::{RecordsRepository, RecordsWriter, RepositoryError},
    schema::TIME_COLUMN,
    symbol::{MarketSymbol, Subject},
    timekey::TimeKey,
};

/// Repository over a local directory tree.
///
/// Files live at
/// `<root>/<subject>/<source>/<exchange>/<instrument>/<year>/<name>`, with
/// the instrument's slashes flattened to underscores and the name carrying
/// every id field again. Entries that do not decode back to an id are
/// ignored, so foreign files can sit inside the tree without breaking it.
#[derive(Debug, Clone)]
pub struct LocalRepository {
    option: Arc<StoreOption>,
}

impl LocalRepository {
    /// Opens a repository rooted at `option.path`. The directory does not
    /// need to exist until the first write.
    pub fn new(option: Arc<StoreOption>) -> Self {
        Self { option }
    }

    pub(crate) fn option(&self) -> &StoreOption {
        &self.option
    }

    pub(crate) fn path_of(&self, file: &FileId) -> PathBuf {
        self.option.file_path(file)
    }

    async fn open(&self, file: &FileId) -> Result<File, RepositoryError> {
        match File::open(self.path_of(file)).await {
            Ok(handle) => Ok(handle),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(RepositoryError::NotFound(file.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Streams a stored file row group by row group.
    pub(crate) async fn batch_stream(
        &self,
        file: &FileId,
    ) -> Result<ParquetRecordBatchStream<File>, RepositoryError> {
        let handle = self.open(file).await?;
        Ok(ParquetRecordBatchStreamBuilder::new(handle)
            .await?
            .build()?)
    }

    pub(crate) async fn modified(&self, file: &FileId) -> Result<SystemTime, RepositoryError> {
        let metadata = tokio::fs::metadata(self.path_of(file)).await?;
        Ok(metadata.modified()?)
    }

    pub(crate) async fn rename(&self, from: &FileId, to: &FileId) -> Result<(), RepositoryError> {
        let target = self.path_of(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::rename(self.path_of(from), target).await?)
    }

    /// Removes a stored file. A file that is already gone counts as removed.
    pub(crate) async fn remove(&self, file: &FileId) -> Result<(), RepositoryError> {
        match tokio::fs::remove_file(self.path_of(file)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Every year directory under the root, in enumeration order.
    pub(crate) fn leaf_directories(&self) -> io::Result<Vec<PathBuf>> {
        let mut directories = Vec::new();
        for subject in sorted_dirs(&self.option.path, symbol_key)? {
            for source in sorted_dirs(&subject, symbol_key)? {
                for exchange in sorted_dirs(&source, symbol_key)? {
                    for instrument in sorted_dirs(&exchange, instrument_key)? {
                        directories.extend(sorted_dirs(&instrument, year_key)?);
                    }
                }
            }
        }
        Ok(directories)
    }

    /// Decodes every repository entry directly inside `directory`.
    pub(crate) fn directory_entries(&self, directory: &Path) -> io::Result<Vec<FileId>> {
        let mut files = Vec::new();
        for path in leaf_files(directory)? {
            match parse_entry(&path) {
                Some(file) => files.push(file),
                None => debug!(path = %path.display(), "skipping foreign entry"),
            }
        }
        files.sort_unstable();
        Ok(files)
    }
}

impl RecordsRepository for LocalRepository {
    type Writer = LocalWriter;

    fn find(
        &self,
        subject: Option<Subject>,
    ) -> impl Stream<Item = Result<FileId, RepositoryError>> + Send {
        let root = self.option.path.clone();
        try_stream! {
            let subject_dirs = match subject {
                Some(subject) => vec![root.join(subject.as_str())],
                None => sorted_dirs(&root, symbol_key)?,
            };
            let mut previous = None;
            for subject_dir in subject_dirs {
                for source_dir in sorted_dirs(&subject_dir, symbol_key)? {
                    for exchange_dir in sorted_dirs(&source_dir, symbol_key)? {
                        for instrument_dir in sorted_dirs(&exchange_dir, instrument_key)? {
                            for year_dir in sorted_dirs(&instrument_dir, year_key)? {
                                let mut files = Vec::new();
                                for path in leaf_files(&year_dir)? {
                                    match parse_entry(&path) {
                                        Some(file) => files.push(file),
                                        None => {
                                            debug!(path = %path.display(), "skipping foreign entry")
                                        }
                                    }
                                }
                                files.sort_unstable();
                                for file in files {
                                    yield enforce_ascending(&mut previous, file)?;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn get(&self, file: &FileId) -> Result<RecordBatch, RepositoryError> {
        let mut stream = self.batch_stream(file).await?;
        let schema = stream.schema().clone();
        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            batches.push(batch?);
        }
        Ok(concat_batches(&schema, &batches)?)
    }

    async fn last_time(&self, file: &FileId) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let handle = self.open(file).await?;
        let builder = ParquetRecordBatchStreamBuilder::new(handle).await?;
        let mut last = None;
        for row_group in builder.metadata().row_groups() {
            for column in row_group.columns() {
                if column.column_path().string() != TIME_COLUMN {
                    continue;
                }
                if let Some(Statistics::Int64(statistics)) = column.statistics() {
                    if let Some(max) = statistics.max_opt() {
                        last = Some(last.map_or(*max, |seen: i64| seen.max(*max)));
                    }
                }
            }
        }
        Ok(last.map(DateTime::from_timestamp_nanos))
    }

    fn writer(&self, file: &FileId) -> LocalWriter {
        LocalWriter {
            path: self.path_of(file),
            properties: self.option.write_parquet_properties(),
            row_group_size: self.option.row_group_size,
            open: None,
        }
    }
}

/// Checks that `current` sorts strictly after the id yielded before it.
fn enforce_ascending(
    previous: &mut Option<FileId>,
    current: FileId,
) -> Result<FileId, RepositoryError> {
    if let Some(previous) = previous.replace(current.clone()) {
        if previous >= current {
            return Err(RepositoryError::Consistency {
                previous: Box::new(previous),
                current: Box::new(current),
            });
        }
    }
    Ok(current)
}

// Directory names may prefix-extend each other ("kraken", "kraken-rest"),
// and `-` sorts before every separator of the canonical form. Sorting each
// level by the name as it appears in the canonical string, with the
// following separator appended, keeps the walk in canonical id order.
fn symbol_key(name: &str) -> String {
    format!("{name}:")
}

fn instrument_key(name: &str) -> String {
    format!("{}:", name.replace('_', "/"))
}

fn year_key(name: &str) -> String {
    name.to_owned()
}

/// Subdirectories of `dir` sorted by `key` of their name. A missing `dir`
/// reads as empty; entries that are not directories or not UTF-8 are skipped.
fn sorted_dirs(dir: &Path, key: fn(&str) -> String) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            dirs.push((key(name), entry.path()));
        }
    }
    dirs.sort_unstable();
    Ok(dirs.into_iter().map(|(_, path)| path).collect())
}

fn leaf_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// Decodes a repository path into its id. Beyond the file name itself, every
/// ancestor directory level must agree with the fields the name embeds;
/// anything else is a foreign entry and decodes to `None`.
pub(crate) fn parse_entry(path: &Path) -> Option<FileId> {
    let name = path.file_name()?.to_str()?;
    let file = parse_file_name(name)?;

    let dir = path.parent()?;
    let year = dir.file_name()?.to_str()?;
    let dir = dir.parent()?;
    let instrument = dir.file_name()?.to_str()?;
    let dir = dir.parent()?;
    let exchange = dir.file_name()?.to_str()?;
    let dir = dir.parent()?;
    let source = dir.file_name()?.to_str()?;
    let dir = dir.parent()?;
    let subject = dir.file_name()?.to_str()?;

    let parts: Vec<&str> = file.market.instrument().parts().collect();
    let placed = year == format!("{:04}", file.time.year())
        && instrument == parts.join("_")
        && exchange == file.market.exchange().as_str()
        && source == file.source.as_str()
        && subject == file.subject.as_str();
    placed.then_some(file)
}

fn parse_file_name(name: &str) -> Option<FileId> {
    let mut dots = name.split('.');
    let stem = dots.next()?;
    let subject: Subject = dots.next()?.parse().ok()?;
    if dots.next()? != "parquet" || dots.next().is_some() {
        return None;
    }

    let parts: Vec<&str> = stem.split('_').collect();
    if !(5..=7).contains(&parts.len()) {
        return None;
    }
    // instant time components carry one underscore before the fraction
    let (time, rest) = if parts[0].len() > 10 {
        (format!("{}.{}", parts[0], parts.get(1)?), &parts[2..])
    } else {
        (parts[0].to_owned(), &parts[1..])
    };
    let time = TimeKey::from_file_name_part(&time).ok()?;
    let (source, exchange, instrument) = match rest {
        [source, exchange, base, quote] => (source, exchange, format!("{base}/{quote}")),
        [source, exchange, base, quote, extension] => {
            (source, exchange, format!("{base}/{quote}/{extension}"))
        }
        _ => return None,
    };
    let file = FileId {
        subject,
        source: source.parse().ok()?,
        market: MarketSymbol::new(exchange.parse().ok()?, instrument.parse().ok()?),
        time,
    };
    // reject every non-canonical spelling of the same id
    (StoreOption::file_name(&file) == name).then_some(file)
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", Ulid::new()));
    path.with_file_name(name)
}

/// Writer publishing one Parquet file atomically.
///
/// The first write creates `<name>.tmp-<ulid>` next to the final path, so
/// half-written output never decodes as a repository entry. Batches are
/// re-chunked to the configured row group size on the way through; closing
/// flushes the remainder, finalizes the footer and renames the temporary
/// over the final name.
pub struct LocalWriter {
    path: PathBuf,
    properties: WriterProperties,
    row_group_size: usize,
    open: Option<OpenWriter>,
}

struct OpenWriter {
    temporary: PathBuf,
    writer: AsyncArrowWriter<File>,
    chunker: Chunker,
}

impl OpenWriter {
    // takes its inputs by value: a borrow of the whole writer held across
    // these awaits would make the write future non-Send, since the Parquet
    // writer inside is not Sync
    async fn open(
        path: PathBuf,
        properties: WriterProperties,
        row_group_size: usize,
        schema: SchemaRef,
    ) -> Result<Self, RepositoryError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temporary = temporary_path(&path);
        let handle = File::create(&temporary).await?;
        let writer = AsyncArrowWriter::try_new(handle, schema, Some(properties))?;
        Ok(Self {
            temporary,
            writer,
            chunker: Chunker::new(row_group_size),
        })
    }
}

impl RecordsWriter for LocalWriter {
    async fn write(&mut self, records: RecordBatch) -> Result<(), RepositoryError> {
        let open = match self.open.take() {
            Some(open) => self.open.insert(open),
            None => {
                let opened = OpenWriter::open(
                    self.path.clone(),
                    self.properties.clone(),
                    self.row_group_size,
                    records.schema(),
                )
                .await?;
                self.open.insert(opened)
            }
        };
        open.chunker.push(records)?;
        for chunk in open.chunker.drain() {
            open.writer.write(&chunk).await?;
        }
        Ok(())
    }

    async fn close(mut self) -> Result<(), RepositoryError> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        open.chunker.flush()?;
        for chunk in open.chunker.drain() {
            open.writer.write(&chunk).await?;
        }
        open.writer.close().await?;
        tokio::fs::rename(&open.temporary, &self.path).await?;
        Ok(())
    }
}
