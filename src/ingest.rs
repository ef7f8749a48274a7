//! Ingest orchestration: resume points, streaming writes and compaction.
//!
//! A [`DatasetWriter`] owns its worker pools for the duration of a run;
//! nothing here spawns onto implicit global state beyond the Tokio runtime
//! it was created in.

use std::{path::PathBuf, pin::pin, sync::Arc, time::Duration};

use arrow::array::RecordBatch;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::{
    sync::{oneshot, Semaphore},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    compaction::{CompactionError, CompactionReport, Compactor},
    id::FileId,
    option::StoreOption,
    partition::{partition_records, PartitionError},
    repository::{LocalRepository, RecordsRepository, RecordsWriter, RepositoryError},
    source::{Source, SourceError},
    symbol::{MarketSymbol, Subject},
    timekey::TimeKey,
};

/// A failure inside one per-batch write job.
#[derive(Debug, Error)]
pub enum WriteLoopError {
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Errors aborting an ingest run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Write(#[from] WriteLoopError),
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    #[error("write worker failed: {0}")]
    Task(#[from] JoinError),
    #[error("worker is shut down")]
    WorkerStopped,
    /// The run failed after committing files; the report carries them, so
    /// durable work is never silently lost.
    #[error("ingest aborted after {} committed files", .report.committed.len())]
    Aborted {
        report: Box<IngestReport>,
        #[source]
        source: Box<IngestError>,
    },
}

/// What one ingest run accomplished.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Files committed, in commit order.
    pub committed: Vec<FileId>,
    /// Compaction outcome per directory the run touched.
    pub compacted: Vec<(PathBuf, CompactionReport)>,
}

/// Per-run controls for [`DatasetWriter::write_trades`].
#[derive(Debug, Default, Clone)]
pub struct IngestOptions {
    /// Wall-clock budget handed to the source; the stream ends on its own
    /// once it elapses.
    pub deadline: Option<Duration>,
    /// Cooperative stop. Firing it behaves like a clean end of stream:
    /// committed work stays and compaction still runs.
    pub cancel: CancellationToken,
}

/// Bounded permit set sizing concurrent per-batch write jobs.
struct WritePool {
    permits: Arc<Semaphore>,
}

impl WritePool {
    fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Runs one write job once a permit frees up and awaits its outcome.
    /// `Sync` because the job borrows the repository across writer awaits
    /// on its own task.
    async fn submit<R>(
        &self,
        repository: R,
        records: RecordBatch,
    ) -> Result<(Vec<FileId>, Option<WriteLoopError>), IngestError>
    where
        R: RecordsRepository + Send + Sync + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::WorkerStopped)?;
        let job = tokio::spawn(async move {
            let outcome = write_batch(repository, records).await;
            drop(permit);
            outcome
        });
        Ok(job.await?)
    }
}

/// Writes one batch group by group, committing each file in claim order.
/// Returns the committed files and the first failure; committed work is
/// reported even when a later group fails.
async fn write_batch<R>(
    repository: R,
    records: RecordBatch,
) -> (Vec<FileId>, Option<WriteLoopError>)
where
    R: RecordsRepository,
{
    let mut committed = Vec::new();
    let groups = match partition_records(&records) {
        Ok(groups) => groups,
        Err(error) => return (committed, Some(error.into())),
    };
    for (file, slice) in groups {
        let outcome = async {
            let mut writer = repository.writer(&file);
            writer.write(slice).await?;
            writer.close().await
        }
        .await;
        match outcome {
            Ok(()) => committed.push(file),
            Err(error) => return (committed, Some(error.into())),
        }
    }
    (committed, None)
}

struct CompactionJob {
    directory: PathBuf,
    reply: oneshot::Sender<Result<CompactionReport, CompactionError>>,
}

/// One dedicated task draining compaction jobs from a bounded queue. The
/// worker is aborted when the handle drops.
struct CompactionWorker {
    jobs: flume::Sender<CompactionJob>,
    worker: JoinHandle<()>,
}

impl CompactionWorker {
    fn spawn(compactor: Compactor, queue: usize) -> Self {
        let (jobs, incoming) = flume::bounded::<CompactionJob>(queue.max(1));
        let worker = tokio::spawn(async move {
            while let Ok(job) = incoming.recv_async().await {
                let report = compactor.index_directory(&job.directory).await;
                // the requester may have given up by now
                let _ = job.reply.send(report);
            }
        });
        Self { jobs, worker }
    }

    async fn index(&self, directory: PathBuf) -> Result<CompactionReport, IngestError> {
        let (reply, answer) = oneshot::channel();
        self.jobs
            .send_async(CompactionJob { directory, reply })
            .await
            .map_err(|_| IngestError::WorkerStopped)?;
        match answer.await {
            Ok(report) => Ok(report?),
            Err(_) => Err(IngestError::WorkerStopped),
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Orchestrates ingest runs for one source over one repository.
pub struct DatasetWriter<S> {
    repository: LocalRepository,
    source: S,
    pool: WritePool,
    compaction: CompactionWorker,
}

impl<S: Source> DatasetWriter<S> {
    /// Builds a writer and spawns its workers; requires a running Tokio
    /// runtime.
    pub fn new(option: Arc<StoreOption>, source: S) -> Self {
        let repository = LocalRepository::new(option.clone());
        let pool = WritePool::new(option.write_workers);
        let compaction = CompactionWorker::spawn(
            Compactor::new(repository.clone()),
            option.compaction_queue,
        );
        Self {
            repository,
            source,
            pool,
            compaction,
        }
    }

    /// The source driving this writer.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Streams one market's trades from the resume point into the store.
    ///
    /// Batches are partitioned and written through the pool, one job at a
    /// time per market, so files commit in stream order. The first failure
    /// stops the loop and surfaces as [`IngestError::Aborted`] carrying the
    /// files already committed. Cancellation and the deadline end the run
    /// cleanly instead. Either way every directory touched by committed
    /// files is compacted before the report is returned.
    pub async fn write_trades(
        &self,
        market: &MarketSymbol,
        options: IngestOptions,
    ) -> Result<IngestReport, IngestError> {
        let since = self.resume_point(market).await?;
        info!(market = %market, since = ?since, "ingest run started");

        let mut committed: Vec<FileId> = Vec::new();
        let mut failure: Option<IngestError> = None;
        {
            // dropping the stream on exit cancels the source
            let mut stream = pin!(self.source.trades(market, since, options.deadline));
            loop {
                let batch = match options.cancel.run_until_cancelled(stream.next()).await {
                    None => {
                        debug!(market = %market, "ingest cancelled");
                        break;
                    }
                    Some(None) => break,
                    Some(Some(Ok(batch))) => batch,
                    Some(Some(Err(error))) => {
                        failure = Some(error.into());
                        break;
                    }
                };
                match self.pool.submit(self.repository.clone(), batch).await {
                    Ok((files, job_failure)) => {
                        committed.extend(files);
                        if let Some(error) = job_failure {
                            failure = Some(error.into());
                            break;
                        }
                    }
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
        }

        let directories = touched_directories(&self.repository, &committed);
        let compacted = self.compact_directories(directories).await;
        let report = IngestReport {
            committed,
            compacted,
        };
        match failure {
            None => {
                info!(
                    market = %market,
                    committed = report.committed.len(),
                    "ingest run finished"
                );
                Ok(report)
            }
            Some(source) => {
                error!(
                    market = %market,
                    committed = report.committed.len(),
                    error = %source,
                    "ingest run aborted"
                );
                Err(IngestError::Aborted {
                    report: Box::new(report),
                    source: Box::new(source),
                })
            }
        }
    }

    /// Re-indexes the whole repository: every leaf directory is compacted,
    /// with per-directory failures logged and skipped.
    pub async fn index(&self) -> Result<Vec<(PathBuf, CompactionReport)>, IngestError> {
        let directories = self
            .repository
            .leaf_directories()
            .map_err(RepositoryError::from)?;
        Ok(self.compact_directories(directories).await)
    }

    /// Latest durable timestamp for this source's trades on one market. The
    /// next run resumes at the returned time; `None` means the market has no
    /// stored trades at all.
    async fn resume_point(
        &self,
        market: &MarketSymbol,
    ) -> Result<Option<DateTime<Utc>>, IngestError> {
        let mut best: Option<(DateTime<Utc>, FileId)> = None;
        {
            let mut files = pin!(self.repository.find(Some(Subject::Trades)));
            while let Some(file) = files.next().await {
                let file = file?;
                if file.source != *self.source.symbol() || file.market != *market {
                    continue;
                }
                let end = file.time.interval().end();
                // on ties the later enumeration wins, so a point claim
                // supersedes the calendar period ending where it sits
                if best.as_ref().map_or(true, |(seen, _)| end >= *seen) {
                    best = Some((end, file));
                }
            }
        }
        let Some((end, file)) = best else {
            return Ok(None);
        };
        // calendar claims already tell where stored data stops; point claims
        // only mark the first row, so ask the footer where the file ends
        let since = match file.time {
            TimeKey::Instant(_) => match self.repository.last_time(&file).await? {
                Some(last) => last + TimeDelta::nanoseconds(1),
                None => end,
            },
            _ => end,
        };
        debug!(market = %market, %since, frontier = %file, "derived resume point");
        Ok(Some(since))
    }

    async fn compact_directories(
        &self,
        directories: Vec<PathBuf>,
    ) -> Vec<(PathBuf, CompactionReport)> {
        let mut compacted = Vec::new();
        for directory in directories {
            match self.compaction.index(directory.clone()).await {
                Ok(report) => compacted.push((directory, report)),
                Err(IngestError::WorkerStopped) => {
                    error!("compaction worker stopped, leaving remaining directories unindexed");
                    break;
                }
                Err(error) => {
                    warn!(
                        directory = %directory.display(),
                        %error,
                        "compaction failed, skipping directory"
                    );
                }
            }
        }
        compacted
    }
}

/// Distinct parent directories of the committed files, in commit order.
fn touched_directories(repository: &LocalRepository, committed: &[FileId]) -> Vec<PathBuf> {
    let mut directories = Vec::new();
    for file in committed {
        if let Some(parent) = repository.path_of(file).parent() {
            if !directories.iter().any(|seen| seen == parent) {
                directories.push(parent.to_path_buf());
            }
        }
    }
    directories
}
