//! Columnar storage for market trade records.
//!
//! Trades arrive as Arrow `RecordBatch` values, are partitioned by market
//! identity and event day, and land as Parquet files whose paths carry their
//! whole identity. The repository holds no state beyond those paths. An
//! age-tiered compactor folds fine-grained files into day, month and year
//! buckets as they age, so every market converges towards one file per
//! calendar period.

mod chunker;

/// Age-tiered folding of fine-grained files into calendar buckets.
pub mod compaction;

/// Canonical file identity: subject, source, market and time claim.
pub mod id;

/// Ingest orchestration: resume points, write pool, compaction worker.
pub mod ingest;

/// Store configuration and the on-disk path scheme.
pub mod option;

/// Partitioning of record batches by market identity and event day.
pub mod partition;

/// Storage of record files behind the repository traits.
pub mod repository;

/// The canonical Arrow schema for trade records.
pub mod schema;

/// The seam towards external market-data connectors.
pub mod source;

/// Symbol grammar for subjects, sources, exchanges and instruments.
pub mod symbol;

/// Time claims: calendar keys, instants and intervals.
pub mod timekey;

// Re-export the working surface so callers can do `tickstore::DatasetWriter`.
pub use crate::{
    compaction::{CompactionError, CompactionReport, Compactor},
    id::{FileId, ParseFileIdError},
    ingest::{DatasetWriter, IngestError, IngestOptions, IngestReport, WriteLoopError},
    option::StoreOption,
    partition::{partition_records, PartitionError},
    repository::{LocalRepository, LocalWriter, RecordsRepository, RecordsWriter, RepositoryError},
    source::{Source, SourceError},
    symbol::{
        AssetSymbol, ExchangeSymbol, InstrumentSymbol, MarketSymbol, SourceSymbol, Subject,
        Symbol, SymbolError,
    },
    timekey::{TimeError, TimeInterval, TimeKey},
};
