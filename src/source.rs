//! The seam between the store and external market-data connectors.

use std::{future::Future, time::Duration};

use arrow::array::RecordBatch;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use thiserror::Error;

use crate::symbol::{MarketSymbol, SourceSymbol};

/// Failure surface of a connector: an opaque message plus a hint whether a
/// later run may succeed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SourceError {
    message: String,
    retryable: bool,
}

impl SourceError {
    /// A terminal failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// A failure worth retrying on a later run.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// An external provider of trade records for one venue's markets.
///
/// Implementations live outside this crate; the store only relies on the
/// contract spelled out on [`Source::trades`].
pub trait Source: Send + Sync {
    /// Identity recorded in every file this source produces.
    fn symbol(&self) -> &SourceSymbol;

    /// Markets the source can currently serve.
    fn markets(&self) -> impl Future<Output = Result<Vec<MarketSymbol>, SourceError>> + Send;

    /// Opens a trade stream for one market.
    ///
    /// Batches conform to the trades schema and are time-ordered within and
    /// across batches. With `since` given, the stream resumes at `since`;
    /// earlier trades were already stored and must not reappear. With a
    /// `deadline`, the stream ends on its own once that much wall-clock time
    /// has elapsed. Dropping the stream cancels in-flight work, which is how
    /// the ingest loop shuts a source down early.
    fn trades(
        &self,
        market: &MarketSymbol,
        since: Option<DateTime<Utc>>,
        deadline: Option<Duration>,
    ) -> impl Stream<Item = Result<RecordBatch, SourceError>> + Send;
}
