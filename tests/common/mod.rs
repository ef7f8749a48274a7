//! Common fixtures for integration tests: a conforming batch builder and an
//! in-memory connector double.

use std::{sync::Arc, time::Duration};

use arrow::{
    array::{
        new_null_array, ArrayRef, Int32Array, RecordBatch, StringDictionaryBuilder, StructArray,
        TimestampNanosecondArray, UInt64Array,
    },
    datatypes::{DataType, Field, Int32Type},
};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use futures_util::stream;
use tickstore::{schema, MarketSymbol, Source, SourceError, SourceSymbol};

/// Nanoseconds since the epoch for an RFC 3339 timestamp.
pub fn nanos(timestamp: &str) -> i64 {
    timestamp
        .parse::<DateTime<Utc>>()
        .unwrap()
        .timestamp_nanos_opt()
        .unwrap()
}

/// Builds a conforming trades batch for one market, one row per timestamp.
/// Prices and amounts are seeded from the first timestamp so the same input
/// always produces the same batch.
pub fn trades_batch(source: &str, exchange: &str, instrument: &str, times: &[i64]) -> RecordBatch {
    let rows = times.len();
    let mut rng = fastrand::Rng::with_seed(times.first().copied().unwrap_or(0) as u64);

    let dictionary = |value: &str| -> ArrayRef {
        let mut builder = StringDictionaryBuilder::<Int32Type>::new();
        for _ in 0..rows {
            builder.append_value(value);
        }
        Arc::new(builder.finish())
    };
    let mut decimal = || -> ArrayRef {
        let ints: UInt64Array = (0..rows).map(|_| Some(rng.u64(1..10_000_000))).collect();
        let scales = Int32Array::from(vec![8; rows]);
        Arc::new(StructArray::from(vec![
            (
                Arc::new(Field::new("int", DataType::UInt64, false)),
                Arc::new(ints) as ArrayRef,
            ),
            (
                Arc::new(Field::new("scale", DataType::Int32, false)),
                Arc::new(scales) as ArrayRef,
            ),
        ]))
    };
    let sides = {
        let mut builder = StringDictionaryBuilder::<Int32Type>::new();
        for index in 0..rows {
            builder.append_value(if index % 2 == 0 { "buy" } else { "sell" });
        }
        Arc::new(builder.finish()) as ArrayRef
    };

    let schema = schema::trades();
    RecordBatch::try_new(
        schema.clone(),
        vec![
            dictionary("trades"),
            dictionary(source),
            dictionary(exchange),
            dictionary(instrument),
            new_null_array(schema.field(4).data_type(), rows), // external_id
            Arc::new(TimestampNanosecondArray::from(times.to_vec()).with_timezone("UTC")),
            decimal(),
            decimal(),
            sides,
            new_null_array(schema.field(9).data_type(), rows), // order
            new_null_array(schema.field(10).data_type(), rows), // extra_json
        ],
    )
    .expect("conforming trades batch")
}

struct MarketEntry {
    market: MarketSymbol,
    batches: Vec<RecordBatch>,
    failure: Option<String>,
}

/// In-memory connector serving canned batches per market, honouring `since`
/// the way a real connector would: rows strictly before it are withheld.
pub struct StubSource {
    symbol: SourceSymbol,
    markets: Vec<MarketEntry>,
}

impl StubSource {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.parse().unwrap(),
            markets: Vec::new(),
        }
    }

    pub fn with_market(mut self, market: &str, batches: Vec<RecordBatch>) -> Self {
        self.markets.push(MarketEntry {
            market: market.parse().unwrap(),
            batches,
            failure: None,
        });
        self
    }

    /// Like [`StubSource::with_market`], but the stream fails after serving
    /// its batches.
    pub fn with_failing_market(
        mut self,
        market: &str,
        batches: Vec<RecordBatch>,
        message: &str,
    ) -> Self {
        self.markets.push(MarketEntry {
            market: market.parse().unwrap(),
            batches,
            failure: Some(message.to_owned()),
        });
        self
    }
}

impl Source for StubSource {
    fn symbol(&self) -> &SourceSymbol {
        &self.symbol
    }

    async fn markets(&self) -> Result<Vec<MarketSymbol>, SourceError> {
        Ok(self.markets.iter().map(|entry| entry.market.clone()).collect())
    }

    fn trades(
        &self,
        market: &MarketSymbol,
        since: Option<DateTime<Utc>>,
        _deadline: Option<Duration>,
    ) -> impl Stream<Item = Result<RecordBatch, SourceError>> + Send {
        let since = since.map(|since| since.timestamp_nanos_opt().unwrap());
        let mut items: Vec<Result<RecordBatch, SourceError>> = Vec::new();
        if let Some(entry) = self.markets.iter().find(|entry| entry.market == *market) {
            items.extend(
                entry
                    .batches
                    .iter()
                    .filter_map(|batch| from_time(batch, since))
                    .map(Ok),
            );
            if let Some(message) = &entry.failure {
                items.push(Err(SourceError::retryable(message.clone())));
            }
        }
        stream::iter(items)
    }
}

/// Rows of `batch` at or after `since`; batches are time-ordered, so this is
/// a prefix cut.
fn from_time(batch: &RecordBatch, since: Option<i64>) -> Option<RecordBatch> {
    let Some(since) = since else {
        return Some(batch.clone());
    };
    let times = batch
        .column_by_name(schema::TIME_COLUMN)
        .unwrap()
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .unwrap();
    let start = times.values().partition_point(|&time| time < since);
    (start < batch.num_rows()).then(|| batch.slice(start, batch.num_rows() - start))
}
