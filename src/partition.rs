use std::sync::Arc;

use arrow::{
    array::{Array, DictionaryArray, PrimitiveDictionaryBuilder, RecordBatch, StringArray,
        TimestampNanosecondArray},
    compute,
    datatypes::{DataType, Int32Type, Int64Type, TimeUnit},
    error::ArrowError,
};
use chrono::DateTime;
use thiserror::Error;

use crate::{
    id::FileId,
    schema::{PARTITION_COLUMNS, TIME_COLUMN},
    symbol::{MarketSymbol, SymbolError},
    timekey::TimeKey,
};

const NANOS_PER_DAY: i64 = 86_400_000_000_000;

/// Errors raised while grouping a batch.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// A required column is absent.
    #[error("missing column {0:?}")]
    MissingColumn(&'static str),
    /// A column carries an unexpected Arrow type.
    #[error("column {column:?} has type {actual}, expected {expected}")]
    ColumnType {
        /// Offending column.
        column: &'static str,
        /// Type found in the batch.
        actual: DataType,
        /// Type the schema requires.
        expected: &'static str,
    },
    /// A partition or time column contains nulls.
    #[error("column {0:?} must not contain nulls")]
    NullValues(&'static str),
    /// The time column is not non-decreasing.
    #[error("time column decreases at row {0}")]
    UnsortedTime(usize),
    /// A partition column value violates its symbol grammar.
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    /// Arrow kernel failure while encoding columns.
    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

/// Splits a time-ordered batch into per-market per-UTC-day groups, each a
/// zero-copy slice of the input tagged with the instant-keyed [`FileId`] of
/// its first row.
///
/// Each partition column plus a derived day number is dictionary-encoded, the
/// per-row codes are folded into a single mixed-radix hash, and the batch is
/// cut wherever the hash changes between consecutive rows. Rows arrive
/// time-ordered, so equal keys are adjacent within a day and every group is
/// one contiguous run. Groups come out in row order; writing them in sequence
/// preserves the order of the stream. An empty batch yields no groups.
pub fn partition_records(
    records: &RecordBatch,
) -> Result<Vec<(FileId, RecordBatch)>, PartitionError> {
    if records.num_rows() == 0 {
        return Ok(Vec::new());
    }

    let time = time_column(records)?;
    let mut symbols = Vec::with_capacity(PARTITION_COLUMNS.len());
    for name in PARTITION_COLUMNS {
        symbols.push(encode_symbols(records, name)?);
    }
    let days = encode_days(time)?;

    // Fold the per-column codes into one hash per row. A column whose
    // dictionary holds a single value cannot split anything and is skipped,
    // keeping the radix product small.
    let mut hashes: Option<Vec<i64>> = None;
    for encoded in symbols.iter().chain(std::iter::once(&days)) {
        let radix = encoded.values().len() as i64;
        if radix <= 1 {
            continue;
        }
        let keys = encoded.keys().values();
        match hashes.as_mut() {
            None => hashes = Some(keys.iter().map(|&key| key as i64).collect()),
            Some(acc) => {
                for (acc, &key) in acc.iter_mut().zip(keys.iter()) {
                    *acc = *acc * radix + key as i64;
                }
            }
        }
    }

    let num_rows = records.num_rows();
    let mut starts = vec![0];
    if let Some(hashes) = &hashes {
        for row in 1..num_rows {
            if hashes[row] != hashes[row - 1] {
                starts.push(row);
            }
        }
    }

    let mut groups = Vec::with_capacity(starts.len());
    for (index, &start) in starts.iter().enumerate() {
        let stop = starts.get(index + 1).copied().unwrap_or(num_rows);
        groups.push((
            group_id(&symbols, time, start)?,
            records.slice(start, stop - start),
        ));
    }
    Ok(groups)
}

fn time_column(records: &RecordBatch) -> Result<&TimestampNanosecondArray, PartitionError> {
    let column = records
        .column_by_name(TIME_COLUMN)
        .ok_or(PartitionError::MissingColumn(TIME_COLUMN))?;
    let mismatch = || PartitionError::ColumnType {
        column: TIME_COLUMN,
        actual: column.data_type().clone(),
        expected: "Timestamp(Nanosecond, \"UTC\")",
    };
    match column.data_type() {
        DataType::Timestamp(TimeUnit::Nanosecond, Some(tz)) if tz.as_ref() == "UTC" => {}
        _ => return Err(mismatch()),
    }
    if column.null_count() > 0 {
        return Err(PartitionError::NullValues(TIME_COLUMN));
    }
    let time = column
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .ok_or_else(mismatch)?;
    for (row, pair) in time.values().windows(2).enumerate() {
        if pair[1] < pair[0] {
            return Err(PartitionError::UnsortedTime(row + 1));
        }
    }
    Ok(time)
}

fn encode_symbols(
    records: &RecordBatch,
    name: &'static str,
) -> Result<DictionaryArray<Int32Type>, PartitionError> {
    let column = records
        .column_by_name(name)
        .ok_or(PartitionError::MissingColumn(name))?;
    if column.null_count() > 0 {
        return Err(PartitionError::NullValues(name));
    }
    let encoded = match column.data_type() {
        DataType::Dictionary(_, _) => Arc::clone(column),
        DataType::Utf8 => compute::cast(
            column,
            &DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
        )?,
        other => {
            return Err(PartitionError::ColumnType {
                column: name,
                actual: other.clone(),
                expected: "Dictionary(Int32, Utf8) or Utf8",
            })
        }
    };
    encoded
        .as_any()
        .downcast_ref::<DictionaryArray<Int32Type>>()
        .cloned()
        .ok_or_else(|| PartitionError::ColumnType {
            column: name,
            actual: column.data_type().clone(),
            expected: "Dictionary(Int32, Utf8)",
        })
}

fn encode_days(time: &TimestampNanosecondArray) -> Result<DictionaryArray<Int32Type>, PartitionError> {
    let mut builder = PrimitiveDictionaryBuilder::<Int32Type, Int64Type>::new();
    for value in time.values() {
        // euclidean division keeps pre-epoch timestamps on their UTC day
        builder.append(value.div_euclid(NANOS_PER_DAY))?;
    }
    Ok(builder.finish())
}

fn group_id(
    symbols: &[DictionaryArray<Int32Type>],
    time: &TimestampNanosecondArray,
    row: usize,
) -> Result<FileId, PartitionError> {
    let subject = symbol_value(&symbols[0], PARTITION_COLUMNS[0], row)?;
    let source = symbol_value(&symbols[1], PARTITION_COLUMNS[1], row)?;
    let exchange = symbol_value(&symbols[2], PARTITION_COLUMNS[2], row)?;
    let instrument = symbol_value(&symbols[3], PARTITION_COLUMNS[3], row)?;
    Ok(FileId {
        subject: subject.parse()?,
        source: source.parse()?,
        market: MarketSymbol::new(exchange.parse()?, instrument.parse()?),
        time: TimeKey::Instant(DateTime::from_timestamp_nanos(time.value(row))),
    })
}

fn symbol_value<'a>(
    encoded: &'a DictionaryArray<Int32Type>,
    name: &'static str,
    row: usize,
) -> Result<&'a str, PartitionError> {
    let values = encoded
        .values()
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| PartitionError::ColumnType {
            column: name,
            actual: encoded.values().data_type().clone(),
            expected: "Utf8 dictionary values",
        })?;
    Ok(values.value(encoded.keys().value(row) as usize))
}
