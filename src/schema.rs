use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use once_cell::sync::Lazy;

/// Columns identifying who and what, shared by every stored subject and used
/// by the partitioner to split mixed batches. They lead every schema so that
/// files prune cheaply on the columns the path scheme is built from.
pub const PARTITION_COLUMNS: [&str; 4] = ["subject", "source", "exchange", "instrument"];

/// Name of the event-time column.
pub const TIME_COLUMN: &str = "time";

fn dictionary_utf8() -> DataType {
    DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
}

// Fixed-point decimal: unscaled integer plus decimal scale, exact at any
// venue precision.
fn decimal_fields() -> Fields {
    Fields::from(vec![
        Field::new("int", DataType::UInt64, false),
        Field::new("scale", DataType::Int32, false),
    ])
}

fn external_id_fields() -> Fields {
    Fields::from(vec![
        Field::new("prefix", DataType::Utf8, true),
        Field::new("numeric", DataType::UInt64, true),
        Field::new("uuid", DataType::FixedSizeBinary(16), true),
    ])
}

static TRADES: Lazy<SchemaRef> = Lazy::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("subject", dictionary_utf8(), false),
        Field::new("source", dictionary_utf8(), false),
        Field::new("exchange", dictionary_utf8(), false),
        Field::new("instrument", dictionary_utf8(), false),
        Field::new("external_id", DataType::Struct(external_id_fields()), true),
        Field::new(
            TIME_COLUMN,
            DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            false,
        ),
        Field::new("price", DataType::Struct(decimal_fields()), false),
        Field::new("amount", DataType::Struct(decimal_fields()), false),
        Field::new("side", dictionary_utf8(), true),
        Field::new("order", dictionary_utf8(), true),
        Field::new("extra_json", DataType::Utf8, true),
    ]))
});

/// Schema shared by all stored trade files.
pub fn trades() -> SchemaRef {
    TRADES.clone()
}
