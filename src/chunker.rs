use std::mem;

use arrow::{array::RecordBatch, compute::concat_batches, error::ArrowError};

/// Re-chunks a stream of arbitrarily sized batches into chunks of exactly
/// `target_rows` rows, holding the remainder until [`Chunker::flush`].
///
/// Each written chunk becomes one Parquet row group, so equalizing chunk size
/// keeps row-group statistics and scan granularity predictable no matter how
/// the source sliced the stream.
pub(crate) struct Chunker {
    target_rows: usize,
    buffer: Vec<RecordBatch>,
    buffered_rows: usize,
    ready: Vec<RecordBatch>,
}

impl Chunker {
    pub(crate) fn new(target_rows: usize) -> Self {
        Chunker {
            // a zero target would slice forever
            target_rows: target_rows.max(1),
            buffer: Vec::new(),
            buffered_rows: 0,
            ready: Vec::new(),
        }
    }

    /// Adds a batch; completed chunks become available from [`Chunker::drain`].
    pub(crate) fn push(&mut self, records: RecordBatch) -> Result<(), ArrowError> {
        self.buffered_rows += records.num_rows();
        self.buffer.push(records);
        if self.buffered_rows < self.target_rows {
            return Ok(());
        }
        let schema = self.buffer[0].schema();
        let mut rest = concat_batches(&schema, &self.buffer)?;
        self.buffer.clear();
        while rest.num_rows() >= self.target_rows {
            self.ready.push(rest.slice(0, self.target_rows));
            rest = rest.slice(self.target_rows, rest.num_rows() - self.target_rows);
        }
        self.buffered_rows = rest.num_rows();
        if self.buffered_rows > 0 {
            self.buffer.push(rest);
        }
        Ok(())
    }

    /// Moves the buffered remainder into the ready queue; call once before
    /// the writer closes.
    pub(crate) fn flush(&mut self) -> Result<(), ArrowError> {
        if self.buffered_rows == 0 {
            return Ok(());
        }
        let schema = self.buffer[0].schema();
        let rest = concat_batches(&schema, &self.buffer)?;
        self.buffer.clear();
        self.buffered_rows = 0;
        self.ready.push(rest);
        Ok(())
    }

    /// Takes every chunk completed so far, in order.
    pub(crate) fn drain(&mut self) -> Vec<RecordBatch> {
        mem::take(&mut self.ready)
    }
}
