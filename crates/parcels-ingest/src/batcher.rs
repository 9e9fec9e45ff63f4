//! Fixed-size batching over a record stream
//!
//! Groups parsed records into batches of at most `batch_size`, emitting one
//! final partial batch at end of stream (a single leftover record is still a
//! batch; remainders are never dropped). At most one batch of records is held
//! in memory at a time, which is what keeps multi-gigabyte files ingestible.

use crate::error::Result;
use crate::parser::{Parsed, RecordStream};
use crate::record::{Header, Record};
use std::sync::Arc;

/// Batches records from a [`RecordStream`], counting rejected rows as it goes
pub struct Batcher {
    stream: RecordStream,
    batch_size: usize,
    records_seen: u64,
    malformed: u64,
    exhausted: bool,
}

impl Batcher {
    pub fn new(stream: RecordStream, batch_size: usize) -> Self {
        debug_assert!(batch_size > 0);
        Self {
            stream,
            batch_size,
            records_seen: 0,
            malformed: 0,
            exhausted: false,
        }
    }

    pub fn header(&self) -> &Arc<Header> {
        self.stream.header()
    }

    /// Well-formed records seen so far (batched or in flight)
    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    /// Rows rejected so far for a field-count mismatch
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Produce the next batch, or `None` once the stream is drained
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.stream.next().await? {
                Some(Parsed::Row(record)) => {
                    self.records_seen += 1;
                    batch.push(record);
                }
                Some(Parsed::Malformed { .. }) => {
                    self.malformed += 1;
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}
