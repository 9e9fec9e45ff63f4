//! Streaming CSV record parser
//!
//! Reads a delimited file top to bottom, deriving a normalized [`Header`]
//! from the first row and yielding one [`Record`] per subsequent row. The
//! underlying reader is quote-aware: embedded delimiters and doubled quotes
//! inside quoted fields parse to their literal values.
//!
//! A row whose field count differs from the header is yielded as
//! [`Parsed::Malformed`] rather than failing the stream, so one bad line
//! never aborts a multi-gigabyte file. Resume granularity is whole-file;
//! there is no mid-file seek.

use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::BufReader;
use tracing::warn;

use crate::error::{IngestError, Result};
use crate::record::{Header, Record};

/// Outcome of parsing one data row
#[derive(Debug)]
pub enum Parsed {
    /// A well-formed row
    Row(Record),
    /// A row whose field count does not match the header; rejected and
    /// counted, never coerced
    Malformed {
        line: u64,
        expected: usize,
        found: usize,
    },
}

/// Lazy record stream over one source file
#[derive(Debug)]
pub struct RecordStream {
    reader: AsyncReader<BufReader<File>>,
    header: Arc<Header>,
    path: String,
    // Reused row buffer; one row is the only thing held between reads.
    row: StringRecord,
    rows_read: u64,
}

impl RecordStream {
    /// Open a file and parse its header row
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await?;
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .create_reader(BufReader::new(file));

        let raw_header = reader.headers().await?.clone();
        let header = Header::from_raw(raw_header.iter());
        if header.is_empty() {
            return Err(IngestError::MissingHeader(path.display().to_string()));
        }

        Ok(Self {
            reader,
            header: Arc::new(header),
            path: path.display().to_string(),
            row: StringRecord::new(),
            rows_read: 0,
        })
    }

    /// The file's normalized header
    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    /// Read the next data row, or `None` at end of file
    pub async fn next(&mut self) -> Result<Option<Parsed>> {
        if !self.reader.read_record(&mut self.row).await? {
            return Ok(None);
        }
        self.rows_read += 1;

        let expected = self.header.len();
        let found = self.row.len();
        if found != expected {
            // Header line is line 1, so data row N starts at line N+1.
            let line = self
                .row
                .position()
                .map(|p| p.line())
                .unwrap_or(self.rows_read + 1);
            warn!(
                file = %self.path,
                line,
                expected,
                found,
                "rejecting malformed row"
            );
            return Ok(Some(Parsed::Malformed {
                line,
                expected,
                found,
            }));
        }

        Ok(Some(Parsed::Row(Record::from_fields(self.row.iter()))))
    }
}
