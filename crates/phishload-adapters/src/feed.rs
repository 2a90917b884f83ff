use csv_async::{AsyncReader, AsyncReaderBuilder, ByteRecord};
use phishload_core::RawRow;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// Columns a row cannot be accepted without.
pub const REQUIRED_COLUMNS: [&str; 2] = ["phish_id", "url"];

#[derive(Debug, Error)]
pub enum RowDecodeError {
    #[error("row at line {line} is not valid UTF-8 in column {column}: {raw}")]
    Utf8 {
        line: u64,
        column: &'static str,
        raw: String,
    },
    #[error("feed stream failed: {0}")]
    Stream(#[from] csv_async::Error),
}

/// Positions of the known columns within the header line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedHeader {
    pub columns: Vec<String>,
    phish_id: Option<usize>,
    url: Option<usize>,
    submission_time: Option<usize>,
    verified: Option<usize>,
}

impl FeedHeader {
    pub fn from_columns<'a>(columns: impl IntoIterator<Item = &'a str>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(|c| c.trim().to_string()).collect();
        let position = |name: &str| columns.iter().position(|c| c == name);
        Self {
            phish_id: position("phish_id"),
            url: position("url"),
            submission_time: position("submission_time"),
            verified: position("verified"),
            columns,
        }
    }

    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_COLUMNS
            .into_iter()
            .filter(|name| !self.columns.iter().any(|c| c == name))
            .collect()
    }

    pub fn decode(&self, record: &ByteRecord) -> Result<RawRow, RowDecodeError> {
        Ok(RawRow {
            phish_id: decode_field(record, self.phish_id, "phish_id")?,
            url: decode_field(record, self.url, "url")?,
            submission_time: decode_field(record, self.submission_time, "submission_time")?,
            verified: decode_field(record, self.verified, "verified")?,
        })
    }
}

fn decode_field(
    record: &ByteRecord,
    index: Option<usize>,
    column: &'static str,
) -> Result<Option<String>, RowDecodeError> {
    let Some(bytes) = index.and_then(|i| record.get(i)) else {
        return Ok(None);
    };
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(Some(text.to_string())),
        Err(_) => Err(RowDecodeError::Utf8 {
            line: record.position().map(|p| p.line()).unwrap_or_default(),
            column,
            raw: lossy_row(record),
        }),
    }
}

fn lossy_row(record: &ByteRecord) -> String {
    record
        .iter()
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(",")
}

/// Pull-based row source over a header + comma-delimited body.
pub struct FeedReader<R: AsyncRead + Unpin + Send> {
    reader: AsyncReader<R>,
    header: FeedHeader,
    record: ByteRecord,
    finished: bool,
}

impl<R> FeedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub async fn new(body: R) -> Result<Self, RowDecodeError> {
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .create_reader(body);
        let header = FeedHeader::from_columns(reader.headers().await?.iter());

        let missing = header.missing_required();
        if missing.is_empty() {
            debug!(columns = ?header.columns, "feed header resolved");
        } else {
            warn!(?missing, columns = ?header.columns, "feed header lacks required columns; every row will be discarded");
        }

        Ok(Self {
            reader,
            header,
            record: ByteRecord::new(),
            finished: false,
        })
    }

    pub fn header(&self) -> &FeedHeader {
        &self.header
    }

    /// `None` once the feed is exhausted. A stream error is yielded once and
    /// then ends the sequence.
    pub async fn next_row(&mut self) -> Option<Result<RawRow, RowDecodeError>> {
        if self.finished {
            return None;
        }
        match self.reader.read_byte_record(&mut self.record).await {
            Ok(true) => Some(self.header.decode(&self.record)),
            Ok(false) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err.into()))
            }
        }
    }
}
