//! Batch parser for pipe-delimited FEC bulk files.
//!
//! `parse_batch` seeks to a byte offset, reads at most `batch_size` rows and
//! reports the exact offset consumed so the caller can checkpoint it once the
//! batch has been committed.

use crate::error::Result;
use crate::records::RecordKind;
use csv::{ByteRecord, ReaderBuilder, Terminator};
use log::debug;
use std::io::{Read, Seek, SeekFrom};

pub const FIELD_DELIMITER: u8 = b'|';

/// Positional field values of one row. Missing positions read as "".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    values: Vec<String>,
}

impl Fields {
    pub fn from_line(line: &str) -> Self {
        Self {
            values: line
                .split(FIELD_DELIMITER as char)
                .map(|v| v.to_string())
                .collect(),
        }
    }

    pub fn from_byte_record(record: &ByteRecord) -> Self {
        Self {
            values: record
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect(),
        }
    }

    pub fn get(&self, idx: usize) -> &str {
        self.values.get(idx).map(|v| v.trim()).unwrap_or("")
    }

    pub fn string(&self, idx: usize) -> String {
        self.get(idx).to_string()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub trait FecRecord: Sized {
    const KIND: RecordKind;

    fn from_fields(fields: &Fields) -> Self;
}

#[derive(Debug, Clone)]
pub struct ParsedBatch<R> {
    pub records: Vec<R>,
    /// Start offset of each record, parallel to `records`.
    pub offsets: Vec<u64>,
    /// Byte offset just past the last consumed row. May stop before that
    /// row's line terminator; a resumed parse skips the empty remainder.
    pub next_offset: u64,
    /// True when fewer than `batch_size` rows were available.
    pub exhausted: bool,
}

pub fn parse_batch<R, S>(stream: &mut S, start: u64, batch_size: usize) -> Result<ParsedBatch<R>>
where
    R: FecRecord,
    S: Read + Seek,
{
    stream.seek(SeekFrom::Start(start))?;

    let mut reader = ReaderBuilder::new()
        .delimiter(FIELD_DELIMITER)
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .terminator(Terminator::CRLF)
        .from_reader(stream);

    let mut row = ByteRecord::new();
    let mut records = Vec::with_capacity(batch_size.min(4096));
    let mut offsets = Vec::with_capacity(records.capacity());

    while records.len() < batch_size {
        let row_start = start + reader.position().byte();
        if !reader.read_byte_record(&mut row)? {
            break;
        }
        let fields = Fields::from_byte_record(&row);
        records.push(R::from_fields(&fields));
        offsets.push(row_start);
    }

    let next_offset = start + reader.position().byte();
    let exhausted = records.len() < batch_size;
    debug!(
        "Parsed {} {:?} rows from offset {} to {}",
        records.len(),
        R::KIND,
        start,
        next_offset
    );

    Ok(ParsedBatch {
        records,
        offsets,
        next_offset,
        exhausted,
    })
}
