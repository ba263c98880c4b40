//! Source-side value model.
//!
//! Every source adapter normalises its driver's column descriptors into
//! [`ColumnInfo`] (one of nine type families) and its row payloads into
//! [`CellValue`]. The type mapper then turns cell values into MySQL bind
//! values; large values travel as [`LobHandle`]s that are drained in bounded
//! [`LobChunk`]s.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

/// The nine type families shared by all source adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    SignedInteger,
    UnsignedInteger,
    /// Exact decimals, carried as canonical digit strings.
    Decimal,
    /// Approximate floats, carried as IEEE 754 doubles.
    Float,
    Date,
    Time,
    Timestamp,
    /// Raw byte strings (BLOB, VARBINARY, ...).
    Bytes,
    /// Character strings, carried as UTF-8 unless force-utf8 passthrough is on.
    Text,
}

/// Per-column descriptor, derived by the source adapter at cursor open.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Zero-based position in the result set.
    pub ordinal: usize,
    pub name: String,
    pub family: TypeFamily,
    /// Declared source type name, for diagnostics only.
    pub type_name: String,
    /// Declared width (characters or bytes), when the driver reports one.
    pub length: u32,
    /// Digits after the decimal point for exact/temporal types.
    pub scale: u8,
    pub nullable: bool,
    /// Reported character set, `None` for non-character columns.
    pub charset: Option<String>,
}

/// One value slot of a source row.
#[derive(Debug, Clone)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    /// Canonical decimal digits; never round-tripped through floats.
    Decimal(String),
    Date(NaiveDate),
    /// MySQL TIME is a signed duration, so broken-down components are kept
    /// rather than a clock time.
    Time {
        negative: bool,
        hours: u32,
        minutes: u8,
        seconds: u8,
        micro_seconds: u32,
    },
    DateTime(NaiveDateTime),
    Bytes(Vec<u8>),
    Text(String),
    /// A large value to be drained through `read_lob_chunk`.
    Lob(LobHandle),
}

/// Ordered values aligned with the cursor's [`ColumnInfo`] slots.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub values: Vec<CellValue>,
}

/// Handle to one large value held by a cursor.
///
/// The payload has already been capped at `max_parameter_size` by the adapter;
/// `truncated` records whether the cap was applied.
#[derive(Debug, Clone)]
pub struct LobHandle {
    data: Arc<Vec<u8>>,
    pub truncated: bool,
}

impl LobHandle {
    pub fn new(data: Vec<u8>, truncated: bool) -> Self {
        Self {
            data: Arc::new(data),
            truncated,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Slice out one bounded chunk. The end of the value is signalled by a
    /// short (possibly empty) final chunk.
    pub fn chunk(&self, offset: u64, max_size: usize) -> LobChunk {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(max_size).min(self.data.len());
        LobChunk {
            data: self.data[start..end].to_vec(),
        }
    }
}

/// A contiguous slice of a single large value.
#[derive(Debug, Clone)]
pub struct LobChunk {
    pub data: Vec<u8>,
}
