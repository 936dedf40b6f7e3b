//! Wire codec for packed per-record numeric histories.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! u16 version (= 1)
//! u16 num_fields
//! per field:
//!   u8  name_len, then name_len bytes of utf8
//!   f64 initial_value
//!   u32 sample_count
//!   sample_count x (f64 time, f64 value)
//! ```
//!
//! Readers reject unknown versions. Field names a reader does not know are
//! discarded; a field with no entry in a blob keeps its last known value.

use std::collections::BTreeMap;
use std::fmt;

pub const HISTORY_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistorySample {
    pub time: f64,
    pub value: f64,
}

/// Samples for one field over one flush interval. `initial_value` is the
/// field's value at the interval start; samples record each in-interval
/// change, ordered by time.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldHistory {
    pub initial_value: f64,
    pub samples: Vec<HistorySample>,
}

impl FieldHistory {
    pub fn new(initial_value: f64) -> Self {
        Self {
            initial_value,
            samples: Vec::new(),
        }
    }

    /// Value of the field at time `t`, stepping through recorded samples.
    pub fn value_at(&self, t: f64) -> f64 {
        let mut value = self.initial_value;
        for sample in &self.samples {
            if sample.time > t {
                break;
            }
            value = sample.value;
        }
        value
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    UnsupportedVersion(u16),
    Truncated,
    FieldNameNotUtf8,
    TooManyFields(usize),
    FieldNameTooLong(usize),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => write!(f, "unsupported history version: {v}"),
            Self::Truncated => write!(f, "history buffer ends mid-record"),
            Self::FieldNameNotUtf8 => write!(f, "field name is not valid utf8"),
            Self::TooManyFields(n) => write!(f, "too many fields to pack: {n}"),
            Self::FieldNameTooLong(n) => write!(f, "field name longer than 255 bytes: {n}"),
        }
    }
}

impl std::error::Error for HistoryError {}

pub fn pack(fields: &BTreeMap<String, FieldHistory>) -> Result<Vec<u8>, HistoryError> {
    if fields.len() > usize::from(u16::MAX) {
        return Err(HistoryError::TooManyFields(fields.len()));
    }

    let mut out = Vec::with_capacity(4 + fields.len() * 32);
    out.extend_from_slice(&HISTORY_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(fields.len() as u16).to_le_bytes());

    for (name, history) in fields {
        let name_bytes = name.as_bytes();
        if name_bytes.len() > usize::from(u8::MAX) {
            return Err(HistoryError::FieldNameTooLong(name_bytes.len()));
        }
        out.push(name_bytes.len() as u8);
        out.extend_from_slice(name_bytes);
        out.extend_from_slice(&history.initial_value.to_le_bytes());
        out.extend_from_slice(&(history.samples.len() as u32).to_le_bytes());
        for sample in &history.samples {
            out.extend_from_slice(&sample.time.to_le_bytes());
            out.extend_from_slice(&sample.value.to_le_bytes());
        }
    }

    Ok(out)
}

pub fn unpack(buf: &[u8]) -> Result<BTreeMap<String, FieldHistory>, HistoryError> {
    let mut cursor = Cursor { buf, pos: 0 };

    let version = cursor.read_u16()?;
    if version != HISTORY_FORMAT_VERSION {
        return Err(HistoryError::UnsupportedVersion(version));
    }

    let num_fields = cursor.read_u16()?;
    let mut fields = BTreeMap::new();
    for _ in 0..num_fields {
        let name_len = usize::from(cursor.read_u8()?);
        let name_bytes = cursor.read_bytes(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| HistoryError::FieldNameNotUtf8)?
            .to_string();
        let initial_value = cursor.read_f64()?;
        let sample_count = cursor.read_u32()?;
        let mut samples = Vec::with_capacity(sample_count as usize);
        for _ in 0..sample_count {
            let time = cursor.read_f64()?;
            let value = cursor.read_f64()?;
            samples.push(HistorySample { time, value });
        }
        fields.insert(
            name,
            FieldHistory {
                initial_value,
                samples,
            },
        );
    }

    Ok(fields)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], HistoryError> {
        let end = self.pos.checked_add(len).ok_or(HistoryError::Truncated)?;
        if end > self.buf.len() {
            return Err(HistoryError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, HistoryError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, HistoryError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, HistoryError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f64(&mut self) -> Result<f64, HistoryError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }
}
