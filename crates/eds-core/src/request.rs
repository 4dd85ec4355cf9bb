//! Framing for edit-server request batches.
//!
//! A batch is the raw value of the request slot. An empty value is the
//! "show an empty document" request; anything else is a run of records:
//!
//! ```text
//! <line> <read> <create> <iconic> <tabbed> <fileLen> <doLen> <lmLen> <geomLen>\n
//! <file bytes>\n<do bytes>\n<lm bytes>\n<geometry bytes>\n
//! ```
//!
//! Field bodies may contain the delimiter; only the declared lengths split
//! them.

use std::{borrow::Cow, fmt};
use thiserror::Error;

pub const FIELD_DELIMITER: u8 = b'\n';
const HEADER_FIELDS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TabPlacement {
    NewWindow,
    InGroup,
    #[default]
    Default,
}

impl TabPlacement {
    pub fn from_flag(flag: i64) -> Self {
        match flag {
            0 => TabPlacement::NewWindow,
            1 => TabPlacement::InGroup,
            _ => TabPlacement::Default,
        }
    }

    pub fn as_flag(self) -> i64 {
        match self {
            TabPlacement::NewWindow => 0,
            TabPlacement::InGroup => 1,
            TabPlacement::Default => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestRecord {
    /// Raw line field; only values above zero request navigation.
    pub line: i32,
    pub read_only: bool,
    pub suppress_create_warning: bool,
    pub iconic: bool,
    pub tab_placement: TabPlacement,
    /// Raw bytes as the client sent them; file names need not be UTF-8.
    pub file_path: Vec<u8>,
    pub macro_command: Vec<u8>,
    pub language_mode: Vec<u8>,
    pub geometry: Vec<u8>,
}

impl RequestRecord {
    pub fn open(path: impl Into<Vec<u8>>) -> Self {
        Self {
            file_path: path.into(),
            ..Self::default()
        }
    }

    pub fn target_line(&self) -> Option<u32> {
        u32::try_from(self.line).ok().filter(|line| *line > 0)
    }

    pub fn has_path(&self) -> bool {
        !self.file_path.is_empty()
    }

    pub fn has_macro(&self) -> bool {
        !self.macro_command.is_empty()
    }

    pub fn macro_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.macro_command)
    }

    pub fn language_mode(&self) -> Option<Cow<'_, str>> {
        non_empty(&self.language_mode)
    }

    pub fn geometry(&self) -> Option<Cow<'_, str>> {
        non_empty(&self.geometry)
    }
}

fn non_empty(value: &[u8]) -> Option<Cow<'_, str>> {
    if value.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestBatch {
    pub records: Vec<RequestRecord>,
}

impl RequestBatch {
    pub fn new(records: Vec<RequestRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestRecord> {
        self.records.iter()
    }
}

impl From<Vec<RequestRecord>> for RequestBatch {
    fn from(records: Vec<RequestRecord>) -> Self {
        Self::new(records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    FilePath,
    MacroCommand,
    LanguageMode,
    Geometry,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldKind::FilePath => "file path",
            FieldKind::MacroCommand => "macro command",
            FieldKind::LanguageMode => "language mode",
            FieldKind::Geometry => "geometry",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record {record} at byte {offset}: header is not terminated")]
    UnterminatedHeader { record: usize, offset: usize },
    #[error("record {record} at byte {offset}: expected 9 header integers, found {found}")]
    HeaderFieldCount {
        record: usize,
        offset: usize,
        found: usize,
    },
    #[error("record {record} at byte {offset}: invalid header integer '{token}'")]
    InvalidHeaderField {
        record: usize,
        offset: usize,
        token: String,
    },
    #[error("record {record}: negative {field} length {length}")]
    NegativeLength {
        record: usize,
        field: FieldKind,
        length: i64,
    },
    #[error(
        "record {record}: {field} length {length} at byte {offset} overruns buffer of {available} bytes"
    )]
    Overrun {
        record: usize,
        field: FieldKind,
        offset: usize,
        length: usize,
        available: usize,
    },
}

pub fn encode_record(record: &RequestRecord, out: &mut Vec<u8>) {
    let header = format!(
        "{} {} {} {} {} {} {} {} {}",
        record.line,
        u8::from(record.read_only),
        u8::from(record.suppress_create_warning),
        u8::from(record.iconic),
        record.tab_placement.as_flag(),
        record.file_path.len(),
        record.macro_command.len(),
        record.language_mode.len(),
        record.geometry.len(),
    );
    out.extend_from_slice(header.as_bytes());
    out.push(FIELD_DELIMITER);
    for field in [
        &record.file_path,
        &record.macro_command,
        &record.language_mode,
        &record.geometry,
    ] {
        out.extend_from_slice(field);
        out.push(FIELD_DELIMITER);
    }
}

pub fn encode_batch(batch: &RequestBatch) -> Vec<u8> {
    let mut out = Vec::new();
    for record in &batch.records {
        encode_record(record, &mut out);
    }
    out
}

/// Decodes a whole batch, failing if any record is malformed.
pub fn decode_batch(bytes: &[u8]) -> Result<RequestBatch, DecodeError> {
    RecordDecoder::new(bytes)
        .collect::<Result<Vec<_>, _>>()
        .map(RequestBatch::new)
}

/// Yields records one at a time so callers can apply the good prefix of a
/// batch. Stops for good after the first error.
pub struct RecordDecoder<'a> {
    buf: &'a [u8],
    cursor: usize,
    record: usize,
    record_start: usize,
    failed: bool,
}

impl<'a> RecordDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            cursor: 0,
            record: 0,
            record_start: 0,
            failed: false,
        }
    }

    /// File paths still readable from the record that failed to decode and
    /// the records after it. Scanning stops where lengths can no longer be
    /// trusted. Only meaningful after the decoder returned an error.
    pub fn salvage_paths(&self) -> Vec<Vec<u8>> {
        let mut scan = RecordDecoder {
            buf: self.buf,
            cursor: self.record_start,
            record: self.record,
            record_start: self.record_start,
            failed: false,
        };
        let mut paths = Vec::new();
        while scan.cursor < scan.buf.len() {
            let Ok(header) = scan.read_header() else {
                break;
            };
            let Ok(path) = scan.take_field(FieldKind::FilePath, header[5]) else {
                break;
            };
            if !path.is_empty() {
                paths.push(path.to_vec());
            }
            let skipped = [
                (FieldKind::MacroCommand, header[6]),
                (FieldKind::LanguageMode, header[7]),
                (FieldKind::Geometry, header[8]),
            ]
            .into_iter()
            .all(|(field, length)| scan.take_field(field, length).is_ok());
            if !skipped {
                break;
            }
            scan.record += 1;
        }
        paths
    }

    fn decode_next(&mut self) -> Result<RequestRecord, DecodeError> {
        self.record_start = self.cursor;
        let header = self.read_header()?;
        let [line, read, create, iconic, tabbed, file_len, do_len, lm_len, geom_len] = header;

        let line = i32::try_from(line).map_err(|_| DecodeError::InvalidHeaderField {
            record: self.record,
            offset: self.cursor,
            token: line.to_string(),
        })?;
        let file_path = self.take_field(FieldKind::FilePath, file_len)?.to_vec();
        let macro_command = self.take_field(FieldKind::MacroCommand, do_len)?.to_vec();
        let language_mode = self.take_field(FieldKind::LanguageMode, lm_len)?.to_vec();
        let geometry = self.take_field(FieldKind::Geometry, geom_len)?.to_vec();

        Ok(RequestRecord {
            line,
            read_only: read != 0,
            suppress_create_warning: create != 0,
            iconic: iconic != 0,
            tab_placement: TabPlacement::from_flag(tabbed),
            file_path,
            macro_command,
            language_mode,
            geometry,
        })
    }

    fn read_header(&mut self) -> Result<[i64; HEADER_FIELDS], DecodeError> {
        let start = self.cursor;
        let rest = &self.buf[start..];
        let Some(end) = rest.iter().position(|byte| *byte == FIELD_DELIMITER) else {
            return Err(DecodeError::UnterminatedHeader {
                record: self.record,
                offset: start,
            });
        };

        let text = String::from_utf8_lossy(&rest[..end]);
        let tokens = text.split_ascii_whitespace().collect::<Vec<_>>();
        if tokens.len() != HEADER_FIELDS {
            return Err(DecodeError::HeaderFieldCount {
                record: self.record,
                offset: start,
                found: tokens.len(),
            });
        }

        let mut header = [0i64; HEADER_FIELDS];
        for (slot, token) in header.iter_mut().zip(tokens) {
            *slot = token
                .parse::<i64>()
                .map_err(|_| DecodeError::InvalidHeaderField {
                    record: self.record,
                    offset: start,
                    token: token.to_string(),
                })?;
        }

        self.cursor = start + end + 1;
        Ok(header)
    }

    fn take_field(&mut self, field: FieldKind, declared: i64) -> Result<&'a [u8], DecodeError> {
        let length = usize::try_from(declared).map_err(|_| DecodeError::NegativeLength {
            record: self.record,
            field,
            length: declared,
        })?;
        let available = self.buf.len() - self.cursor;
        // The field is followed by one delimiter byte that must also be present.
        if length >= available {
            return Err(DecodeError::Overrun {
                record: self.record,
                field,
                offset: self.cursor,
                length,
                available,
            });
        }

        let buf = self.buf;
        let body = &buf[self.cursor..self.cursor + length];
        self.cursor += length + 1;
        Ok(body)
    }
}

impl Iterator for RecordDecoder<'_> {
    type Item = Result<RequestRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.buf.len() {
            return None;
        }
        let result = self.decode_next();
        match result {
            Ok(_) => self.record += 1,
            Err(_) => self.failed = true,
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> RequestBatch {
        RequestBatch::new(vec![
            RequestRecord {
                line: 42,
                read_only: true,
                tab_placement: TabPlacement::NewWindow,
                file_path: b"/tmp/a.txt".to_vec(),
                ..RequestRecord::default()
            },
            RequestRecord {
                line: 0,
                read_only: false,
                suppress_create_warning: true,
                iconic: true,
                tab_placement: TabPlacement::InGroup,
                file_path: "/tmp/dir with spaces/\u{e9}t\u{e9}\n.md".into(),
                macro_command: "find(\"x\")\nreplace_all(\"a\", \"b\")".into(),
                language_mode: b"Markdown".to_vec(),
                geometry: b"80x40+10+10".to_vec(),
            },
            RequestRecord {
                macro_command: b"close()".to_vec(),
                ..RequestRecord::default()
            },
        ])
    }

    #[test]
    fn batch_survives_encoding_with_delimiters_inside_fields() {
        let batch = sample_batch();
        let encoded = encode_batch(&batch);
        let decoded = decode_batch(&encoded).expect("decode");
        assert_eq!(decoded, batch);
    }

    #[test]
    fn non_utf8_bytes_are_kept_verbatim() {
        let raw = b"0 0 0 0 -1 7 0 3 0\n/tmp/\xe9x\n\nC\xff+\n\n".to_vec();
        let decoded = decode_batch(&raw).expect("decode");
        assert_eq!(decoded.records[0].file_path, b"/tmp/\xe9x");
        assert_eq!(decoded.records[0].language_mode, b"C\xff+");
        assert_eq!(encode_batch(&decoded), raw);
    }

    #[test]
    fn encodes_header_like_the_reference_client() {
        let record = RequestRecord {
            line: 7,
            tab_placement: TabPlacement::Default,
            file_path: b"/etc/hosts".to_vec(),
            ..RequestRecord::default()
        };
        let encoded = encode_batch(&RequestBatch::new(vec![record]));
        assert_eq!(encoded, b"7 0 0 0 -1 10 0 0 0\n/etc/hosts\n\n\n\n".to_vec());
    }

    #[test]
    fn empty_buffer_is_an_empty_batch() {
        assert!(decode_batch(b"").expect("decode").is_empty());
    }

    #[test]
    fn every_truncation_point_is_a_parse_error() {
        let encoded = encode_batch(&sample_batch());
        let record_ends = {
            let mut ends = Vec::new();
            let mut out = Vec::new();
            for record in &sample_batch().records {
                encode_record(record, &mut out);
                ends.push(out.len());
            }
            ends
        };

        for cut in 1..encoded.len() {
            let result = decode_batch(&encoded[..cut]);
            if record_ends.contains(&cut) {
                assert!(result.is_ok(), "cut at record boundary {cut} should decode");
            } else {
                assert!(result.is_err(), "cut at {cut} should fail");
            }
        }
    }

    #[test]
    fn eight_integer_header_is_rejected() {
        let err = decode_batch(b"42 0 0 0 10 0 0 0\n/tmp/a.txt\n\n\n\n").expect_err("must fail");
        assert_eq!(
            err,
            DecodeError::HeaderFieldCount {
                record: 0,
                offset: 0,
                found: 8
            }
        );
    }

    #[test]
    fn non_numeric_header_is_rejected() {
        let err = decode_batch(b"1 0 0 0 -1 x 0 0 0\n\n\n\n\n").expect_err("must fail");
        assert!(matches!(err, DecodeError::InvalidHeaderField { token, .. } if token == "x"));
    }

    #[test]
    fn negative_length_is_rejected() {
        let err = decode_batch(b"0 0 0 0 -1 -3 0 0 0\n\n\n\n\n").expect_err("must fail");
        assert_eq!(
            err,
            DecodeError::NegativeLength {
                record: 0,
                field: FieldKind::FilePath,
                length: -3
            }
        );
    }

    #[test]
    fn oversized_length_reports_overrun_without_reading_past_end() {
        let err = decode_batch(b"0 0 0 0 -1 4096 0 0 0\n/tmp/a\n\n\n\n").expect_err("must fail");
        match err {
            DecodeError::Overrun {
                field,
                length,
                available,
                ..
            } => {
                assert_eq!(field, FieldKind::FilePath);
                assert_eq!(length, 4096);
                assert_eq!(available, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn decoder_yields_good_prefix_then_stops() {
        let mut bytes = encode_batch(&RequestBatch::new(vec![RequestRecord::open("/tmp/a.txt")]));
        bytes.extend_from_slice(b"1 2 3\n");
        bytes.extend_from_slice(&encode_batch(&RequestBatch::new(vec![
            RequestRecord::open("/tmp/b.txt"),
        ])));

        let mut decoder = RecordDecoder::new(&bytes);
        let first = decoder.next().expect("first").expect("valid");
        assert_eq!(first.file_path, b"/tmp/a.txt");
        let second = decoder.next().expect("second");
        assert!(matches!(
            second,
            Err(DecodeError::HeaderFieldCount { record: 1, found: 3, .. })
        ));
        assert!(decoder.next().is_none());
    }

    #[test]
    fn salvage_reads_paths_past_the_bad_record() {
        let mut bytes = encode_batch(&RequestBatch::new(vec![RequestRecord::open("/tmp/a")]));
        // Header parses but the line does not fit; lengths are still usable.
        bytes.extend_from_slice(b"99999999999 0 0 0 -1 6 0 0 0\n/tmp/b\n\n\n\n");
        bytes.extend_from_slice(&encode_batch(&RequestBatch::new(vec![
            RequestRecord::open("/tmp/c"),
            RequestRecord::default(),
        ])));
        bytes.extend_from_slice(b"0 0 0 0 -1 6 0 0 99\n/tmp/d\n\n\n");

        let mut decoder = RecordDecoder::new(&bytes);
        assert!(decoder.next().expect("first").is_ok());
        assert!(decoder.next().expect("second").is_err());
        assert_eq!(
            decoder.salvage_paths(),
            vec![b"/tmp/b".to_vec(), b"/tmp/c".to_vec(), b"/tmp/d".to_vec()]
        );
    }

    #[test]
    fn salvage_stops_at_an_unreadable_header() {
        let bytes = b"0 0 0 0 -1 6 0 0 99\n/tmp/b\n\n\n".to_vec();
        let mut decoder = RecordDecoder::new(&bytes);
        assert!(matches!(
            decoder.next(),
            Some(Err(DecodeError::Overrun {
                field: FieldKind::Geometry,
                ..
            }))
        ));
        assert_eq!(decoder.salvage_paths(), vec![b"/tmp/b".to_vec()]);

        let mut decoder = RecordDecoder::new(b"1 2 3\n/tmp/x\n");
        assert!(decoder.next().expect("record").is_err());
        assert!(decoder.salvage_paths().is_empty());
    }

    #[test]
    fn zero_and_negative_lines_do_not_navigate() {
        let mut record = RequestRecord::open("/tmp/a.txt");
        assert_eq!(record.target_line(), None);
        record.line = -5;
        assert_eq!(record.target_line(), None);
        record.line = 1;
        assert_eq!(record.target_line(), Some(1));
    }

    #[test]
    fn unknown_tab_flags_fall_back_to_default() {
        assert_eq!(TabPlacement::from_flag(0), TabPlacement::NewWindow);
        assert_eq!(TabPlacement::from_flag(1), TabPlacement::InGroup);
        assert_eq!(TabPlacement::from_flag(-1), TabPlacement::Default);
        assert_eq!(TabPlacement::from_flag(7), TabPlacement::Default);
    }
}
