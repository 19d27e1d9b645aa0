//! `.cyacd2` firmware-image parser (component C6).
//!
//! A line-oriented pull parser that owns a single file handle: one call to
//! [`Cyacd2File::open`], exactly one call to [`Cyacd2File::read_header`], an
//! optional [`Cyacd2File::scan_application_span`], then repeated
//! [`Cyacd2File::next_row`] calls until [`Row::Eof`].
//!
//! Hex decoding follows the reference tool's tolerant `from_hex`: a
//! non-hex-digit character decodes to `0` rather than failing the parse, to
//! stay bug-compatible with images already in the field. Odd-length hex
//! fields are a hard error, matching `CyBtldr_FromAscii`'s length check.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use crate::command::ChecksumKind;
use crate::error::{DfuError, DfuResult};

use super::{AppSpan, ImageHeader};

/// One decoded line from a `.cyacd2` file, as returned by [`Cyacd2File::next_row`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    /// A `#`-prefixed comment line; already skipped transparently, kept for
    /// callers that want to observe it anyway.
    Comment,
    /// `@EIV:` followed by hex-encoded IV bytes.
    Eiv(Vec<u8>),
    /// `@APPINFO:0x<start>,0x<size>` override.
    AppInfo { start: u32, size: u32 },
    /// `:` + hex(address(4B LE) + data). `sum_byte` is the running 8-bit
    /// sum of the data bytes; currently informational (spec §3).
    Data { address: u32, data: Vec<u8>, sum_byte: u8 },
    /// No more lines.
    Eof,
}

fn from_hex_digit(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => 10 + c - b'a',
        b'A'..=b'F' => 10 + c - b'A',
        _ => {
            log::warn!(target: "dfuhost::image::cyacd2", "non-hex character 0x{c:02X} decoded as 0");
            0
        }
    }
}

/// Decode a hex string into bytes, tolerant of non-hex characters (they
/// decode to zero) but strict about odd length.
fn from_hex(s: &str) -> DfuResult<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(DfuError::BadLength {
            detail: format!("odd-length hex field: {} chars", bytes.len()),
        });
    }
    Ok(bytes
        .chunks(2)
        .map(|pair| (from_hex_digit(pair[0]) << 4) | from_hex_digit(pair[1]))
        .collect())
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

pub struct Cyacd2File {
    reader: BufReader<File>,
    path: String,
}

impl Cyacd2File {
    /// Open the file for streaming. Fails with [`DfuError::FileNotFound`]
    /// if it cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> DfuResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|_| DfuError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.display().to_string(),
        })
    }

    fn read_raw_line(&mut self) -> DfuResult<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(|e| DfuError::FileReadError {
            path: self.path.clone(),
            source: e,
        })?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Read the next non-comment line, skipping `#`-prefixed comments.
    fn read_line_skip_comments(&mut self) -> DfuResult<Option<String>> {
        loop {
            match self.read_raw_line()? {
                None => return Ok(None),
                Some(line) if line.starts_with('#') => continue,
                Some(line) => return Ok(Some(line)),
            }
        }
    }

    /// Parse the first line of the file as the image header. Must be
    /// called exactly once, immediately after [`Self::open`].
    pub fn read_header(&mut self) -> DfuResult<ImageHeader> {
        let line = self
            .read_line_skip_comments()?
            .ok_or(DfuError::Eof)?;
        let bytes = from_hex(&line)?;
        if bytes.len() != 12 {
            return Err(DfuError::BadLength {
                detail: format!("header decodes to {} bytes, expected 12", bytes.len()),
            });
        }
        let version = bytes[0];
        if version != 0x01 {
            return Err(DfuError::BadData {
                detail: format!("unsupported .cyacd2 version 0x{version:02X}"),
            });
        }
        Ok(ImageHeader {
            version,
            silicon_id: le32(&bytes[1..5]),
            silicon_rev: bytes[5],
            checksum_kind: ChecksumKind::from_byte(bytes[6])?,
            app_id: bytes[7],
            product_id: le32(&bytes[8..12]),
        })
    }

    /// Non-destructive forward scan for the application span: remembers
    /// the current file offset, reads to EOF tallying the minimum data-row
    /// address and total data-byte count, then restores the offset. An
    /// `@APPINFO` line overrides the scan and stops further updates to the
    /// span from data rows, matching `CyBtldr_ParseAppStartAndSize`.
    pub fn scan_application_span(&mut self) -> DfuResult<(AppSpan, u32)> {
        let resume_at = self
            .reader
            .stream_position()
            .map_err(|e| DfuError::FileReadError { path: self.path.clone(), source: e })?;

        let mut app_start = u32::MAX;
        let mut app_size = 0u32;
        let mut data_line_count = 0u32;
        let mut app_info_found = false;

        while let Some(line) = self.read_raw_line()? {
            if line.starts_with(':') {
                if !app_info_found {
                    let decoded = from_hex(&line[1..])?;
                    if decoded.len() < 4 {
                        return Err(DfuError::BadData {
                            detail: "data row too short to contain an address".into(),
                        });
                    }
                    let address = le32(&decoded[0..4]);
                    let row_size = (decoded.len() - 4) as u32;
                    if address < app_start {
                        app_start = address;
                    }
                    app_size += row_size;
                }
                data_line_count += 1;
            } else if let Some(rest) = line.strip_prefix("@APPINFO:0x") {
                let (start_hex, size_hex) = rest.split_once(",0x").ok_or_else(|| DfuError::BadData {
                    detail: "malformed @APPINFO line".into(),
                })?;
                app_start = u32::from_str_radix(start_hex, 16).map_err(|_| DfuError::BadData {
                    detail: "malformed @APPINFO start address".into(),
                })?;
                app_size = u32::from_str_radix(size_hex, 16).map_err(|_| DfuError::BadData {
                    detail: "malformed @APPINFO size".into(),
                })?;
                app_info_found = true;
            }
        }

        self.reader
            .seek(SeekFrom::Start(resume_at))
            .map_err(|e| DfuError::FileReadError { path: self.path.clone(), source: e })?;

        Ok((AppSpan { app_start, app_size }, data_line_count))
    }

    /// Pull the next logical row, or [`Row::Eof`] once the file is
    /// exhausted. Comment lines are skipped transparently before this
    /// point is ever reached.
    pub fn next_row(&mut self) -> DfuResult<Row> {
        let line = match self.read_line_skip_comments()? {
            None => return Ok(Row::Eof),
            Some(line) => line,
        };

        if let Some(hex) = line.strip_prefix("@EIV:") {
            return Ok(Row::Eiv(from_hex(hex)?));
        }
        if let Some(rest) = line.strip_prefix("@APPINFO:0x") {
            let (start_hex, size_hex) = rest.split_once(",0x").ok_or_else(|| DfuError::BadData {
                detail: "malformed @APPINFO line".into(),
            })?;
            let start = u32::from_str_radix(start_hex, 16).map_err(|_| DfuError::BadData {
                detail: "malformed @APPINFO start address".into(),
            })?;
            let size = u32::from_str_radix(size_hex, 16).map_err(|_| DfuError::BadData {
                detail: "malformed @APPINFO size".into(),
            })?;
            return Ok(Row::AppInfo { start, size });
        }
        if let Some(hex) = line.strip_prefix(':') {
            let decoded = from_hex(hex)?;
            if decoded.len() <= 4 {
                return Err(DfuError::BadData {
                    detail: "data row too short to contain an address and payload".into(),
                });
            }
            let address = le32(&decoded[0..4]);
            let data = decoded[4..].to_vec();
            let sum_byte = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            return Ok(Row::Data { address, data, sum_byte });
        }

        Err(DfuError::BadCommand {
            detail: format!("unrecognised line prefix: {:?}", line.chars().next()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.cyacd2");
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn s5_header_parses_expected_fields() {
        let (_dir, path) = fixture("010403020141001000000000\n:00001000020304\n");
        let mut file = Cyacd2File::open(&path).unwrap();
        let header = file.read_header().unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.silicon_id, 0x0102_0304);
        assert_eq!(header.silicon_rev, 0x41);
        assert_eq!(header.checksum_kind, ChecksumKind::Sum16);
        assert_eq!(header.app_id, 0x10);
        assert_eq!(header.product_id, 0x0000_0000);
    }

    #[test]
    fn rejects_unsupported_version() {
        let (_dir, path) = fixture("020403020141001000000000\n");
        let mut file = Cyacd2File::open(&path).unwrap();
        assert!(matches!(file.read_header(), Err(DfuError::BadData { .. })));
    }

    #[test]
    fn data_rows_round_trip_in_file_order() {
        let contents = "010403020141001000000000\n:00001000AABBCC\n:00001003DDEEFF\n";
        let (_dir, path) = fixture(contents);
        let mut file = Cyacd2File::open(&path).unwrap();
        file.read_header().unwrap();

        let mut rows = Vec::new();
        loop {
            match file.next_row().unwrap() {
                Row::Eof => break,
                Row::Data { address, data, .. } => rows.push((address, data)),
                other => panic!("unexpected row: {other:?}"),
            }
        }
        assert_eq!(rows, vec![(0x0000_1000, vec![0xAA, 0xBB, 0xCC]), (0x0000_1003, vec![0xDD, 0xEE, 0xFF])]);
    }

    #[test]
    fn scan_application_span_restores_offset_and_honours_appinfo() {
        let contents = "010403020141001000000000\n@APPINFO:0x1000,0x300\n:00001000AABBCC\n:00002000DDEEFF\n";
        let (_dir, path) = fixture(contents);
        let mut file = Cyacd2File::open(&path).unwrap();
        file.read_header().unwrap();
        let before = file.reader.stream_position().unwrap();

        let (span, data_lines) = file.scan_application_span().unwrap();
        assert_eq!(span.app_start, 0x1000);
        assert_eq!(span.app_size, 0x300);
        assert_eq!(data_lines, 2);

        let after = file.reader.stream_position().unwrap();
        assert_eq!(before, after);

        // streaming still starts from the first data row
        match file.next_row().unwrap() {
            Row::AppInfo { start, size } => {
                assert_eq!(start, 0x1000);
                assert_eq!(size, 0x300);
            }
            other => panic!("unexpected row: {other:?}"),
        }
    }

    #[test]
    fn scan_application_span_falls_back_to_data_row_scan() {
        let contents = "010403020141001000000000\n:00001000AABBCC\n:00000800DD\n";
        let (_dir, path) = fixture(contents);
        let mut file = Cyacd2File::open(&path).unwrap();
        file.read_header().unwrap();
        let (span, data_lines) = file.scan_application_span().unwrap();
        assert_eq!(span.app_start, 0x0800);
        assert_eq!(span.app_size, 4);
        assert_eq!(data_lines, 2);
    }

    #[test]
    fn odd_length_hex_field_is_rejected() {
        let (_dir, path) = fixture("010403020141001000000\n");
        let mut file = Cyacd2File::open(&path).unwrap();
        assert!(matches!(file.read_header(), Err(DfuError::BadLength { .. })));
    }

    #[test]
    fn non_hex_characters_decode_to_zero() {
        let (_dir, path) = fixture("010403020141001000000000\n:0000zz00AABBCC\n");
        let mut file = Cyacd2File::open(&path).unwrap();
        file.read_header().unwrap();
        match file.next_row().unwrap() {
            Row::Data { address, .. } => assert_eq!(address & 0xFF00, 0x0000),
            other => panic!("unexpected row: {other:?}"),
        }
    }
}
