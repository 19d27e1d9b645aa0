//! Command catalogue (component C3).
//!
//! Typed constructors and response parsers for every bootloader opcode.
//! Field layouts and opcode values are taken directly from the reference
//! bootloader host tool's command table; the little-endian field order is
//! load-bearing, not a style choice.

use crate::error::{DfuError, DfuResult};

/// Start-of-packet framing byte.
pub const SOP: u8 = 0x01;
/// End-of-packet framing byte.
pub const EOP: u8 = 0x17;

/// Which 16-bit checksum a session uses over packet bytes, chosen once at
/// session start from the firmware-image header and held for its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Sum16,
    Crc16,
}

impl ChecksumKind {
    /// Decode the single-byte `checksumType` field from a `.cyacd2` header
    /// or an `.mtbdfu` `Packet Checksum Type` value (`0` = SUM, `1` = CRC).
    pub fn from_byte(byte: u8) -> DfuResult<Self> {
        match byte {
            0 => Ok(ChecksumKind::Sum16),
            1 => Ok(ChecksumKind::Crc16),
            other => Err(DfuError::BadData {
                detail: format!("unknown checksum type 0x{other:02X}"),
            }),
        }
    }
}

/// Opcode values for every command the catalogue knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    VerifyChecksum,
    EraseRow,
    Sync,
    SendData,
    SendDataNoResponse,
    EnterBootloader,
    ExitBootloader,
    EraseData,
    ProgramData,
    VerifyData,
    SetApplicationMetadata,
    SetEncryptionIv,
    Custom(u8),
}

impl Opcode {
    pub fn code(self) -> u8 {
        match self {
            Opcode::VerifyChecksum => 0x31,
            Opcode::EraseRow => 0x34,
            Opcode::Sync => 0x35,
            Opcode::SendData => 0x37,
            Opcode::EnterBootloader => 0x38,
            Opcode::ExitBootloader => 0x3B,
            Opcode::EraseData => 0x44,
            Opcode::SendDataNoResponse => 0x47,
            Opcode::ProgramData => 0x49,
            Opcode::VerifyData => 0x4A,
            Opcode::SetApplicationMetadata => 0x4C,
            Opcode::SetEncryptionIv => 0x4D,
            Opcode::Custom(code) => code,
        }
    }
}

fn le16(v: u16) -> [u8; 2] {
    v.to_le_bytes()
}

fn le32(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

fn read_u32_le(buf: &[u8], offset: usize, what: &str) -> DfuResult<u32> {
    buf.get(offset..offset + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or_else(|| DfuError::BadLength {
            detail: format!("{what}: expected 4 bytes at offset {offset}"),
        })
}

/// `0x38 EnterBootloader` — request: `productId(4B LE) || 0x0000(2B)`.
pub fn enter_bootloader_request(product_id: u32) -> (Opcode, Vec<u8>) {
    let mut data = Vec::with_capacity(6);
    data.extend_from_slice(&le32(product_id));
    data.extend_from_slice(&le16(0));
    (Opcode::EnterBootloader, data)
}

/// Parsed response to EnterBootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnterBootloaderResponse {
    pub silicon_id: u32,
    pub silicon_rev: u8,
    pub bootloader_version: [u8; 3],
}

pub fn parse_enter_bootloader_response(data: &[u8]) -> DfuResult<EnterBootloaderResponse> {
    if data.len() < 8 {
        return Err(DfuError::BadLength {
            detail: format!("EnterBootloader response: expected >= 8 bytes, got {}", data.len()),
        });
    }
    Ok(EnterBootloaderResponse {
        silicon_id: read_u32_le(data, 0, "silicon_id")?,
        silicon_rev: data[4],
        bootloader_version: [data[5], data[6], data[7]],
    })
}

/// `0x3B ExitBootloader` — no request or response data.
pub fn exit_bootloader_request() -> (Opcode, Vec<u8>) {
    (Opcode::ExitBootloader, Vec::new())
}

/// `0x4C SetApplicationMetadata` — `appId(1B) || appStart(4B LE) || appSize(4B LE)`.
pub fn set_application_metadata_request(app_id: u8, app_start: u32, app_size: u32) -> (Opcode, Vec<u8>) {
    let mut data = Vec::with_capacity(9);
    data.push(app_id);
    data.extend_from_slice(&le32(app_start));
    data.extend_from_slice(&le32(app_size));
    (Opcode::SetApplicationMetadata, data)
}

/// `0x4D SetEncryptionIV` — request is the IV bytes verbatim (0, 8, or 16 bytes).
pub fn set_encryption_iv_request(iv: &[u8]) -> DfuResult<(Opcode, Vec<u8>)> {
    if !matches!(iv.len(), 0 | 8 | 16) {
        return Err(DfuError::BadLength {
            detail: format!("encryption IV must be 0, 8, or 16 bytes, got {}", iv.len()),
        });
    }
    Ok((Opcode::SetEncryptionIv, iv.to_vec()))
}

/// `0x37 SendData` — stage up to MTU-7 bytes in the device buffer.
pub fn send_data_request(chunk: &[u8]) -> (Opcode, Vec<u8>) {
    (Opcode::SendData, chunk.to_vec())
}

/// `0x47 SendDataNoResponse` — same payload, device does not reply.
pub fn send_data_no_response_request(chunk: &[u8]) -> (Opcode, Vec<u8>) {
    (Opcode::SendDataNoResponse, chunk.to_vec())
}

/// `0x49 ProgramData` / `0x4A VerifyData` — `address(4B LE) || crc32c(4B LE) || tail data`.
fn program_or_verify_request(opcode: Opcode, address: u32, row_crc: u32, tail: &[u8]) -> (Opcode, Vec<u8>) {
    let mut data = Vec::with_capacity(8 + tail.len());
    data.extend_from_slice(&le32(address));
    data.extend_from_slice(&le32(row_crc));
    data.extend_from_slice(tail);
    (opcode, data)
}

pub fn program_data_request(address: u32, row_crc: u32, tail: &[u8]) -> (Opcode, Vec<u8>) {
    program_or_verify_request(Opcode::ProgramData, address, row_crc, tail)
}

pub fn verify_data_request(address: u32, row_crc: u32, tail: &[u8]) -> (Opcode, Vec<u8>) {
    program_or_verify_request(Opcode::VerifyData, address, row_crc, tail)
}

/// `0x44 EraseData` — `address(4B LE)`.
pub fn erase_data_request(address: u32) -> (Opcode, Vec<u8>) {
    (Opcode::EraseData, le32(address).to_vec())
}

/// `0x31 VerifyChecksum` — `appId(1B)`.
pub fn verify_checksum_request(app_id: u8) -> (Opcode, Vec<u8>) {
    (Opcode::VerifyChecksum, vec![app_id])
}

pub fn parse_verify_checksum_response(data: &[u8]) -> DfuResult<bool> {
    data.first().copied().map(|b| b != 0).ok_or_else(|| DfuError::BadLength {
        detail: "VerifyChecksum response: expected 1 byte".into(),
    })
}

/// A generic/custom command with a caller-chosen opcode and payload, used
/// for the catalogue's passthrough opcode and for `.mtbdfu` commands whose
/// `cmdId` is not one of the named opcodes above.
pub fn custom_request(code: u8, data: Vec<u8>) -> (Opcode, Vec<u8>) {
    (Opcode::Custom(code), data)
}
