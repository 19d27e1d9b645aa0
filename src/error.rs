//! Unified error taxonomy for the DFU host driver (component C9).
//!
//! Every fallible operation in this crate returns [`DfuResult`]. Transport
//! errors are reported already OR-ed with [`COMM_MASK`]; device-reported
//! bootloader status bytes are OR-ed with [`BOOTLOADER_MASK`] before being
//! wrapped in [`DfuError::BootloaderError`]. This lets a caller recognise
//! which layer produced a code without losing the specific value, the same
//! layering the original bootloader host tooling used.

use thiserror::Error;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Set on any error originating in the byte-channel / transport layer.
pub const COMM_MASK: u32 = 0x2000;

/// Set on any status byte reported by the device bootloader itself.
pub const BOOTLOADER_MASK: u32 = 0x4000;

/// Errors that can occur while parsing images, framing packets, talking to
/// a channel, or driving a session.
#[derive(Debug, Error)]
pub enum DfuError {
    // --- Input ---
    /// The named image or session-script file could not be opened.
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// The file was opened but a later read failed.
    #[error("error reading {path}: {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A fixed-width or hex field decoded to the wrong length.
    #[error("bad length: {detail}")]
    BadLength { detail: String },

    /// Malformed row, header, or other structurally-invalid data.
    #[error("bad data: {detail}")]
    BadData { detail: String },

    /// A command could not be constructed or parsed as requested.
    #[error("bad command: {detail}")]
    BadCommand { detail: String },

    /// Parser reached end of file where more input was expected.
    #[error("unexpected end of file")]
    Eof,

    /// `.mtbdfu` header or command-set validation failure.
    #[error("config error: {detail}")]
    ConfigError { detail: String },

    // --- Device identity ---
    /// EnterBootloader reply silicon ID/revision does not match the image.
    #[error("device mismatch: expected silicon id 0x{expected_id:08X}, got 0x{actual_id:08X}")]
    DeviceMismatch { expected_id: u32, actual_id: u32 },

    /// Bootloader reported an unsupported protocol/image version.
    #[error("version mismatch: {detail}")]
    VersionMismatch { detail: String },

    // --- Protocol ---
    /// Packet envelope failed structural validation (SOP/EOP/length).
    #[error("bad frame: {detail}")]
    BadFrame { detail: String },

    /// Packet checksum did not match the computed value.
    #[error("bad checksum: expected 0x{expected:04X}, got 0x{actual:04X}")]
    BadChecksum { expected: u16, actual: u16 },

    /// Device returned a non-success status byte, masked with
    /// [`BOOTLOADER_MASK`].
    #[error("bootloader error: status 0x{masked_status:04X}")]
    BootloaderError { masked_status: u32 },

    /// Final VerifyChecksum command reported a mismatch.
    #[error("checksum mismatch over application image")]
    ChecksumMismatch,

    /// Device reported the row/array index as invalid.
    #[error("array invalid")]
    ArrayInvalid,

    /// Device reported the row as invalid (out of range, unaligned, etc).
    #[error("row invalid")]
    RowInvalid,

    /// Device reported the flash region as write-protected.
    #[error("flash protected")]
    FlashProtected,

    /// Device reported the application as inactive.
    #[error("application inactive")]
    AppInactive,

    /// Device reported the application image as invalid.
    #[error("application invalid")]
    AppInvalid,

    /// Device reported an encryption key mismatch.
    #[error("key mismatch")]
    KeyMismatch,

    // --- Transport ---
    /// Operation exceeded its deadline.
    #[error("timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Channel read failed below the transport layer.
    #[error("read failed: {detail}")]
    ReadFailed { detail: String },

    /// Channel write failed below the transport layer, or a device NACKed.
    #[error("write failed: {detail}")]
    WriteFailed { detail: String },

    /// The channel's underlying device/port is in use by another process.
    #[error("device in use: {detail}")]
    DeviceInUse { detail: String },

    /// Caller lacks permission to open the channel.
    #[error("access denied: {detail}")]
    AccessDenied { detail: String },

    /// No device answered on the configured channel.
    #[error("device not found")]
    DeviceNotFound,

    /// Underlying transport crate returned an error with no closer match.
    #[error("internal transport error: {0}")]
    InternalError(String),

    /// Caught-all for transport failures the taxonomy doesn't name.
    #[error("unknown transport error: {0}")]
    UnknownError(String),

    // --- Control ---
    /// `abort()` was observed and the session terminated early.
    #[error("operation aborted")]
    Aborted,

    // --- Passthrough from dependencies ---
    /// Serial port error from the serialport crate.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error with no more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error for a `.mtbdfu` document.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DfuError {
    /// Wrap a device-reported bootloader status byte with [`BOOTLOADER_MASK`].
    pub fn bootloader_status(status: u8) -> Self {
        DfuError::BootloaderError {
            masked_status: BOOTLOADER_MASK | status as u32,
        }
    }

    /// True for errors that originated in the transport layer and should be
    /// reported with [`COMM_MASK`] applied to their numeric code.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DfuError::Timeout { .. }
                | DfuError::ReadFailed { .. }
                | DfuError::WriteFailed { .. }
                | DfuError::DeviceInUse { .. }
                | DfuError::AccessDenied { .. }
                | DfuError::DeviceNotFound
                | DfuError::InternalError(_)
                | DfuError::UnknownError(_)
                | DfuError::Serial(_)
                | DfuError::Io(_)
        )
    }

    /// Numeric exit code for the CLI: the taxonomy index, OR-ed with
    /// [`COMM_MASK`] or [`BOOTLOADER_MASK`] per §7's masking convention.
    pub fn exit_code(&self) -> u32 {
        match self {
            DfuError::BootloaderError { masked_status } => *masked_status,
            _ if self.is_transport() => COMM_MASK | self.taxonomy_index(),
            _ => self.taxonomy_index(),
        }
    }

    fn taxonomy_index(&self) -> u32 {
        match self {
            DfuError::FileNotFound { .. } => 1,
            DfuError::FileReadError { .. } => 2,
            DfuError::BadLength { .. } => 3,
            DfuError::BadData { .. } => 4,
            DfuError::BadCommand { .. } => 5,
            DfuError::Eof => 6,
            DfuError::ConfigError { .. } => 7,
            DfuError::DeviceMismatch { .. } => 8,
            DfuError::VersionMismatch { .. } => 9,
            DfuError::BadFrame { .. } => 10,
            DfuError::BadChecksum { .. } => 11,
            DfuError::BootloaderError { .. } => 12,
            DfuError::ChecksumMismatch => 13,
            DfuError::ArrayInvalid => 14,
            DfuError::RowInvalid => 15,
            DfuError::FlashProtected => 16,
            DfuError::AppInactive => 17,
            DfuError::AppInvalid => 18,
            DfuError::KeyMismatch => 19,
            DfuError::Timeout { .. } => 20,
            DfuError::ReadFailed { .. } => 21,
            DfuError::WriteFailed { .. } => 22,
            DfuError::DeviceInUse { .. } => 23,
            DfuError::AccessDenied { .. } => 24,
            DfuError::DeviceNotFound => 25,
            DfuError::InternalError(_) => 26,
            DfuError::UnknownError(_) => 27,
            DfuError::Aborted => 28,
            DfuError::Serial(_) => 29,
            DfuError::Io(_) => 30,
            DfuError::Json(_) => 31,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootloader_status_is_masked() {
        let err = DfuError::bootloader_status(0x03);
        match err {
            DfuError::BootloaderError { masked_status } => {
                assert_eq!(masked_status, BOOTLOADER_MASK | 0x03);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn transport_errors_are_masked_in_exit_code() {
        let err = DfuError::Timeout { elapsed_ms: 5000 };
        assert_eq!(err.exit_code() & COMM_MASK, COMM_MASK);
    }

    #[test]
    fn non_transport_errors_are_unmasked() {
        let err = DfuError::Eof;
        assert_eq!(err.exit_code() & COMM_MASK, 0);
        assert_eq!(err.exit_code() & BOOTLOADER_MASK, 0);
    }
}
