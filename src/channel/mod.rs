//! Byte channel capability (component C4).
//!
//! A single polymorphic capability with three interface-specific
//! implementations, selected by configuration at action entry and dropped
//! at action exit — no process-wide "current channel" state is needed; the
//! session controller (C8) holds the trait object for the lifetime of one
//! action.

mod i2c;
mod spi;
mod uart;

pub use i2c::{I2cBus, I2cChannel};
pub use spi::{SpiBitOrder, SpiBus, SpiChannel, SpiMode};
pub use uart::{Parity, StopBits, UartChannel};

use crate::error::DfuResult;

/// Channel configuration, one active variant per session (§3).
#[derive(Debug, Clone)]
pub enum ChannelSettings {
    I2c { freq_hz: u32, addr: u8 },
    Spi { freq_hz: u32, mode: SpiMode, bit_order: SpiBitOrder },
    Uart { baud: u32, data_bits: u8, parity: Parity, stop_bits: StopBits },
}

/// Open/close/read/write contract implemented by every transport.
///
/// `read` must fill exactly `buf.len()` bytes or fail; partial reads are
/// never surfaced to callers above this trait.
pub trait Channel {
    fn open(&mut self) -> DfuResult<()>;
    fn close(&mut self) -> DfuResult<()>;
    fn read(&mut self, buf: &mut [u8]) -> DfuResult<()>;
    fn write(&mut self, buf: &[u8]) -> DfuResult<()>;
    fn max_transfer_size(&self) -> u32;

    /// Checked at the top of every polling iteration inside a read; when it
    /// returns `true` the channel implementation must return
    /// [`crate::error::DfuError::Aborted`] as soon as possible.
    fn should_abort(&self) -> bool {
        false
    }
}
