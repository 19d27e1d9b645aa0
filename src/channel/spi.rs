//! SPI byte channel (component C4).
//!
//! SPI is always full-duplex: every transfer clocks bytes in both
//! directions simultaneously. A read therefore polls with single-byte
//! transfers for the packet-start marker (there is no "not ready" filler
//! byte like I²C's `0xFF`, but the device has nothing useful to clock out
//! until it has a reply ready, so the host must poll for the start byte
//! the same way). Once seen, the `packet_started` latch behaves exactly as
//! it does for I²C. A 1 ms delay is inserted before reads/writes for
//! compatibility with older device-side SPI middleware, and again after
//! `SendDataNoResponse` writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use super::Channel;
use crate::command::Opcode;
use crate::error::{DfuError, DfuResult};

const PACKET_START: u8 = 0x01;
const PACKET_END: u8 = 0x17;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLLS: u32 = 30;
const COMPAT_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    Mode0,
    Mode1,
    Mode2,
    Mode3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiBitOrder {
    Msb,
    Lsb,
}

/// Low-level full-duplex transfer primitive a bridge library supplies.
pub trait SpiBus {
    /// Clock `len` bytes in both directions; returns what was read in.
    fn transfer(&mut self, write: &[u8], len: usize) -> DfuResult<Vec<u8>>;
}

pub struct SpiChannel<B: SpiBus> {
    bus: B,
    max_transfer_size: u32,
    packet_started: bool,
    abort: Arc<AtomicBool>,
}

impl<B: SpiBus> SpiChannel<B> {
    pub fn new(bus: B, max_transfer_size: u32, abort: Arc<AtomicBool>) -> Self {
        Self {
            bus,
            max_transfer_size,
            packet_started: false,
            abort,
        }
    }

    fn transfer(&mut self, len: usize) -> DfuResult<Vec<u8>> {
        let write_buf = vec![0u8; len];
        self.bus.transfer(&write_buf, len)
    }
}

impl<B: SpiBus> Channel for SpiChannel<B> {
    fn open(&mut self) -> DfuResult<()> {
        self.packet_started = false;
        Ok(())
    }

    fn close(&mut self) -> DfuResult<()> {
        self.packet_started = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DfuResult<()> {
        let size = buf.len();
        if size == 0 {
            return Ok(());
        }

        if !self.packet_started {
            sleep(COMPAT_DELAY);

            let mut good = None;
            for _ in 0..MAX_POLLS {
                let byte = self.transfer(1)?[0];
                if byte == PACKET_START {
                    good = Some(byte);
                    break;
                }
                sleep(POLL_INTERVAL);
                if self.should_abort() {
                    return Err(DfuError::Aborted);
                }
            }
            let first = good.ok_or(DfuError::Timeout {
                elapsed_ms: (MAX_POLLS as u64) * (POLL_INTERVAL.as_millis() as u64),
            })?;
            buf[0] = first;
            self.packet_started = true;

            if size > 1 {
                let rest = self.transfer(size - 1)?;
                buf[1..].copy_from_slice(&rest);
            }
        } else {
            let data = self.transfer(size)?;
            buf.copy_from_slice(&data);
        }

        if buf[size - 1] == PACKET_END {
            self.packet_started = false;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> DfuResult<()> {
        sleep(COMPAT_DELAY);
        let _ = self.bus.transfer(buf, buf.len())?;

        if buf.len() > 1 && buf[1] == Opcode::SendDataNoResponse.code() {
            sleep(COMPAT_DELAY);
        }
        Ok(())
    }

    fn max_transfer_size(&self) -> u32 {
        self.max_transfer_size
    }

    fn should_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}
