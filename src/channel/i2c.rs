//! I²C byte channel (component C4).
//!
//! Device-side quirk: `0xFF` on the wire means "not ready yet," not data.
//! A read therefore tolerates leading `0xFF` bytes by polling single-byte
//! reads until a real byte appears, then reads the remainder in bulk. A
//! `packet_started` latch (set on seeing the packet-start byte, cleared on
//! seeing packet-end) keeps a second read of the same logical packet from
//! re-entering the start-byte search and misreading legitimate `0xFF`
//! payload bytes (an all-ones checksum, for instance) as "still busy."
//! This is a protocol property of the device, not a bug — keep the
//! two-phase logic intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use super::Channel;
use crate::command::Opcode;
use crate::error::{DfuError, DfuResult};

const PACKET_START: u8 = 0x01;
const PACKET_END: u8 = 0x17;
const BUSY_BYTE: u8 = 0xFF;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLLS: u32 = 30;
const POST_NO_RESPONSE_DELAY: Duration = Duration::from_millis(1);

/// Low-level primitive a bridge library supplies: a combined start/write/stop
/// transaction returning the device's ACK buffer, and a combined
/// start/read/stop transaction returning raw bytes (which may begin with
/// `0xFF` "not ready" filler).
pub trait I2cBus {
    /// Write `data` to `addr`. Returns the ACK buffer: byte 0 is the
    /// address ACK (`1`) or NACK (`0`), followed by one ACK bit per data
    /// byte written.
    fn write(&mut self, addr: u8, data: &[u8]) -> DfuResult<Vec<u8>>;

    /// Read `len` raw bytes from `addr`.
    fn read(&mut self, addr: u8, len: usize) -> DfuResult<Vec<u8>>;
}

/// I²C channel over an injected [`I2cBus`] primitive.
pub struct I2cChannel<B: I2cBus> {
    bus: B,
    addr: u8,
    max_transfer_size: u32,
    packet_started: bool,
    abort: Arc<AtomicBool>,
}

impl<B: I2cBus> I2cChannel<B> {
    pub fn new(bus: B, addr: u8, max_transfer_size: u32, abort: Arc<AtomicBool>) -> Self {
        Self {
            bus,
            addr,
            max_transfer_size,
            packet_started: false,
            abort,
        }
    }

    fn read_first_good_byte(&mut self) -> DfuResult<u8> {
        for _ in 0..MAX_POLLS {
            let chunk = self.bus.read(self.addr, 1)?;
            let byte = chunk[0];
            if byte != BUSY_BYTE {
                return Ok(byte);
            }
            sleep(POLL_INTERVAL);
            if self.should_abort() {
                return Err(DfuError::Aborted);
            }
        }
        Err(DfuError::Timeout {
            elapsed_ms: (MAX_POLLS as u64) * (POLL_INTERVAL.as_millis() as u64),
        })
    }
}

impl<B: I2cBus> Channel for I2cChannel<B> {
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
            let first = self.read_first_good_byte()?;
            buf[0] = first;
            if first == PACKET_START {
                self.packet_started = true;
            }
            if size > 1 {
                let rest = self.bus.read(self.addr, size - 1)?;
                buf[1..].copy_from_slice(&rest);
            }
        } else {
            let data = self.bus.read(self.addr, size)?;
            buf.copy_from_slice(&data);
        }

        if buf[size - 1] == PACKET_END {
            self.packet_started = false;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> DfuResult<()> {
        let ack = self.bus.write(self.addr, buf)?;
        if ack.first().copied().unwrap_or(0) == 0 {
            return Err(DfuError::WriteFailed {
                detail: format!("address 0x{:02X} NACKed", self.addr),
            });
        }
        if ack.iter().skip(1).any(|&bit| bit == 0) {
            return Err(DfuError::WriteFailed {
                detail: "device NACKed a data byte".into(),
            });
        }

        if buf.len() > 1 && buf[1] == Opcode::SendDataNoResponse.code() {
            sleep(POST_NO_RESPONSE_DELAY);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeBus {
        reads: VecDeque<Vec<u8>>,
        writes: Vec<(u8, Vec<u8>)>,
        write_ack: Vec<u8>,
    }

    impl I2cBus for FakeBus {
        fn write(&mut self, addr: u8, data: &[u8]) -> DfuResult<Vec<u8>> {
            self.writes.push((addr, data.to_vec()));
            Ok(self.write_ack.clone())
        }

        fn read(&mut self, _addr: u8, len: usize) -> DfuResult<Vec<u8>> {
            let chunk = self.reads.pop_front().expect("unexpected extra read");
            assert_eq!(chunk.len(), len);
            Ok(chunk)
        }
    }

    fn channel(bus: FakeBus) -> I2cChannel<FakeBus> {
        I2cChannel::new(bus, 0x08, 64, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn read_skips_busy_bytes_then_reads_remainder() {
        let bus = FakeBus {
            reads: VecDeque::from([vec![0xFF], vec![0xFF], vec![0x01], vec![0x38, 0x00, 0x00, 0x17]]),
            writes: Vec::new(),
            write_ack: Vec::new(),
        };
        let mut ch = channel(bus);
        let mut buf = [0u8; 5];
        ch.read(&mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x38, 0x00, 0x00, 0x17]);
        assert!(!ch.packet_started);
    }

    #[test]
    fn packet_started_latch_skips_start_search_on_next_read() {
        let bus = FakeBus {
            reads: VecDeque::from([vec![0x01], vec![0xFF, 0xFF, 0x17]]),
            writes: Vec::new(),
            write_ack: Vec::new(),
        };
        let mut ch = channel(bus);
        let mut buf1 = [0u8; 1];
        ch.read(&mut buf1).unwrap();
        assert!(ch.packet_started);

        let mut buf2 = [0u8; 3];
        ch.read(&mut buf2).unwrap();
        assert_eq!(buf2, [0xFF, 0xFF, 0x17]);
        assert!(!ch.packet_started);
    }

    #[test]
    fn write_fails_on_address_nack() {
        let bus = FakeBus {
            reads: VecDeque::new(),
            writes: Vec::new(),
            write_ack: vec![0],
        };
        let mut ch = channel(bus);
        assert!(matches!(ch.write(&[0x01, 0x38]), Err(DfuError::WriteFailed { .. })));
    }

    #[test]
    fn write_fails_on_byte_nack() {
        let bus = FakeBus {
            reads: VecDeque::new(),
            writes: Vec::new(),
            write_ack: vec![1, 1, 0],
        };
        let mut ch = channel(bus);
        assert!(matches!(ch.write(&[0x01, 0x38]), Err(DfuError::WriteFailed { .. })));
    }

    #[test]
    fn abort_observed_mid_poll() {
        let abort = Arc::new(AtomicBool::new(false));
        let bus = FakeBus {
            reads: VecDeque::from([vec![0xFF]]),
            writes: Vec::new(),
            write_ack: Vec::new(),
        };
        let mut ch = I2cChannel::new(bus, 0x08, 64, abort.clone());
        abort.store(true, Ordering::SeqCst);
        let mut buf = [0u8; 1];
        assert!(matches!(ch.read(&mut buf), Err(DfuError::Aborted)));
    }
}
