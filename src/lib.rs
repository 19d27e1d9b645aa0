//! Host-side Device Firmware Update (DFU) driver.
//!
//! Reprograms, verifies, or erases the flash of an embedded target across
//! one of three byte-serial transports (I²C, SPI, UART) using a framed
//! request/response packet protocol. The library consumes a "byte
//! channel" capability ([`channel::Channel`]) and a "progress sink"
//! callback, and exposes `program`/`verify`/`erase`/`send_command`/`abort`
//! through [`session::Session`]. CLI argument parsing, on-disk logging
//! configuration, and device enumeration live in the `dfuhost` binary, not
//! in this library.

pub mod channel;
pub mod checksum;
pub mod command;
pub mod error;
pub mod image;
pub mod packet;
pub mod progress;
pub mod session;
pub mod transport;

pub use command::ChecksumKind;
pub use error::{DfuError, DfuResult};
pub use session::{DeviceInfo, Session};
