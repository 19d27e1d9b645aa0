//! Session controller (component C8).
//!
//! Owns the Enter → SetMetadata → (per-row action)\* → VerifyChecksum →
//! Exit state machine for `.cyacd2` images, and the equivalent Enter →
//! (declarative commands) → Exit bracket around the `.mtbdfu` driver (C7).
//! One `Session` drives at most one action at a time; the caller owns the
//! [`Channel`] it hands in and is responsible for not reusing it across
//! concurrent actions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::Channel;
use crate::checksum::crc32c;
use crate::command::{self, ChecksumKind, Opcode};
use crate::error::{DfuError, DfuResult};
use crate::image::cyacd2::{Cyacd2File, Row};
use crate::image::mtbdfu::{self, MtbdfuDocument, Runner};
use crate::image::ImageHeader;
use crate::progress::{MonotonicProgress, ProgressSink};
use crate::transport::{ChunkingTransport, RowAction};

/// Which row-level command a `.cyacd2` action dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Program,
    Verify,
    Erase,
}

/// Device identity reported by `EnterBootloader`, surfaced by
/// [`Session::display_hw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub silicon_id: u32,
    pub silicon_rev: u8,
    pub bootloader_version: [u8; 3],
}

/// Drives one DFU action at a time over a caller-supplied [`Channel`].
/// Cheaply cloneable: [`Session::abort_handle`] hands out the same atomic
/// flag `abort()` sets, so a worker thread running an action and the
/// thread calling `abort()` can share one `Session`.
#[derive(Clone)]
pub struct Session {
    abort_flag: Arc<AtomicBool>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self { abort_flag: Arc::new(AtomicBool::new(false)) }
    }

    /// Share this session's abort flag with a [`Channel`] implementation
    /// that needs to observe it mid-poll (I2C/SPI byte-wait loops).
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort_flag.clone()
    }

    /// Flip the cooperative abort flag. Callable from any thread; a second
    /// call before a fresh action starts is idempotent.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    fn should_abort(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    /// Reset the abort flag so the session can drive a new action. Called
    /// implicitly at the start of every action below.
    fn reset(&self) {
        self.abort_flag.store(false, Ordering::SeqCst);
    }

    pub fn program(&self, path: &str, channel: &mut dyn Channel, progress: ProgressSink) -> DfuResult<()> {
        self.run_cyacd2_action(path, channel, progress, Action::Program)
    }

    pub fn verify(&self, path: &str, channel: &mut dyn Channel, progress: ProgressSink) -> DfuResult<()> {
        self.run_cyacd2_action(path, channel, progress, Action::Verify)
    }

    pub fn erase(&self, path: &str, channel: &mut dyn Channel, progress: ProgressSink) -> DfuResult<()> {
        self.run_cyacd2_action(path, channel, progress, Action::Erase)
    }

    pub fn send_command(&self, path: &str, channel: &mut dyn Channel, progress: ProgressSink) -> DfuResult<()> {
        self.reset();
        let doc = mtbdfu::parse_document_file(path)?;
        channel.open()?;
        let result = self.drive_mtbdfu(&doc, channel, progress);
        self.teardown(channel, doc.app_info.checksum_kind, result)
    }

    /// EnterBootloader then immediately ExitBootloader, reporting the
    /// device identity the device reveals in between. `product_id` is not
    /// validated against an image since none is involved.
    pub fn display_hw(&self, channel: &mut dyn Channel, checksum_kind: ChecksumKind) -> DfuResult<DeviceInfo> {
        self.reset();
        channel.open()?;

        let outcome = {
            let mut transport = ChunkingTransport::new(channel, checksum_kind);
            let (opcode, data) = command::enter_bootloader_request(0);
            transport.exchange(opcode, &data, 8).and_then(|resp| command::parse_enter_bootloader_response(&resp.data)).map(
                |r| DeviceInfo {
                    silicon_id: r.silicon_id,
                    silicon_rev: r.silicon_rev,
                    bootloader_version: r.bootloader_version,
                },
            )
        };

        if !matches!(&outcome, Err(e) if e.is_transport()) {
            let mut transport = ChunkingTransport::new(channel, checksum_kind);
            let _ = transport.exchange(Opcode::ExitBootloader, &[], 0);
        }
        let _ = channel.close();
        outcome
    }

    fn run_cyacd2_action(&self, path: &str, channel: &mut dyn Channel, progress: ProgressSink, action: Action) -> DfuResult<()> {
        self.reset();
        let mut file = Cyacd2File::open(path)?;
        let header = file.read_header()?;
        let (span, data_line_count) = file.scan_application_span()?;

        channel.open()?;
        let result = self.drive_cyacd2(&mut file, channel, &header, span.app_start, span.app_size, data_line_count, action, progress);
        self.teardown(channel, header.checksum_kind, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn drive_cyacd2(
        &self,
        file: &mut Cyacd2File,
        channel: &mut dyn Channel,
        header: &ImageHeader,
        app_start: u32,
        app_size: u32,
        total_rows: u32,
        action: Action,
        progress_sink: ProgressSink,
    ) -> DfuResult<()> {
        let mut progress = MonotonicProgress::new(progress_sink);
        let mut transport = ChunkingTransport::new(channel, header.checksum_kind);

        let (enter_opcode, enter_data) = command::enter_bootloader_request(header.product_id);
        let enter_response = transport.exchange(enter_opcode, &enter_data, 8)?;
        let identity = command::parse_enter_bootloader_response(&enter_response.data)?;
        if identity.silicon_id != header.silicon_id || identity.silicon_rev != header.silicon_rev {
            return Err(DfuError::DeviceMismatch { expected_id: header.silicon_id, actual_id: identity.silicon_id });
        }

        let (meta_opcode, meta_data) = command::set_application_metadata_request(header.app_id, app_start, app_size);
        transport.exchange(meta_opcode, &meta_data, 0)?;

        let denom = (total_rows.max(1)) as f64;
        let mut done = 0u32;
        loop {
            if self.should_abort() {
                return Err(DfuError::Aborted);
            }
            match file.next_row()? {
                Row::Eof => break,
                Row::Comment => {}
                Row::Eiv(bytes) => {
                    let (opcode, data) = command::set_encryption_iv_request(&bytes)?;
                    transport.exchange(opcode, &data, 0)?;
                }
                Row::AppInfo { .. } => {}
                Row::Data { address, data, .. } => {
                    let row_crc = crc32c(&data);
                    match action {
                        Action::Program => transport.send_row(address, &data, row_crc, RowAction::Program)?,
                        Action::Verify => transport.send_row(address, &data, row_crc, RowAction::Verify)?,
                        Action::Erase => {
                            let (opcode, d) = command::erase_data_request(address);
                            transport.exchange(opcode, &d, 0)?;
                        }
                    }
                    done += 1;
                    progress.report((done as f64 / denom) * 100.0);
                }
            }
        }

        if matches!(action, Action::Program | Action::Verify) {
            let (opcode, data) = command::verify_checksum_request(header.app_id);
            let resp = transport.exchange(opcode, &data, 1)?;
            if !command::parse_verify_checksum_response(&resp.data)? {
                return Err(DfuError::ChecksumMismatch);
            }
        }

        progress.finish();
        Ok(())
    }

    fn drive_mtbdfu(&self, doc: &MtbdfuDocument, channel: &mut dyn Channel, progress_sink: ProgressSink) -> DfuResult<()> {
        let mut progress = MonotonicProgress::new(progress_sink);
        let mut transport = ChunkingTransport::new(channel, doc.app_info.checksum_kind);

        let (enter_opcode, enter_data) = command::enter_bootloader_request(doc.app_info.product_id);
        let enter_response = transport.exchange(enter_opcode, &enter_data, 8)?;
        command::parse_enter_bootloader_response(&enter_response.data)?;

        let mut runner = Runner::new(&mut transport, u32::MAX, 0);
        let abort_flag = self.abort_flag.clone();
        let should_abort = move || abort_flag.load(Ordering::SeqCst);

        for commands in &doc.sessions {
            runner.run(commands, &should_abort, &mut |p| progress.report(p))?;
        }

        progress.finish();
        Ok(())
    }

    /// Common teardown for every action: a clean Exit bracket unless the
    /// action aborted or failed at the transport layer, then an
    /// unconditional channel close. Returns `result` unchanged.
    fn teardown(&self, channel: &mut dyn Channel, checksum_kind: ChecksumKind, result: DfuResult<()>) -> DfuResult<()> {
        let attempt_exit = !matches!(&result, Err(DfuError::Aborted)) && !matches!(&result, Err(e) if e.is_transport());
        if attempt_exit {
            let mut transport = ChunkingTransport::new(channel, checksum_kind);
            let _ = transport.exchange(Opcode::ExitBootloader, &[], 0);
        }
        let _ = channel.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Opcode as Op;
    use crate::packet;
    use std::collections::VecDeque;
    use std::io::Write;

    struct FakeChannel {
        mtu: u32,
        writes: Vec<Vec<u8>>,
        responses: VecDeque<Vec<u8>>,
        closed: bool,
    }

    impl Channel for FakeChannel {
        fn open(&mut self) -> DfuResult<()> {
            Ok(())
        }
        fn close(&mut self) -> DfuResult<()> {
            self.closed = true;
            Ok(())
        }
        fn read(&mut self, buf: &mut [u8]) -> DfuResult<()> {
            let resp = self.responses.pop_front().expect("no queued response");
            assert_eq!(resp.len(), buf.len());
            buf.copy_from_slice(&resp);
            Ok(())
        }
        fn write(&mut self, buf: &[u8]) -> DfuResult<()> {
            self.writes.push(buf.to_vec());
            Ok(())
        }
        fn max_transfer_size(&self) -> u32 {
            self.mtu
        }
    }

    fn cyacd2_fixture(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.cyacd2");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    fn ok_response(checksum_kind: ChecksumKind, cmd: u8, data: &[u8]) -> Vec<u8> {
        let mut resp = packet::build(0x00, data, checksum_kind).unwrap();
        resp[1] = cmd;
        resp
    }

    #[test]
    fn program_happy_path_drives_enter_metadata_row_checksum_exit() {
        // header: version=1, silicon_id=0x01020304, silicon_rev=0x41, SUM, app_id=0x10, product_id=0
        let contents = "010403020141001000000000\n:00001000AABBCC\n";
        let (_dir, path) = cyacd2_fixture(contents);

        let mut responses = VecDeque::new();
        // EnterBootloader response: silicon_id LE ++ silicon_rev ++ bl_version(3)
        responses.push_back(ok_response(
            ChecksumKind::Sum16,
            0x00,
            &[0x04, 0x03, 0x02, 0x01, 0x41, 0x00, 0x00, 0x00],
        ));
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[])); // SetMetadata
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[])); // ProgramData (row fits MTU)
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[0x01])); // VerifyChecksum
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[])); // ExitBootloader

        let mut channel = FakeChannel { mtu: 64, writes: Vec::new(), responses, closed: false };
        let mut seen = Vec::new();
        let session = Session::new();
        {
            let mut sink = |p: f64| seen.push(p);
            session.program(path.to_str().unwrap(), &mut channel, &mut sink).unwrap();
        }

        assert!(channel.closed);
        assert_eq!(seen.last().copied(), Some(100.0));
        assert_eq!(channel.writes[0][1], Op::EnterBootloader.code());
        assert_eq!(channel.writes[1][1], Op::SetApplicationMetadata.code());
        assert_eq!(channel.writes[2][1], Op::ProgramData.code());
        assert_eq!(channel.writes[3][1], Op::VerifyChecksum.code());
        assert_eq!(channel.writes[4][1], Op::ExitBootloader.code());
    }

    #[test]
    fn s6_device_mismatch_still_sends_exit_and_closes_once() {
        let contents = "010403020141001000000000\n:00001000AABBCC\n";
        let (_dir, path) = cyacd2_fixture(contents);

        let mut responses = VecDeque::new();
        // silicon_id differs from header's 0x01020304
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 0x00, 0x00, 0x00]));
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[])); // ExitBootloader

        let mut channel = FakeChannel { mtu: 64, writes: Vec::new(), responses, closed: false };
        let session = Session::new();
        let mut sink = |_: f64| {};
        let err = session.program(path.to_str().unwrap(), &mut channel, &mut sink).unwrap_err();

        assert!(matches!(err, DfuError::DeviceMismatch { .. }));
        assert!(channel.closed);
        assert_eq!(channel.writes.len(), 2);
        assert_eq!(channel.writes[1][1], Op::ExitBootloader.code());
    }

    #[test]
    fn s7_abort_stops_before_next_row_without_exit() {
        let mut contents = String::from("010403020141001000000000\n");
        for i in 0u32..1000 {
            let addr = (i * 0x10).to_le_bytes();
            contents.push_str(&format!(":{:02X}{:02X}{:02X}{:02X}AA\n", addr[0], addr[1], addr[2], addr[3]));
        }
        let (_dir, path) = cyacd2_fixture(&contents);

        let mut responses = VecDeque::new();
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[0x04, 0x03, 0x02, 0x01, 0x41, 0x00, 0x00, 0x00]));
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[])); // SetMetadata
        for _ in 0..10 {
            responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[])); // EraseData x10
        }

        let mut channel = FakeChannel { mtu: 64, writes: Vec::new(), responses, closed: false };
        let session = Session::new();
        let abort_flag = session.abort_handle();
        let mut rows_done = 0u32;
        let mut last_progress = 0.0f64;
        {
            let mut sink = |p: f64| {
                last_progress = p;
                rows_done += 1;
                if rows_done == 10 {
                    abort_flag.store(true, Ordering::SeqCst);
                }
            };
            let err = session.erase(path.to_str().unwrap(), &mut channel, &mut sink).unwrap_err();
            assert!(matches!(err, DfuError::Aborted));
        }
        // Enter + SetMetadata + 10 EraseData, no 11th, no Exit
        assert_eq!(channel.writes.len(), 12);
        assert!(channel.writes.iter().all(|w| w[1] != Op::ExitBootloader.code()));
        assert!(last_progress <= 1.1);
        assert!(channel.closed);
    }

    #[test]
    fn display_hw_enters_then_exits_immediately() {
        let mut responses = VecDeque::new();
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[0x04, 0x03, 0x02, 0x01, 0x41, 0x00, 0x00, 0x00]));
        responses.push_back(ok_response(ChecksumKind::Sum16, 0x00, &[]));
        let mut channel = FakeChannel { mtu: 64, writes: Vec::new(), responses, closed: false };

        let session = Session::new();
        let info = session.display_hw(&mut channel, ChecksumKind::Sum16).unwrap();
        assert_eq!(info.silicon_id, 0x0102_0304);
        assert_eq!(channel.writes.len(), 2);
        assert_eq!(channel.writes[0][1], Op::EnterBootloader.code());
        assert_eq!(channel.writes[1][1], Op::ExitBootloader.code());
    }
}
