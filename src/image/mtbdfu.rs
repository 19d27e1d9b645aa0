//! `.mtbdfu` JSON session driver (component C7).
//!
//! Executes a declarative command script: an `APPInfo` header plus either a
//! flat `commands` array or a `sessions` array of `{commands: [...]}`
//! groups. Each command is keyed by `cmdId` and may carry a literal
//! `dataBytes` payload, pull from an Intel-HEX `dataFile`, and repeat a
//! fixed number of times or `"EoF"` (until the bound hex file is
//! exhausted). A `commandSet` groups a stage-then-commit pair — typically
//! N×SendData followed by one Program/VerifyData — replayed once per
//! outer-repeat iteration.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};

use serde_json::Value;

use crate::checksum::crc32c;
use crate::command::{ChecksumKind, Opcode};
use crate::error::{DfuError, DfuResult};
use crate::transport::ChunkingTransport;

const CMD_PROGRAM_DATA: u8 = 0x49;
const CMD_VERIFY_DATA: u8 = 0x4A;
const CMD_ERASE_DATA: u8 = 0x44;
const CMD_SET_METADATA: u8 = 0x4C;

const DEFAULT_FLASH_ROW_LENGTH: u32 = 0x200;

/// `APPInfo` header, required on every `.mtbdfu` document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppInfo {
    pub file_version: u32,
    pub product_id: u32,
    pub checksum_kind: ChecksumKind,
}

/// A command's `repeat` field: a fixed count, or `"EoF"` bound to a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Count(u32),
    Eof,
}

/// One declarative command, or (when `command_set` is present) a
/// stage-then-commit group sharing the outer fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub cmd_id: u8,
    pub data_length: Option<u32>,
    pub data_bytes: Option<Vec<u8>>,
    pub data_file: Option<String>,
    pub flash_row_length: Option<u32>,
    pub start_offset: Option<u32>,
    pub repeat: Option<Repeat>,
    pub out_file: Option<String>,
    pub out_cli: bool,
    pub command_set: Option<Vec<Command>>,
}

#[derive(Debug, Clone)]
pub struct MtbdfuDocument {
    pub app_info: AppInfo,
    pub sessions: Vec<Vec<Command>>,
}

fn config_error(detail: impl Into<String>) -> DfuError {
    DfuError::ConfigError { detail: detail.into() }
}

/// Parse a `0x`-prefixed hex literal (case-insensitive), per the header
/// validator's `^0x[0-9A-F]+$` regex.
fn parse_hex_literal(s: &str, field: &str) -> DfuResult<u32> {
    let stripped = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).ok_or_else(|| {
        config_error(format!("{field} must be a hex literal starting with '0x', got {s:?}"))
    })?;
    if stripped.is_empty() || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(config_error(format!("{field} must be a valid hex value starting with '0x', got {s:?}")));
    }
    u32::from_str_radix(stripped, 16).map_err(|_| config_error(format!("{field}: hex value out of range")))
}

fn parse_app_info(value: &Value) -> DfuResult<AppInfo> {
    let meta = value
        .get("APPInfo")
        .ok_or_else(|| config_error(".mtbdfu file must contain an \"APPInfo\" section"))?;
    let meta = meta.as_object().ok_or_else(|| config_error("\"APPInfo\" must be a JSON object"))?;

    let file_version = meta
        .get("File Version")
        .and_then(Value::as_str)
        .ok_or_else(|| config_error("\"APPInfo\" must include \"File Version\""))
        .and_then(|s| parse_hex_literal(s, "File Version"))?;

    let product_id_raw = meta
        .get("Product Id")
        .and_then(Value::as_str)
        .ok_or_else(|| config_error("\"APPInfo\" must include \"Product Id\""))?;
    let product_id = parse_hex_literal(&format!("0x{product_id_raw}"), "Product Id")?;

    let checksum_type = meta
        .get("Packet Checksum Type")
        .and_then(Value::as_str)
        .ok_or_else(|| config_error("\"APPInfo\" must include \"Packet Checksum Type\""))
        .and_then(|s| parse_hex_literal(s, "Packet Checksum Type"))?;
    let checksum_kind = ChecksumKind::from_byte(checksum_type as u8)?;

    Ok(AppInfo { file_version, product_id, checksum_kind })
}

fn decode_data_bytes(value: &Value) -> DfuResult<Vec<u8>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                let s = v.as_str().ok_or_else(|| config_error("dataBytes array entries must be hex strings"))?;
                u8::from_str_radix(s.trim_start_matches("0x").trim_start_matches("0X"), 16)
                    .map_err(|_| config_error(format!("invalid dataBytes entry {s:?}")))
            })
            .collect(),
        Value::String(s) => {
            let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
            if s.len() % 2 != 0 {
                return Err(config_error("dataBytes string must have an even number of hex digits"));
            }
            (0..s.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| config_error("invalid dataBytes hex string")))
                .collect()
        }
        _ => Err(config_error("\"dataBytes\" should be either array or string")),
    }
}

fn parse_repeat(value: &Value) -> DfuResult<Repeat> {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case("eof") => Ok(Repeat::Eof),
        Value::String(s) => parse_hex_literal(s, "repeat").map(Repeat::Count),
        Value::Number(n) => n
            .as_u64()
            .map(|v| Repeat::Count(v as u32))
            .ok_or_else(|| config_error("repeat must be a non-negative integer or \"EoF\"")),
        _ => Err(config_error("repeat must be a string or integer")),
    }
}

fn parse_command(value: &Value) -> DfuResult<Command> {
    let obj = value.as_object().ok_or_else(|| config_error("each command must be a JSON object"))?;

    let mut cmd = Command::default();

    if let Some(set) = obj.get("commandSet") {
        let set = set.as_array().ok_or_else(|| config_error("\"commandSet\" must be an array"))?;
        cmd.command_set = Some(set.iter().map(parse_command).collect::<DfuResult<Vec<_>>>()?);
    } else {
        let cmd_id_str = obj
            .get("cmdId")
            .and_then(Value::as_str)
            .ok_or_else(|| config_error("cmdId must be defined for every command"))?;
        cmd.cmd_id = parse_hex_literal(cmd_id_str, "cmdId")? as u8;
    }

    if let Some(v) = obj.get("dataLength").and_then(Value::as_str) {
        cmd.data_length = Some(parse_hex_literal(v, "dataLength")?);
    }
    if let Some(v) = obj.get("dataBytes") {
        let mut bytes = decode_data_bytes(v)?;
        if let Some(declared) = cmd.data_length {
            let declared = declared as usize;
            if declared > bytes.len() {
                let mut padded = vec![0u8; declared - bytes.len()];
                padded.extend_from_slice(&bytes);
                bytes = padded;
            } else if declared < bytes.len() {
                log::warn!(target: "dfuhost::image::mtbdfu", "\"dataLength\" is smaller than actual data length");
            }
        }
        cmd.data_bytes = Some(bytes);
    }
    if let Some(v) = obj.get("dataFile").and_then(Value::as_str) {
        cmd.data_file = Some(v.to_string());
    }
    if let Some(v) = obj.get("flashRowLength").and_then(Value::as_str) {
        cmd.flash_row_length = Some(parse_hex_literal(v, "flashRowLength")?);
    }
    if let Some(v) = obj.get("startOffset").and_then(Value::as_str) {
        cmd.start_offset = Some(parse_hex_literal(v, "startOffset")?);
    }
    if let Some(v) = obj.get("repeat") {
        cmd.repeat = Some(parse_repeat(v)?);
    }
    if let Some(v) = obj.get("outFile").and_then(Value::as_str) {
        cmd.out_file = Some(v.to_string());
    }
    cmd.out_cli = obj.get("outCli").and_then(Value::as_str).map(|s| s.eq_ignore_ascii_case("true")).unwrap_or(false);

    Ok(cmd)
}

/// Parse a `.mtbdfu` document from its JSON text.
pub fn parse_document(text: &str) -> DfuResult<MtbdfuDocument> {
    let value: Value = serde_json::from_str(text)?;
    let app_info = parse_app_info(&value)?;

    let sessions = if let Some(commands) = value.get("commands") {
        let commands = commands.as_array().ok_or_else(|| config_error("\"commands\" must be an array"))?;
        vec![commands.iter().map(parse_command).collect::<DfuResult<Vec<_>>>()?]
    } else if let Some(sessions) = value.get("sessions") {
        let sessions = sessions.as_array().ok_or_else(|| config_error("\"sessions\" must be an array"))?;
        sessions
            .iter()
            .map(|s| {
                let commands = s
                    .get("commands")
                    .and_then(Value::as_array)
                    .ok_or_else(|| config_error("each session must include a \"commands\" field"))?;
                commands.iter().map(parse_command).collect::<DfuResult<Vec<_>>>()
            })
            .collect::<DfuResult<Vec<_>>>()?
    } else {
        return Err(config_error("document must contain either \"commands\" or \"sessions\""));
    };

    Ok(MtbdfuDocument { app_info, sessions })
}

/// Parse a `.mtbdfu` document from a file on disk.
pub fn parse_document_file(path: &str) -> DfuResult<MtbdfuDocument> {
    let text = std::fs::read_to_string(path).map_err(|_| DfuError::FileNotFound { path: path.to_string() })?;
    parse_document(&text)
}

/// Extract `(app_start, app_size)` from a literal `SetApplicationMetadata`
/// payload (`appId(1B) || appStart(4B LE) || appSize(4B LE)`), the
/// documented side effect of sending a metadata command built from
/// `dataBytes` rather than discovered from an image header.
pub fn metadata_from_bytes(data: &[u8]) -> DfuResult<(u32, u32)> {
    if data.len() < 9 {
        return Err(DfuError::BadLength { detail: "SetMetadata payload must be at least 9 bytes".into() });
    }
    let app_start = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let app_size = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
    Ok((app_start, app_size))
}

/// Intel-HEX record accumulator: streams a `dataFile`, tracking the
/// extended linear address, dropping bytes below `app_start`, and grouping
/// bytes into fixed-size flash rows so each row's CRC-32C can be computed
/// once it is complete. Mirrors `cydfuhtcoredata.cpp`'s `m_appRowArray` /
/// `m_dataQueue` / `m_addressQueue` / `m_chksumQueue` bookkeeping.
pub struct IntelHexSource {
    reader: BufReader<File>,
    extended_addr: u32,
    flash_row_length: u32,
    app_start: u32,
    programming: bool,
    row_accum: Vec<u8>,
    row_addr: Option<u32>,
    data_queue: VecDeque<u8>,
    address_queue: VecDeque<u32>,
    chksum_queue: VecDeque<u32>,
    pub eof_reached: bool,
}

impl IntelHexSource {
    pub fn open(path: &str, flash_row_length: u32, app_start: u32, programming: bool) -> DfuResult<Self> {
        let file = File::open(path).map_err(|_| DfuError::FileNotFound { path: path.to_string() })?;
        Ok(Self {
            reader: BufReader::new(file),
            extended_addr: 0,
            flash_row_length,
            app_start,
            programming,
            row_accum: Vec::new(),
            row_addr: None,
            data_queue: VecDeque::new(),
            address_queue: VecDeque::new(),
            chksum_queue: VecDeque::new(),
            eof_reached: false,
        })
    }

    fn flush_partial_row(&mut self) {
        if !self.row_accum.is_empty() {
            if self.row_accum.len() < self.flash_row_length as usize {
                let pad = self.flash_row_length as usize - self.row_accum.len();
                if self.programming {
                    self.data_queue.extend(std::iter::repeat(0u8).take(pad));
                }
                self.row_accum.resize(self.flash_row_length as usize, 0);
            }
            if let Some(addr) = self.row_addr.take() {
                self.address_queue.push_back(addr);
                self.chksum_queue.push_back(crc32c(&self.row_accum));
            }
            self.row_accum.clear();
        }
    }

    /// Read one Intel-HEX line, dispatching by record type: `0x00` data,
    /// `0x01` EOF, `0x04` extended linear address; other record types are
    /// skipped.
    fn read_record(&mut self) -> DfuResult<()> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| DfuError::FileReadError { path: "<mtbdfu dataFile>".into(), source: e })?;
        let line = line.trim_end();
        if n == 0 || !line.starts_with(':') || line.len() < 11 {
            self.eof_reached = true;
            self.flush_partial_row();
            return Ok(());
        }

        let byte_count = u8::from_str_radix(&line[1..3], 16).unwrap_or(0) as usize;
        let address = u16::from_str_radix(&line[3..7], 16).unwrap_or(0);
        let record_type = u8::from_str_radix(&line[7..9], 16).unwrap_or(0xFF);
        let available = (byte_count * 2).min(line.len().saturating_sub(9));
        let data_hex = &line[9..9 + available];

        match record_type {
            0x01 => {
                self.eof_reached = true;
                self.flush_partial_row();
            }
            0x04 => {
                let hi = u16::from_str_radix(data_hex, 16).unwrap_or(0);
                self.extended_addr = (hi as u32) << 16;
            }
            0x00 => {
                let full_addr = self.extended_addr | address as u32;
                let usable = byte_count.min(data_hex.len() / 2);
                let mut bytes = Vec::with_capacity(usable);
                for i in 0..usable {
                    let byte = u8::from_str_radix(&data_hex[i * 2..i * 2 + 2], 16).unwrap_or(0);
                    bytes.push(byte);
                }
                self.ingest(full_addr, &bytes);
            }
            _ => {}
        }
        Ok(())
    }

    fn ingest(&mut self, addr: u32, bytes: &[u8]) {
        if self.app_start != u32::MAX && addr < self.app_start {
            return;
        }
        if self.row_addr.is_none() {
            self.row_addr = Some(addr - (addr % self.flash_row_length));
        }
        self.row_accum.extend_from_slice(bytes);
        if self.programming {
            self.data_queue.extend(bytes.iter().copied());
        }
        while self.row_accum.len() >= self.flash_row_length as usize {
            let row: Vec<u8> = self.row_accum.drain(0..self.flash_row_length as usize).collect();
            if let Some(row_addr) = self.row_addr.take() {
                self.address_queue.push_back(row_addr);
                self.chksum_queue.push_back(crc32c(&row));
            }
        }
    }

    /// Read hex lines until at least `need` bytes are queued for sending,
    /// or EOF is hit.
    fn ensure_available(&mut self, need: usize) -> DfuResult<()> {
        while !self.eof_reached && self.data_queue.len() < need {
            self.read_record()?;
        }
        Ok(())
    }

    /// Pop up to `len` bytes for a generic (non-row) command such as
    /// `SendData`.
    pub fn take_chunk(&mut self, len: usize) -> DfuResult<Vec<u8>> {
        self.ensure_available(len)?;
        let n = len.min(self.data_queue.len());
        Ok(self.data_queue.drain(0..n).collect())
    }

    /// Pop the next completed row's `(address, crc32c)`, if one is ready.
    pub fn take_row_header(&mut self) -> DfuResult<Option<(u32, u32)>> {
        self.ensure_available(self.flash_row_length as usize)?;
        match (self.address_queue.pop_front(), self.chksum_queue.pop_front()) {
            (Some(addr), Some(crc)) => Ok(Some((addr, crc))),
            _ => Ok(None),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.eof_reached && self.data_queue.is_empty() && self.address_queue.is_empty()
    }
}

/// Run one `.mtbdfu` session (a `commands` array or one element of
/// `sessions`) over an already Entered channel.
pub struct Runner<'a, 'b> {
    transport: &'a mut ChunkingTransport<'b>,
    app_start: u32,
    app_size: u32,
}

impl<'a, 'b> Runner<'a, 'b> {
    pub fn new(transport: &'a mut ChunkingTransport<'b>, app_start: u32, app_size: u32) -> Self {
        Self { transport, app_start, app_size }
    }

    pub fn app_span(&self) -> (u32, u32) {
        (self.app_start, self.app_size)
    }

    /// Execute every top-level command in `commands`, reporting progress
    /// through `progress` as a fraction in `[0, 100]` per command-set
    /// iteration, and checking `should_abort` between iterations.
    pub fn run(&mut self, commands: &[Command], should_abort: &dyn Fn() -> bool, progress: &mut dyn FnMut(f64)) -> DfuResult<()> {
        for command in commands {
            if let Some(set) = &command.command_set {
                self.run_command_set(command, set, should_abort, progress)?;
            } else {
                self.run_single(command, should_abort)?;
                progress(100.0);
            }
        }
        Ok(())
    }

    fn run_command_set(
        &mut self,
        outer: &Command,
        set: &[Command],
        should_abort: &dyn Fn() -> bool,
        progress: &mut dyn FnMut(f64),
    ) -> DfuResult<()> {
        let flash_row_length = outer.flash_row_length.unwrap_or(DEFAULT_FLASH_ROW_LENGTH);
        let programming = set.iter().any(|c| matches!(c.cmd_id, CMD_PROGRAM_DATA | CMD_VERIFY_DATA));

        let mut hex_source = match &outer.data_file {
            Some(path) => Some(IntelHexSource::open(path, flash_row_length, self.app_start, programming)?),
            None => None,
        };

        let (outer_count, bound_to_eof) = match outer.repeat.unwrap_or(Repeat::Count(1)) {
            Repeat::Count(n) => (n, false),
            Repeat::Eof => (u32::MAX, true),
        };

        let mut iteration = 0u32;
        loop {
            if bound_to_eof {
                if let Some(src) = &hex_source {
                    if src.is_drained() {
                        break;
                    }
                }
            } else if iteration >= outer_count {
                break;
            }
            if should_abort() {
                return Err(DfuError::Aborted);
            }

            for inner in set {
                let inner_count = match inner.repeat.unwrap_or(Repeat::Count(1)) {
                    Repeat::Count(n) => n,
                    Repeat::Eof => 1,
                };
                for _ in 0..inner_count {
                    if should_abort() {
                        return Err(DfuError::Aborted);
                    }
                    if inner.cmd_id == CMD_ERASE_DATA {
                        if let Some(src) = hex_source.as_mut() {
                            if src.is_drained() {
                                continue;
                            }
                        }
                    }
                    self.dispatch(inner, hex_source.as_mut())?;
                }
            }

            iteration += 1;
            let pct = if bound_to_eof { 0.0 } else { (iteration as f64 / outer_count as f64) * 100.0 };
            progress(pct.min(100.0));

            if bound_to_eof {
                if let Some(src) = &hex_source {
                    if src.is_drained() {
                        break;
                    }
                }
            }
        }
        progress(100.0);
        Ok(())
    }

    fn run_single(&mut self, command: &Command, should_abort: &dyn Fn() -> bool) -> DfuResult<()> {
        let count = match command.repeat.unwrap_or(Repeat::Count(1)) {
            Repeat::Count(n) => n,
            Repeat::Eof => 1,
        };
        for _ in 0..count {
            if should_abort() {
                return Err(DfuError::Aborted);
            }
            self.dispatch(command, None)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, command: &Command, hex_source: Option<&mut IntelHexSource>) -> DfuResult<()> {
        let payload = if let Some(bytes) = &command.data_bytes {
            bytes.clone()
        } else if let Some(source) = hex_source {
            match command.cmd_id {
                CMD_PROGRAM_DATA | CMD_VERIFY_DATA => {
                    let (addr, crc) = source.take_row_header()?.unwrap_or((0, 0));
                    let header_total = command.data_length.unwrap_or(8) as usize;
                    let tail_len = header_total.saturating_sub(8);
                    let tail = source.take_chunk(tail_len)?;
                    let mut data = Vec::with_capacity(8 + tail.len());
                    data.extend_from_slice(&addr.to_le_bytes());
                    data.extend_from_slice(&crc.to_le_bytes());
                    data.extend_from_slice(&tail);
                    data
                }
                CMD_ERASE_DATA => {
                    let (addr, _) = source.take_row_header()?.unwrap_or((0, 0));
                    addr.to_le_bytes().to_vec()
                }
                _ => {
                    let len = command.data_length.unwrap_or(0) as usize;
                    source.take_chunk(len)?
                }
            }
        } else {
            Vec::new()
        };

        let expected_response_len = if command.cmd_id == CMD_PROGRAM_DATA
            || command.cmd_id == CMD_VERIFY_DATA
            || command.cmd_id == CMD_ERASE_DATA
            || command.cmd_id == CMD_SET_METADATA
        {
            0
        } else {
            0
        };

        let response = self.transport.exchange(Opcode::Custom(command.cmd_id), &payload, expected_response_len)?;

        if command.cmd_id == CMD_SET_METADATA && command.data_bytes.is_some() {
            let (app_start, app_size) = metadata_from_bytes(&payload)?;
            self.app_start = app_start;
            self.app_size = app_size;
        }

        if command.out_cli {
            log::info!(target: "dfuhost::image::mtbdfu", "cmd 0x{:02X} -> status 0x{:02X}", command.cmd_id, response.status);
        }
        if let Some(out_file) = &command.out_file {
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(out_file) {
                let _ = writeln!(f, "{:02X?}", response.data);
            }
        }
        Ok(())
    }
}

/// Build a `.mtbdfu` document authoring a single-row program/verify/erase
/// session bound to `data_file`, the way `generateMtbDfuJson` does: a
/// `SetApplicationMetadata` command (when an app id/length was given) and a
/// `repeat: "EoF"` commandSet over the hex file.
pub fn generate(
    file_version: u32,
    product_id: u32,
    checksum_type: u8,
    application_id: Option<u8>,
    application_start: u32,
    application_length: u32,
    data_file: &str,
    action: GenerateAction,
) -> Value {
    let mut commands = Vec::new();

    if application_id.is_some() || application_length != 0 {
        let app_id = application_id.unwrap_or(0);
        let mut data = vec![app_id];
        data.extend_from_slice(&application_start.to_le_bytes());
        data.extend_from_slice(&application_length.to_le_bytes());
        let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
        commands.push(serde_json::json!({
            "cmdId": "0x4C",
            "dataLength": "0x09",
            "dataBytes": format!("0x{hex}"),
        }));
    }

    let mut command_obj = serde_json::json!({
        "dataFile": data_file,
        "repeat": "EoF",
        "flashRowLength": "0x200",
    });

    match action {
        GenerateAction::Program | GenerateAction::Verify => {
            let action_cmd_id = if matches!(action, GenerateAction::Program) { "0x49" } else { "0x4A" };
            command_obj["commandSet"] = serde_json::json!([
                {"cmdId": "0x37", "dataLength": "0x10", "repeat": "0x20"},
                {"cmdId": action_cmd_id, "dataLength": "0x08"},
            ]);
        }
        GenerateAction::Erase => {
            command_obj["cmdId"] = serde_json::json!("0x44");
            command_obj["dataLength"] = serde_json::json!("0x04");
        }
    }
    commands.push(command_obj);

    serde_json::json!({
        "APPInfo": {
            "File Version": format!("0x{file_version:x}"),
            "Product Id": format!("{product_id:08x}"),
            "Packet Checksum Type": format!("0x{checksum_type:x}"),
        },
        "commands": commands,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateAction {
    Program,
    Verify,
    Erase,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = r#""APPInfo": {"File Version": "0x01", "Product Id": "01020304", "Packet Checksum Type": "0x00"}"#;

    #[test]
    fn header_requires_all_three_fields() {
        let doc = format!("{{{HEADER}, \"commands\": []}}");
        let parsed = parse_document(&doc).unwrap();
        assert_eq!(parsed.app_info.file_version, 1);
        assert_eq!(parsed.app_info.product_id, 0x0102_0304);
        assert_eq!(parsed.app_info.checksum_kind, ChecksumKind::Sum16);
    }

    #[test]
    fn missing_header_field_is_config_error() {
        let doc = r#"{"APPInfo": {"File Version": "0x01"}, "commands": []}"#;
        assert!(matches!(parse_document(doc), Err(DfuError::ConfigError { .. })));
    }

    #[test]
    fn sessions_array_is_parsed_into_multiple_command_lists() {
        let doc = format!(
            "{{{HEADER}, \"sessions\": [{{\"commands\": [{{\"cmdId\": \"0x38\"}}]}}, {{\"commands\": [{{\"cmdId\": \"0x3B\"}}]}}]}}"
        );
        let parsed = parse_document(&doc).unwrap();
        assert_eq!(parsed.sessions.len(), 2);
        assert_eq!(parsed.sessions[0][0].cmd_id, 0x38);
        assert_eq!(parsed.sessions[1][0].cmd_id, 0x3B);
    }

    #[test]
    fn data_bytes_zero_pads_to_declared_length() {
        let doc = format!(
            "{{{HEADER}, \"commands\": [{{\"cmdId\": \"0x4C\", \"dataLength\": \"0x04\", \"dataBytes\": \"0xAABB\"}}]}}"
        );
        let parsed = parse_document(&doc).unwrap();
        assert_eq!(parsed.sessions[0][0].data_bytes, Some(vec![0x00, 0x00, 0xAA, 0xBB]));
    }

    #[test]
    fn repeat_eof_is_distinguished_from_numeric() {
        assert_eq!(parse_repeat(&Value::String("EoF".into())).unwrap(), Repeat::Eof);
        assert_eq!(parse_repeat(&Value::String("0x20".into())).unwrap(), Repeat::Count(0x20));
    }

    #[test]
    fn metadata_from_bytes_extracts_start_and_size() {
        let mut data = vec![0x10u8];
        data.extend_from_slice(&0x0000_1000u32.to_le_bytes());
        data.extend_from_slice(&0x0000_0200u32.to_le_bytes());
        let (start, size) = metadata_from_bytes(&data).unwrap();
        assert_eq!(start, 0x1000);
        assert_eq!(size, 0x200);
    }

    #[test]
    fn generate_program_session_has_send_data_and_program_commandset() {
        let doc = generate(1, 0x0102_0304, 0, None, 0, 0, "fw.hex", GenerateAction::Program);
        let commands = doc["commands"].as_array().unwrap();
        let command_set = commands[0]["commandSet"].as_array().unwrap();
        assert_eq!(command_set[0]["cmdId"], "0x37");
        assert_eq!(command_set[1]["cmdId"], "0x49");
    }
}
