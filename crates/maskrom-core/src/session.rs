//! Session - drives the three-stage command/data/status exchange.
//!
//! A session owns one opened transport and serializes requests over it: at
//! most one exchange is in flight, and each exchange is strictly
//! command -> optional data -> status. Transport failures abort only the
//! current exchange; the session stays usable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::batch::{Windows, windows};
use crate::protocol::command::Operation;
use crate::protocol::constants::{
    BLOCK_SIZE, DEFAULT_TIMEOUT_MS, USB_MAX_BLOCK_COUNT, USB_MAX_SECTOR_COUNT,
    USB_MAX_TRANSFER_SIZE,
};
use crate::protocol::frame::{
    Direction, ProtocolError, RESPONSE_SIZE, RequestFrame, ResponseFrame,
};
use crate::protocol::reply::Reply;
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The request exceeds a hardware batching ceiling. Rejected before
    /// any I/O.
    #[error("requested {requested} sectors, the per-request limit is {limit}")]
    LimitsExceeded { requested: u16, limit: u16 },

    #[error("payload is {actual} bytes but the request announced {expected}")]
    PayloadLength { expected: u32, actual: usize },

    /// The device reported a FAIL status inside a transfer that must
    /// produce data.
    #[error("device reported a failure status")]
    Failed,

    /// The device rejected the command inside a transfer that must
    /// produce data.
    #[error("device does not support this command")]
    Unsupported,
}

/// Session parameters, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Which enumerated maskrom device to open.
    pub device_index: usize,
    /// Per-transfer timeout in milliseconds.
    pub timeout_ms: u64,
    /// Whether RAM loads obfuscate the image with the ROM cipher.
    pub encrypt: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            encrypt: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Protocol session over one device handle.
pub struct Session<T: UsbTransport> {
    transport: T,
    timeout: Duration,
}

impl<T: UsbTransport> Session<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute one operation with no outbound payload.
    pub fn execute(&self, op: Operation) -> Result<Reply, SessionError> {
        self.run(op, None)
    }

    /// Execute one host-to-device operation carrying `payload` in its data
    /// stage.
    pub fn execute_write(&self, op: Operation, payload: &[u8]) -> Result<Reply, SessionError> {
        self.run(op, Some(payload))
    }

    fn run(&self, op: Operation, payload: Option<&[u8]>) -> Result<Reply, SessionError> {
        if let Some((requested, limit)) = op.over_sector_limit() {
            return Err(SessionError::LimitsExceeded { requested, limit });
        }
        let req = op.request();
        let provided = payload.map_or(0, |p| p.len());
        if req.direction == Direction::Out && provided != req.length as usize {
            return Err(SessionError::PayloadLength {
                expected: req.length,
                actual: provided,
            });
        }

        debug!(
            opcode = ?op.opcode(),
            tag = %format!("{:08X}", req.tag),
            data_len = req.length,
            "Issuing command"
        );
        if let Err(e) = self.transport.bulk_write(&req.to_bytes(), self.timeout) {
            // many opcodes are legitimately absent on older ROMs; the ROM
            // refuses the command frame itself
            if e.is_rejection() {
                debug!(opcode = ?op.opcode(), error = %e, "Command frame rejected");
                return Ok(Reply::Unsupported);
            }
            return Err(e.into());
        }

        match req.direction {
            Direction::In => self.finish_in(&op, &req),
            Direction::Out => self.finish_out(&req, payload),
        }
    }

    fn finish_in(&self, op: &Operation, req: &RequestFrame) -> Result<Reply, SessionError> {
        let mut data = Vec::new();
        if req.length > 0 {
            data = self.read_data(req.length as usize)?;

            // Firmware that cannot satisfy the command short-circuits the
            // exchange: either nothing resembling a data stage, or the
            // status frame itself in place of the data.
            if data.len() < req.length as usize && data.len() < RESPONSE_SIZE {
                debug!(got = data.len(), "Short data stage, exchange over");
                return Ok(Reply::Unsupported);
            }
            if data.len() >= RESPONSE_SIZE
                && let Ok(premature) = ResponseFrame::from_bytes(&data[..RESPONSE_SIZE])
                && premature.tag == req.tag
            {
                debug!("Premature status frame in data stage");
                return Ok(if premature.is_ok() {
                    Reply::Status(true)
                } else {
                    Reply::Unsupported
                });
            }
        }

        let status = self.read_status(req)?;
        if !status.is_ok() {
            return Ok(Reply::Status(false));
        }
        Ok(Reply::decode(op.reply_kind(), data)?)
    }

    fn finish_out(&self, req: &RequestFrame, payload: Option<&[u8]>) -> Result<Reply, SessionError> {
        if req.length > 0 {
            self.transport
                .bulk_write(payload.unwrap_or_default(), self.timeout)?;
        }
        let status = self.read_status(req)?;
        Ok(Reply::Status(status.is_ok()))
    }

    fn read_status(&self, req: &RequestFrame) -> Result<ResponseFrame, SessionError> {
        let buf = self.read_data(RESPONSE_SIZE)?;
        let resp = ResponseFrame::from_bytes(&buf)?;
        resp.expect_tag(req.tag)?;
        Ok(resp)
    }

    /// Bulk read with the one-time overflow retry: the device sometimes
    /// answers a narrow read with a full block.
    fn read_data(&self, len: usize) -> Result<Vec<u8>, SessionError> {
        match self.transport.bulk_read(len, self.timeout) {
            Err(TransportError::Overflow) => {
                warn!(requested = len, "Inbound overflow, retrying with one block");
                Ok(self.transport.bulk_read(BLOCK_SIZE, self.timeout)?)
            }
            other => Ok(other?),
        }
    }

    /// Windowed LBA read: `count` sectors from `sector`, issued as
    /// independent exchanges of at most 128 sectors each.
    pub fn read_lba(&self, sector: u32, count: u32, alt_method: bool) -> BatchedRead<'_, T> {
        BatchedRead {
            session: self,
            windows: windows(count as u64, USB_MAX_BLOCK_COUNT as u64, sector as u64),
            kind: BatchKind::Lba { alt_method },
        }
    }

    /// Windowed raw sector read (sector + OOB bytes), at most 32 sectors
    /// per exchange.
    pub fn read_sector(&self, sector: u32, count: u32) -> BatchedRead<'_, T> {
        BatchedRead {
            session: self,
            windows: windows(count as u64, USB_MAX_SECTOR_COUNT as u64, sector as u64),
            kind: BatchKind::Sector,
        }
    }

    /// Windowed RAM read, at most 64 KiB per exchange.
    pub fn read_sdram(&self, address: u32, size: u32) -> BatchedRead<'_, T> {
        BatchedRead {
            session: self,
            windows: windows(size as u64, USB_MAX_TRANSFER_SIZE as u64, address as u64),
            kind: BatchKind::Sdram,
        }
    }
}

enum BatchKind {
    Lba { alt_method: bool },
    Sector,
    Sdram,
}

/// Lazy sequence of windowed read exchanges. Each item is one window's
/// payload; an error aborts at the failing window, with all previously
/// yielded windows remaining valid.
pub struct BatchedRead<'a, T: UsbTransport> {
    session: &'a Session<T>,
    windows: Windows,
    kind: BatchKind,
}

impl<T: UsbTransport> BatchedRead<'_, T> {
    /// Drain all windows into one buffer.
    pub fn collect_all(self) -> Result<Vec<u8>, SessionError> {
        let mut out = Vec::new();
        for chunk in self {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl<T: UsbTransport> Iterator for BatchedRead<'_, T> {
    type Item = Result<Vec<u8>, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (offset, len) = self.windows.next()?;
        let op = match self.kind {
            BatchKind::Lba { alt_method } => Operation::ReadLba {
                sector: offset as u32,
                count: len as u16,
                alt_method,
            },
            BatchKind::Sector => Operation::ReadSector {
                sector: offset as u32,
                count: len as u16,
            },
            BatchKind::Sdram => Operation::ReadSdram {
                address: offset as u32,
                size: len as u32,
            },
        };
        Some(match self.session.execute(op) {
            Ok(Reply::Buffer(data)) => Ok(data),
            Ok(Reply::Status(false)) => Err(SessionError::Failed),
            Ok(_) => Err(SessionError::Unsupported),
            Err(e) => Err(e),
        })
    }
}
