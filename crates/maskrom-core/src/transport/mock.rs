//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};
use crate::protocol::frame::ResponseFrame;

/// Scripted result for one bulk read.
enum ReadScript {
    /// Return these bytes verbatim.
    Data(Vec<u8>),
    /// Synthesize a status frame echoing the tag of the last captured
    /// command frame, with this status byte.
    Status(u8),
    /// Like `Status`, but with a corrupted tag.
    StatusBadTag(u8),
    /// Fail the read with this error.
    Error(TransportError),
}

/// Mock transport for unit testing session logic.
///
/// Inbound bulk reads are served from a scripted queue (data, synthesized
/// status frames, or errors); outbound writes and control transfers are
/// captured for inspection. Request tags are random, so status scripts
/// echo the tag out of the most recent write.
pub struct MockTransport {
    read_queue: Arc<Mutex<VecDeque<ReadScript>>>,
    /// Captured bulk writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Captured vendor-load chunks as (index, data).
    control_log: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    /// Error to return on the next bulk write.
    fail_next_write: Arc<Mutex<Option<TransportError>>>,
    /// Control transfer ordinal to fail at, if any.
    fail_control_at: Arc<Mutex<Option<usize>>>,
    reads: Arc<Mutex<usize>>,
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            control_log: Arc::new(Mutex::new(Vec::new())),
            fail_next_write: Arc::new(Mutex::new(None)),
            fail_control_at: Arc::new(Mutex::new(None)),
            reads: Arc::new(Mutex::new(0)),
            vid: 0x2207,
            pid: 0x330C,
        }
    }

    /// Queue data to be returned on the next bulk read.
    pub fn queue_read(&self, data: &[u8]) {
        self.read_queue
            .lock()
            .unwrap()
            .push_back(ReadScript::Data(data.to_vec()));
    }

    /// Queue a status frame that echoes the outstanding request's tag.
    pub fn queue_status(&self, status: u8) {
        self.read_queue
            .lock()
            .unwrap()
            .push_back(ReadScript::Status(status));
    }

    /// Queue a status frame with a deliberately wrong tag.
    pub fn queue_status_bad_tag(&self, status: u8) {
        self.read_queue
            .lock()
            .unwrap()
            .push_back(ReadScript::StatusBadTag(status));
    }

    /// Queue an error to be returned on the next bulk read.
    pub fn queue_read_error(&self, err: TransportError) {
        self.read_queue
            .lock()
            .unwrap()
            .push_back(ReadScript::Error(err));
    }

    /// Make the next bulk write fail with `err`.
    pub fn fail_next_write(&self, err: TransportError) {
        *self.fail_next_write.lock().unwrap() = Some(err);
    }

    /// Make the `n`-th vendor-load transfer (0-based) fail.
    pub fn fail_control_at(&self, n: usize) {
        *self.fail_control_at.lock().unwrap() = Some(n);
    }

    /// Get all captured bulk writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Get all captured vendor-load chunks.
    pub fn control_transfers(&self) -> Vec<(u16, Vec<u8>)> {
        self.control_log.lock().unwrap().clone()
    }

    /// Number of bulk reads issued against this transport.
    pub fn read_count(&self) -> usize {
        *self.reads.lock().unwrap()
    }

    /// Number of scripted reads not yet consumed.
    pub fn pending_reads(&self) -> usize {
        self.read_queue.lock().unwrap().len()
    }

    /// Tag of the most recent captured command frame.
    ///
    /// An OUT transfer captures the 31-byte command frame followed by the
    /// data payload, so the most recent write is not necessarily the command
    /// frame. Scan backward for the last write that is command-frame sized.
    fn last_tag(&self) -> u32 {
        use crate::protocol::frame::REQUEST_SIZE;
        let log = self.write_log.lock().unwrap();
        let frame = log
            .iter()
            .rev()
            .find(|w| w.len() == REQUEST_SIZE)
            .expect("status script with no preceding command frame");
        u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]])
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn bulk_write(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if let Some(err) = self.fail_next_write.lock().unwrap().take() {
            return Err(err);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn bulk_read(&self, _len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        *self.reads.lock().unwrap() += 1;
        let script = self.read_queue.lock().unwrap().pop_front();
        match script {
            Some(ReadScript::Data(data)) => Ok(data),
            Some(ReadScript::Status(status)) => Ok(ResponseFrame {
                tag: self.last_tag(),
                residue: 0,
                status,
            }
            .to_bytes()),
            Some(ReadScript::StatusBadTag(status)) => Ok(ResponseFrame {
                tag: self.last_tag().wrapping_add(1),
                residue: 0,
                status,
            }
            .to_bytes()),
            Some(ReadScript::Error(err)) => Err(err),
            None => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn vendor_load(
        &self,
        index: u16,
        chunk: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut log = self.control_log.lock().unwrap();
        if let Some(n) = *self.fail_control_at.lock().unwrap()
            && log.len() == n
        {
            return Err(TransportError::ControlFailed("scripted failure".into()));
        }
        log.push((index, chunk.to_vec()));
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reads_drain_in_order() {
        let mock = MockTransport::new();
        mock.queue_read(b"first");
        mock.queue_read(b"second");

        assert_eq!(
            mock.bulk_read(64, Duration::from_millis(1)).unwrap(),
            b"first"
        );
        assert_eq!(
            mock.bulk_read(64, Duration::from_millis(1)).unwrap(),
            b"second"
        );
        assert!(matches!(
            mock.bulk_read(64, Duration::from_millis(1)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn write_capture() {
        let mock = MockTransport::new();
        mock.bulk_write(b"hello", Duration::from_millis(1)).unwrap();
        mock.bulk_write(b"world", Duration::from_millis(1)).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"hello");
        assert_eq!(writes[1], b"world");
    }

    #[test]
    fn scripted_write_failure_is_one_shot() {
        let mock = MockTransport::new();
        mock.fail_next_write(TransportError::Stall);
        assert!(matches!(
            mock.bulk_write(b"x", Duration::from_millis(1)),
            Err(TransportError::Stall)
        ));
        assert!(mock.bulk_write(b"x", Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn status_script_echoes_last_tag() {
        let mock = MockTransport::new();
        let mut frame = vec![0u8; 31];
        frame[4..8].copy_from_slice(&0xAABBCCDDu32.to_be_bytes());
        mock.bulk_write(&frame, Duration::from_millis(1)).unwrap();
        mock.queue_status(0);

        let resp = mock.bulk_read(13, Duration::from_millis(1)).unwrap();
        let parsed = ResponseFrame::from_bytes(&resp).unwrap();
        assert_eq!(parsed.tag, 0xAABBCCDD);
        assert!(parsed.is_ok());
    }
}
