//! Boot-image loading into on-chip RAM.
//!
//! Maskrom RAM loads bypass the bulk command protocol entirely: the image
//! is pushed through vendor control transfers in 4096-byte chunks, with no
//! per-chunk handshake. The ROM treats the first chunk strictly shorter
//! than 4096 bytes as end-of-transfer.

use std::time::Duration;

use tracing::{debug, info};

use crate::crc::crc16;
use crate::protocol::constants::{
    CONTROL_INDEX_DRAM, CONTROL_INDEX_SRAM, RC4_KEY, USB_TRANSFER_ALIGN,
};
use crate::rc4::Rc4;
use crate::transport::{TransportError, UsbTransport};

/// Which loader slot a boot image is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamTarget {
    /// First-stage slot (DDR init blobs).
    Sram,
    /// Second-stage slot (usbplug and friends).
    Dram,
}

impl RamTarget {
    /// wIndex of the vendor load request for this slot.
    pub fn index(self) -> u16 {
        match self {
            RamTarget::Sram => CONTROL_INDEX_SRAM,
            RamTarget::Dram => CONTROL_INDEX_DRAM,
        }
    }
}

/// Prepare a boot image for delivery: pad, optionally obfuscate, and seal
/// with the checksum.
///
/// If image plus checksum would land exactly on the chunk alignment, two
/// zero bytes are appended first; an exact-multiple-sized transfer would
/// never terminate the load.
pub fn prepare_image(image: &[u8], encrypt: bool) -> Vec<u8> {
    let mut buf = image.to_vec();
    if (buf.len() + 2) % USB_TRANSFER_ALIGN == 0 {
        buf.extend_from_slice(&[0, 0]);
    }
    if encrypt {
        Rc4::new(&RC4_KEY).crypt(&mut buf);
    }
    let crc = crc16(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf
}

/// Stream a prepared boot image into the target RAM slot.
///
/// Delivery is fire-and-forget per chunk; the first transport error aborts
/// the load and leaves the target memory state undefined. A retry must
/// restart from the beginning.
pub fn load_to_ram<T: UsbTransport>(
    transport: &T,
    target: RamTarget,
    image: &[u8],
    encrypt: bool,
    timeout: Duration,
) -> Result<(), TransportError> {
    let prepared = prepare_image(image, encrypt);
    info!(
        target = ?target,
        image_len = image.len(),
        prepared_len = prepared.len(),
        "Loading boot image"
    );
    for (n, chunk) in prepared.chunks(USB_TRANSFER_ALIGN).enumerate() {
        transport.vendor_load(target.index(), chunk, timeout)?;
        debug!(chunk = n, len = chunk.len(), "Chunk delivered");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn pads_only_on_alignment_boundary() {
        // (4094 + 2) % 4096 == 0: two zero bytes appended
        let image = vec![0xAAu8; 4094];
        let prepared = prepare_image(&image, false);
        assert_eq!(prepared.len(), 4094 + 2 + 2);
        assert_eq!(&prepared[4094..4096], &[0, 0]);

        // any other length is left alone
        let image = vec![0xAAu8; 4000];
        let prepared = prepare_image(&image, false);
        assert_eq!(prepared.len(), 4000 + 2);
        assert_eq!(&prepared[..4000], &image[..]);
    }

    #[test]
    fn checksum_seals_the_buffer() {
        let image = b"loader".to_vec();
        let prepared = prepare_image(&image, false);
        let (body, tail) = prepared.split_at(prepared.len() - 2);
        assert_eq!(tail, crc16(body).to_be_bytes());
    }

    #[test]
    fn obfuscation_is_recoverable() {
        let image: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let prepared = prepare_image(&image, true);
        let mut body = prepared[..prepared.len() - 2].to_vec();
        Rc4::new(&RC4_KEY).crypt(&mut body);
        assert_eq!(body, image);
    }

    #[test]
    fn chunked_delivery_terminates_short() {
        let mock = MockTransport::new();
        let image = vec![0x5Au8; 10000];
        load_to_ram(&mock, RamTarget::Sram, &image, true, Duration::from_millis(50)).unwrap();

        let chunks = mock.control_transfers();
        // 10002 bytes -> 4096 + 4096 + 1810
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|(index, _)| *index == CONTROL_INDEX_SRAM));
        assert_eq!(chunks[0].1.len(), 4096);
        assert_eq!(chunks[1].1.len(), 4096);
        assert!(chunks[2].1.len() < 4096);
    }

    #[test]
    fn dram_target_uses_its_slot() {
        let mock = MockTransport::new();
        load_to_ram(&mock, RamTarget::Dram, b"blob", false, Duration::from_millis(50)).unwrap();
        assert_eq!(mock.control_transfers()[0].0, CONTROL_INDEX_DRAM);
    }

    #[test]
    fn aborts_on_first_failed_chunk() {
        let mock = MockTransport::new();
        mock.fail_control_at(1);
        let image = vec![0u8; 10000];
        let err = load_to_ram(&mock, RamTarget::Sram, &image, false, Duration::from_millis(50));
        assert!(matches!(err, Err(TransportError::ControlFailed(_))));
        assert_eq!(mock.control_transfers().len(), 1);
    }
}
