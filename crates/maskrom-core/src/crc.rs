//! CRC-16 used to seal prepared boot images.
//!
//! The ROM validates loads with CRC-16/IBM-3740 (poly 0x1021, initial
//! state 0xFFFF, no reflection), appended big-endian after the payload.

use crc::{CRC_16_IBM_3740, Crc};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum `data` from the algorithm's fixed initial state.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::CHECKSUM_SEED;

    #[test]
    fn empty_input_is_identity_on_seed() {
        assert_eq!(crc16(&[]), CHECKSUM_SEED);
    }

    #[test]
    fn standard_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }
}
