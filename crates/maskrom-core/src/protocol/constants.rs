//! Protocol constants for the Rockchip maskrom USB boot agent.
//!
//! Values collected from the vendor's recovery tools and the rkbin
//! loader collateral.

// ============================================================================
// Device Identification
// ============================================================================

/// Rockchip Electronics Vendor ID
pub const ROCKCHIP_VENDOR_ID: u16 = 0x2207;

/// All vendor IDs a maskrom-mode device may enumerate with.
pub const MASKROM_VENDOR_IDS: &[u16] = &[0x2207, 0x071B, 0x0BB4];

/// Product ID -> device family, for maskrom-mode ROMs.
pub const MASKROM_PRODUCT_IDS: &[(u16, &str)] = &[
    (0x281A, "rk2818"),
    (0x290A, "rk2918"),
    (0x292A, "rk2928"),
    (0x292C, "rk3026"),
    (0x300A, "rk3066"),
    (0x300B, "rk3168"),
    (0x301A, "rk3036"),
    (0x310A, "rk3066b"),
    (0x310B, "rk3188"),
    (0x310C, "rk312x"),
    (0x310D, "rk3126"),
    (0x320A, "rk3288"),
    (0x320B, "rk322x"),
    (0x320C, "rk3328"),
    (0x330A, "rk3368"),
    (0x330C, "rk3399"),
    (0x350C, "rk3528"),
];

/// Look up the device family for a maskrom product ID.
pub fn device_family(pid: u16) -> Option<&'static str> {
    MASKROM_PRODUCT_IDS
        .iter()
        .find(|(id, _)| *id == pid)
        .map(|(_, name)| *name)
}

/// Chip-info tag (the 4 ASCII bytes, already byte-reversed) -> SoC name.
pub const SOC_TAGS: &[(&str, &str)] = &[
    ("RK27", "rk27"),
    ("273A", "cayman"),
    ("281X", "rk281x"),
    ("282B", "panda"),
    ("290X", "rk29"),
    ("292X", "rk292x"),
    ("300A", "rk30"),
    ("310A", "rk30b"),
    ("310B", "rk31"),
    ("320A", "rk32"),
    ("262C", "smart"),
    ("nano", "nano"),
    ("NORC", "crown"),
];

/// Look up the SoC name for a chip-info tag.
pub fn soc_name(tag: &str) -> Option<&'static str> {
    SOC_TAGS.iter().find(|(t, _)| *t == tag).map(|(_, n)| *n)
}

/// Flash manufacturer ID -> name, as reported by read_flash_info.
pub const FLASH_MANUFACTURERS: &[&str] = &[
    "samsung", "toshiba", "hynix", "infineon", "micron", "renesas", "st", "intel",
];

/// Look up a flash manufacturer name.
pub fn flash_manufacturer(id: u8) -> Option<&'static str> {
    FLASH_MANUFACTURERS.get(id as usize).copied()
}

// ============================================================================
// Transfer geometry
// ============================================================================

/// Storage block / LBA sector size in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Out-of-band bytes carried per sector by the raw sector commands.
pub const OOB_SIZE: usize = 16;

/// Hardware ceiling on LBA sectors per bulk request.
pub const USB_MAX_BLOCK_COUNT: u16 = 128;

/// Hardware ceiling on raw (sector + OOB) sectors per bulk request.
pub const USB_MAX_SECTOR_COUNT: u16 = 32;

/// Largest single bulk transfer: one full LBA window.
pub const USB_MAX_TRANSFER_SIZE: u32 = BLOCK_SIZE as u32 * USB_MAX_BLOCK_COUNT as u32;

/// Control-transfer chunk alignment for RAM loads. The ROM treats the first
/// chunk strictly smaller than this as end-of-transfer.
pub const USB_TRANSFER_ALIGN: usize = 4096;

// ============================================================================
// Firmware obfuscation
// ============================================================================

/// Published RC4 obfuscation key for boot images. Not a secret; the ROM
/// ships the same bytes.
pub const RC4_KEY: [u8; 16] = [
    124, 78, 3, 4, 85, 5, 9, 7, 45, 44, 123, 56, 23, 13, 23, 17,
];

/// Initial state of the CRC-16 appended to prepared boot images.
pub const CHECKSUM_SEED: u16 = 0xFFFF;

// ============================================================================
// Vendor control transfers (RAM load path)
// ============================================================================

/// bmRequestType: vendor, host-to-device.
pub const CONTROL_REQUEST_TYPE_VENDOR: u8 = 0x40;

/// bRequest for the RAM load operation.
pub const CONTROL_REQUEST_LOAD: u8 = 0x0C;

/// wIndex addressing the on-chip SRAM loader slot.
pub const CONTROL_INDEX_SRAM: u16 = 0x0471;

/// wIndex addressing the DRAM loader slot.
pub const CONTROL_INDEX_DRAM: u16 = 0x0472;

// ============================================================================
// Timeouts
// ============================================================================

/// Default per-transfer timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_lookup() {
        assert_eq!(device_family(0x330C), Some("rk3399"));
        assert_eq!(device_family(0x300A), Some("rk3066"));
        assert_eq!(device_family(0xFFFF), None);
    }

    #[test]
    fn manufacturer_lookup() {
        assert_eq!(flash_manufacturer(0), Some("samsung"));
        assert_eq!(flash_manufacturer(7), Some("intel"));
        assert_eq!(flash_manufacturer(8), None);
    }
}
