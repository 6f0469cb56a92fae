//! Disk geometry and sector addressing.
//!
//! A PMD32 image is a fixed 360K P32 file: 40 tracks per side, 80 total,
//! 36 logical sectors of 128 bytes per track. One legacy opcode groups four
//! logical sectors into a 512-byte physical sector.
//!
//! The host addresses a transfer with a combined drive/sector byte followed
//! by a track byte. The top two bits of the first byte select the drive;
//! raw values 1 and 2 are swapped relative to their face value because bit 6
//! was originally reserved as zero. The remaining bits select the sector:
//! six bits for 128-byte transfers, bits 2-5 for 512-byte ones.

/// Logical sector size in bytes.
pub const SECTOR_SIZE: usize = 128;
/// Physical sector size in bytes (four logical sectors).
pub const PHYS_SECTOR_SIZE: usize = 512;
/// Logical sectors per track.
pub const SECTORS_PER_TRACK: usize = 36;
/// Track size in bytes.
pub const TRACK_SIZE: usize = SECTORS_PER_TRACK * SECTOR_SIZE;
/// Tracks per image, both sides (40 per side).
pub const TRACK_COUNT: usize = 80;
/// Total image size in bytes: 80 x 36 x 128.
pub const IMAGE_SIZE: u64 = (TRACK_COUNT * TRACK_SIZE) as u64;
/// Fill byte of a freshly formatted track.
pub const FORMAT_FILL: u8 = 0xE5;
/// Number of virtual drives, A to D.
pub const DRIVE_COUNT: usize = 4;
/// Image file extension recognized on the storage side.
pub const IMAGE_EXT: &str = ".p32";

/// Decoded target of one block-I/O transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskAddress {
    /// Drive index, 0 to 3.
    pub drive: u8,
    /// Logical sector within the track.
    pub sector: u8,
    /// Track index, counted across both sides.
    pub track: u8,
}

impl DiskAddress {
    /// The boot sector: drive A, track 0, sector 0.
    pub const BOOT: DiskAddress = DiskAddress {
        drive: 0,
        sector: 0,
        track: 0,
    };

    /// Decode the combined drive/sector selector plus a track byte.
    ///
    /// `byte_count` is the transfer size; 128-byte transfers carry a six-bit
    /// sector field, everything else masks out the two low bits.
    pub fn decode(selector: u8, track: u8, byte_count: usize) -> DiskAddress {
        DiskAddress {
            drive: decode_drive(selector),
            sector: if byte_count == SECTOR_SIZE {
                selector & 0x3F
            } else {
                selector & 0x3C
            },
            track,
        }
    }

    /// Byte offset of this address within the image file.
    ///
    /// A format targets the whole track, so the sector does not contribute.
    pub fn byte_offset(&self, format: bool) -> u64 {
        let mut offset = self.track as u64 * TRACK_SIZE as u64;
        if !format {
            offset += self.sector as u64 * SECTOR_SIZE as u64;
        }
        offset
    }
}

/// Drive index from the two selector MSBs, with the 1/2 swap of the
/// original hardware.
fn decode_drive(selector: u8) -> u8 {
    let drive = selector >> 6;
    if drive == 1 || drive == 2 {
        drive ^ 3
    } else {
        drive
    }
}

/// True if `name` ends with the image extension, ignoring case.
pub fn has_image_ext(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= IMAGE_EXT.len()
        && bytes[bytes.len() - IMAGE_EXT.len()..].eq_ignore_ascii_case(IMAGE_EXT.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_remap_bijective() {
        assert_eq!(decode_drive(0x00), 0);
        assert_eq!(decode_drive(0x40), 2);
        assert_eq!(decode_drive(0x80), 1);
        assert_eq!(decode_drive(0xC0), 3);
    }

    #[test]
    fn test_sector_field_width() {
        // 128-byte transfers keep all six sector bits
        let addr = DiskAddress::decode(0x3F, 0, SECTOR_SIZE);
        assert_eq!(addr.sector, 0x3F);
        // 512-byte transfers drop the low two bits
        let addr = DiskAddress::decode(0x3F, 0, PHYS_SECTOR_SIZE);
        assert_eq!(addr.sector, 0x3C);
        // format (byte count 0) uses the narrow field too
        let addr = DiskAddress::decode(0x07, 0, 0);
        assert_eq!(addr.sector, 0x04);
    }

    #[test]
    fn test_byte_offset() {
        let addr = DiskAddress {
            drive: 0,
            sector: 2,
            track: 3,
        };
        assert_eq!(addr.byte_offset(false), 3 * 4608 + 2 * 128);
        // formatting addresses the track start regardless of sector
        assert_eq!(addr.byte_offset(true), 3 * 4608);
    }

    #[test]
    fn test_last_sector_within_image() {
        let addr = DiskAddress {
            drive: 0,
            sector: (SECTORS_PER_TRACK - 1) as u8,
            track: (TRACK_COUNT - 1) as u8,
        };
        assert_eq!(addr.byte_offset(false) + SECTOR_SIZE as u64, IMAGE_SIZE);
    }

    #[test]
    fn test_image_size() {
        assert_eq!(IMAGE_SIZE, 368_640);
        assert_eq!(TRACK_SIZE, 4608);
    }

    #[test]
    fn test_has_image_ext() {
        assert!(has_image_ext("game.p32"));
        assert!(has_image_ext("GAME.P32"));
        assert!(!has_image_ext("game.p32.bak"));
        assert!(!has_image_ext("p32"));
        assert!(!has_image_ext("readme.txt"));
    }
}
