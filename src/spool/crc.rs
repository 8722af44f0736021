//! # CRC-32 Implementation
//!
//! CRC-32 (IEEE 802.3) checksum used for spool segment headers and entry
//! frames.
//!
//! **Polynomial**: 0x04C11DB7, processed reflected as 0xEDB88320
//! **Initial Value**: 0xFFFFFFFF, final XOR 0xFFFFFFFF

/// Reflected CRC-32 polynomial
const CRC32_POLY: u32 = 0xEDB8_8320;

/// Precomputed lookup table
const CRC32_TABLE: [u32; 256] = generate_crc32_table();

/// Generate the CRC-32 lookup table at compile time
const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;

        while j < 8 {
            if (crc & 1) != 0 {
                crc = (crc >> 1) ^ CRC32_POLY;
            } else {
                crc >>= 1;
            }
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Calculate the CRC-32 of `data` using the lookup table
///
/// # Examples
///
/// ```
/// use gnss_spooler::spool::crc::crc32;
///
/// assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
/// ```
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;

    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }

    !crc
}

/// Bitwise CRC-32, used to check the table in tests
#[cfg(test)]
fn crc32_slow(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if (crc & 1) != 0 {
                crc = (crc >> 1) ^ CRC32_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}
