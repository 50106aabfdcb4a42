/// Factory calibration coefficients burned into the BME280 NVM

/// Length of the first calibration window (0x88..=0xA1)
pub const WINDOW_88_LEN: usize = 26;
/// Length of the second calibration window (0xE1..=0xE7)
pub const WINDOW_E1_LEN: usize = 7;

/// Trimming parameters read once at startup and never touched again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationProfile {
    pub dig_t1: u16,
    pub dig_t2: i16,
    pub dig_t3: i16,

    pub dig_p1: u16,
    pub dig_p2: i16,
    pub dig_p3: i16,
    pub dig_p4: i16,
    pub dig_p5: i16,
    pub dig_p6: i16,
    pub dig_p7: i16,
    pub dig_p8: i16,
    pub dig_p9: i16,

    pub dig_h1: u8,
    pub dig_h2: i16,
    pub dig_h3: u8,
    pub dig_h4: i16,
    pub dig_h5: i16,
    pub dig_h6: i8,
}

impl CalibrationProfile {
    /// Decode both register windows
    ///
    /// Window 0x88 holds little-endian 16-bit pairs for T1..T3 and P1..P9,
    /// one unused byte at 0xA0 and H1 at 0xA1. Window 0xE1 holds H2 (LE),
    /// H3, then H4/H5 packed into 0xE4..=0xE6 and finally H6:
    ///
    /// ```text
    /// dig_H4 = 0xE4[7:0] << 4 | 0xE5[3:0]
    /// dig_H5 = 0xE6[7:0] << 4 | 0xE5[7:4]
    /// ```
    ///
    /// The high byte of both 12-bit fields is sign carrying.
    pub fn decode(w88: &[u8; WINDOW_88_LEN], we1: &[u8; WINDOW_E1_LEN]) -> Self {
        let le_u16 = |at: usize| u16::from_le_bytes([w88[at], w88[at + 1]]);
        let le_i16 = |at: usize| i16::from_le_bytes([w88[at], w88[at + 1]]);

        let e4 = we1[3];
        let e5 = we1[4];
        let e6 = we1[5];

        CalibrationProfile {
            dig_t1: le_u16(0),
            dig_t2: le_i16(2),
            dig_t3: le_i16(4),

            dig_p1: le_u16(6),
            dig_p2: le_i16(8),
            dig_p3: le_i16(10),
            dig_p4: le_i16(12),
            dig_p5: le_i16(14),
            dig_p6: le_i16(16),
            dig_p7: le_i16(18),
            dig_p8: le_i16(20),
            dig_p9: le_i16(22),
            // 0xA0 is reserved
            dig_h1: w88[25],

            dig_h2: i16::from_le_bytes([we1[0], we1[1]]),
            dig_h3: we1[2],
            dig_h4: ((e4 as i8 as i16) << 4) | (e5 & 0x0F) as i16,
            dig_h5: ((e6 as i8 as i16) << 4) | (e5 >> 4) as i16,
            dig_h6: we1[6] as i8,
        }
    }

    /// Decode a contiguous 33-byte dump (window 0x88 followed by window 0xE1)
    #[cfg(test)]
    pub fn from_dump(dump: &[u8; WINDOW_88_LEN + WINDOW_E1_LEN]) -> Self {
        let mut w88 = [0u8; WINDOW_88_LEN];
        let mut we1 = [0u8; WINDOW_E1_LEN];
        w88.copy_from_slice(&dump[..WINDOW_88_LEN]);
        we1.copy_from_slice(&dump[WINDOW_88_LEN..]);
        Self::decode(&w88, &we1)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// BMP280 datasheet worked example (T/P) plus typical BME280 humidity trim
    pub const REFERENCE_DUMP: [u8; 33] = [
        0x70, 0x6B, // T1 = 27504
        0x43, 0x67, // T2 = 26435
        0x18, 0xFC, // T3 = -1000
        0x7D, 0x8E, // P1 = 36477
        0x43, 0xD6, // P2 = -10685
        0xD0, 0x0B, // P3 = 3024
        0x27, 0x0B, // P4 = 2855
        0x8C, 0x00, // P5 = 140
        0xF9, 0xFF, // P6 = -7
        0x8C, 0x3C, // P7 = 15500
        0xF8, 0xC6, // P8 = -14600
        0x70, 0x17, // P9 = 6000
        0x00, // reserved
        0x4B, // H1 = 75
        0x6A, 0x01, // H2 = 362
        0x00, // H3 = 0
        0x14, 0x24, 0x03, // H4 = 324, H5 = 50
        0x1E, // H6 = 30
    ];

    pub fn reference_profile() -> CalibrationProfile {
        CalibrationProfile::from_dump(&REFERENCE_DUMP)
    }

    #[test]
    fn reference_dump_decodes_bit_for_bit() {
        let cal = reference_profile();
        assert_eq!(
            cal,
            CalibrationProfile {
                dig_t1: 27504,
                dig_t2: 26435,
                dig_t3: -1000,
                dig_p1: 36477,
                dig_p2: -10685,
                dig_p3: 3024,
                dig_p4: 2855,
                dig_p5: 140,
                dig_p6: -7,
                dig_p7: 15500,
                dig_p8: -14600,
                dig_p9: 6000,
                dig_h1: 75,
                dig_h2: 362,
                dig_h3: 0,
                dig_h4: 324,
                dig_h5: 50,
                dig_h6: 30,
            }
        );
    }

    #[test]
    fn humidity_nibbles_interleave_instead_of_concatenating() {
        let mut dump = REFERENCE_DUMP;
        // E4=0xAB, E5=0xCD, E6=0x0E
        dump[29] = 0xAB;
        dump[30] = 0xCD;
        dump[31] = 0x0E;
        let cal = CalibrationProfile::from_dump(&dump);

        // H4 = AB:D, H5 = 0E:C (12-bit, sign from the high byte)
        assert_eq!(cal.dig_h4, ((0xABu8 as i8 as i16) << 4) | 0x0D);
        assert_eq!(cal.dig_h5, 0x0EC);
    }

    #[test]
    fn negative_humidity_coefficients_keep_their_sign() {
        let mut dump = REFERENCE_DUMP;
        dump[29] = 0xFF;
        dump[30] = 0xFF;
        dump[31] = 0xFF;
        dump[32] = 0xF6;
        let cal = CalibrationProfile::from_dump(&dump);

        assert_eq!(cal.dig_h4, -1);
        assert_eq!(cal.dig_h5, -1);
        assert_eq!(cal.dig_h6, -10);
    }
}
