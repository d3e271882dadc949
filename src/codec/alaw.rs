//! ITU-T G.711 A-law

/// Largest magnitude representable before clipping
const CLIP: i32 = 32635;

/// Linear value for every A-law code
pub static DECODE_TABLE: [i16; 256] = build_decode_table();

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut code = 0;
    while code < 256 {
        table[code] = expand(code as u8);
        code += 1;
    }
    table
}

const fn expand(code: u8) -> i16 {
    let a = code ^ 0x55;
    let mut magnitude = ((a & 0x0F) as i32) << 4;
    let segment = ((a & 0x70) >> 4) as i32;
    if segment == 0 {
        magnitude += 8;
    } else {
        magnitude += 0x108;
        magnitude <<= segment - 1;
    }
    if a & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Compress one linear sample
pub fn encode_sample(pcm: i16) -> u8 {
    let (mask, magnitude) = if pcm >= 0 {
        (0xD5u8, pcm as i32)
    } else {
        (0x55u8, -(pcm as i32))
    };
    let magnitude = magnitude.min(CLIP);

    let code = if magnitude >= 256 {
        // Segment is the bit length of the high byte (1..=7)
        let exponent = 32 - ((magnitude >> 8) as u32).leading_zeros();
        let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
        ((exponent as i32) << 4) | mantissa
    } else {
        magnitude >> 4
    };

    (code as u8) ^ mask
}

#[inline]
pub fn decode_sample(code: u8) -> i16 {
    DECODE_TABLE[code as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_table_entries() {
        let expected: [(u8, i16); 8] = [
            (0x00, -5504),
            (0x01, -5248),
            (0x2A, -32256),
            (0x55, -8),
            (0x80, 5504),
            (0xAA, 32256),
            (0xD5, 8),
            (0xFF, 848),
        ];
        for (code, pcm) in expected {
            assert_eq!(decode_sample(code), pcm, "code {:#04x}", code);
        }
    }

    #[test]
    fn test_silence_code() {
        assert_eq!(encode_sample(0), 0xD5);
        assert_eq!(decode_sample(0xD5), 8);
    }

    #[test]
    fn test_table_is_antisymmetric() {
        for code in 0..128u8 {
            assert_eq!(decode_sample(code), -decode_sample(code | 0x80));
        }
    }

    #[test]
    fn test_round_trip_error_bound() {
        for x in -32635i32..=32635 {
            let pcm = x as i16;
            let back = decode_sample(encode_sample(pcm)) as i32;
            let err = (back - x).abs();
            assert!(err <= 512, "sample {} decoded to {} (error {})", x, back, err);
            if x.abs() < 256 {
                assert!(err <= 8, "small sample {} decoded to {}", x, back);
            }
        }
    }

    #[test]
    fn test_codes_are_stable_under_reencode() {
        for code in 0..=255u8 {
            assert_eq!(encode_sample(decode_sample(code)), code);
        }
    }

    #[test]
    fn test_clipping() {
        assert_eq!(encode_sample(i16::MAX), encode_sample(32635));
        assert_eq!(encode_sample(i16::MIN), encode_sample(-32635));
    }
}
