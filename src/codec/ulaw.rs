//! ITU-T G.711 µ-law

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Linear value for every µ-law code
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
    let u = !code;
    let mut t = (((u & 0x0F) as i32) << 3) + BIAS;
    t <<= ((u & 0x70) >> 4) as i32;
    if u & 0x80 != 0 {
        (BIAS - t) as i16
    } else {
        (t - BIAS) as i16
    }
}

/// Segment of a biased magnitude: position of the highest set bit above bit 7
fn exponent(biased: i32) -> i32 {
    let high = ((biased >> 7) & 0xFF) as u32;
    if high < 2 {
        0
    } else {
        (31 - high.leading_zeros()) as i32
    }
}

/// Compress one linear sample
pub fn encode_sample(pcm: i16) -> u8 {
    let mut magnitude = pcm as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    let biased = magnitude.min(CLIP) + BIAS;

    let exponent = exponent(biased);
    let mantissa = (biased >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

#[inline]
pub fn decode_sample(code: u8) -> i16 {
    DECODE_TABLE[code as usize]
}
