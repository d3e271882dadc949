//! G.711 codecs over 16-bit little-endian PCM

pub mod alaw;
pub mod ulaw;

use serde::Deserialize;

/// Companding law used on the RTP leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// µ-law, RTP payload type 0
    Pcmu,
    /// A-law, RTP payload type 8
    #[default]
    Pcma,
}

impl Codec {
    pub const fn payload_type(self) -> u8 {
        match self {
            Codec::Pcmu => 0,
            Codec::Pcma => 8,
        }
    }

    /// RTP clock and PCM sample rate; both laws are narrowband
    pub const fn clock_rate(self) -> u32 {
        8000
    }

    /// Map a static RTP payload type to its codec
    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        match payload_type & 0x7F {
            0 => Some(Codec::Pcmu),
            8 => Some(Codec::Pcma),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Pcmu => "PCMU",
            Codec::Pcma => "PCMA",
        }
    }

    /// Code for digital silence
    pub fn silence_byte(self) -> u8 {
        self.encode_sample(0)
    }

    #[inline]
    pub fn encode_sample(self, pcm: i16) -> u8 {
        match self {
            Codec::Pcmu => ulaw::encode_sample(pcm),
            Codec::Pcma => alaw::encode_sample(pcm),
        }
    }

    #[inline]
    pub fn decode_sample(self, code: u8) -> i16 {
        match self {
            Codec::Pcmu => ulaw::decode_sample(code),
            Codec::Pcma => alaw::decode_sample(code),
        }
    }

    /// Encode little-endian PCM. A trailing odd byte is ignored.
    pub fn encode(self, pcm: &[u8]) -> Vec<u8> {
        pcm.chunks_exact(2)
            .map(|pair| self.encode_sample(i16::from_le_bytes([pair[0], pair[1]])))
            .collect()
    }

    /// Decode to little-endian PCM, two bytes per code
    pub fn decode(self, encoded: &[u8]) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(encoded.len() * 2);
        for &code in encoded {
            pcm.extend_from_slice(&self.decode_sample(code).to_le_bytes());
        }
        pcm
    }
}

/// Convert i16 PCM samples to little-endian bytes
pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Convert little-endian bytes to i16 PCM samples
pub fn u8_to_i16_slice(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
