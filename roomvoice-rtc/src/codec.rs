//! G.711 µ-law (PCMU)

use bytes::Bytes;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

#[must_use]
pub fn encode_sample(sample: i16) -> u8 {
    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while magnitude & mask == 0 && exponent > 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

#[must_use]
pub fn decode_sample(code: u8) -> i16 {
    let code = !code;
    let exponent = i32::from((code >> 4) & 0x07);
    let mantissa = i32::from(code & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if code & 0x80 == 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Encode float PCM in [-1, 1] into a PCMU payload
#[must_use]
pub fn encode_frame(samples: &[f32]) -> Bytes {
    samples
        .iter()
        .map(|s| encode_sample((s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
        .collect::<Vec<u8>>()
        .into()
}

/// Decode a PCMU payload into float PCM
#[must_use]
pub fn decode_frame(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|&code| f32::from(decode_sample(code)) / 32_768.0)
        .collect()
}
