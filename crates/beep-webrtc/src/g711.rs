//! G.711 µ-law (PCMU) companding.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

/// Compresses one 16-bit linear sample into a µ-law byte.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    // Segment is the position of the top set bit above bit 7.
    let top_bit = 31 - (magnitude as u32).leading_zeros() as i32;
    let exponent = (top_bit - 7).clamp(0, 7);
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Expands a µ-law byte back to a 16-bit linear sample.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = i32::from((byte >> 4) & 0x07);
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes normalised samples; anything outside `[-1.0, 1.0]` is clipped.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .map(|sample| linear_to_ulaw((sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
        .collect()
}

pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .iter()
        .map(|byte| f32::from(ulaw_to_linear(*byte)) / 32_768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_maps_to_the_idle_code() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        // Negative zero.
        assert_eq!(ulaw_to_linear(0x7F), 0);
    }

    #[test]
    fn extremes_clip_to_the_last_segment() {
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
        assert_eq!(ulaw_to_linear(0x80), 32_124);
        assert_eq!(ulaw_to_linear(0x00), -32_124);
    }

    #[test]
    fn quantisation_error_stays_within_half_a_step() {
        for sample in (-CLIP..=CLIP).step_by(97) {
            let restored = i32::from(ulaw_to_linear(linear_to_ulaw(sample as i16)));
            let step = (sample.abs() + BIAS) / 16;
            assert!(
                (restored - sample).abs() <= step,
                "{sample} came back as {restored}"
            );
        }
    }

    #[test]
    fn encoding_is_monotonic() {
        let mut previous = ulaw_to_linear(linear_to_ulaw(-CLIP as i16));
        for sample in (-CLIP..=CLIP).step_by(31) {
            let restored = ulaw_to_linear(linear_to_ulaw(sample as i16));
            assert!(restored >= previous);
            previous = restored;
        }
    }

    #[test]
    fn beep_amplitude_survives_companding() {
        let decoded = decode(&encode(&[0.04, -0.04, 1.5]));
        assert!((decoded[0] - 0.04).abs() < 0.002);
        assert!((decoded[1] + 0.04).abs() < 0.002);
        assert!(decoded[2] > 0.97);
    }
}
