//! PCM16 frame codec
//!
//! Pure, stateless conversions between float samples, little-endian PCM16
//! bytes, and the text-safe base64 form the transport requires for audio
//! payloads.
//!
//! Round-trip law: `decode_pcm16(encode_pcm16(x))` reproduces `x` within one
//! quantization step (1/32768) per sample.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::SessionError;

/// Scale factor between float samples in [-1, 1] and i16 sample values
const PCM16_SCALE: f32 = 32768.0;

/// Encode float samples as little-endian PCM16 bytes.
///
/// Samples are scaled by 32768 and truncated toward zero. Out-of-range input
/// (noisy capture hardware can exceed [-1, 1]) is clamped to the i16 range
/// rather than allowed to wrap; wrapping would turn clipped input into
/// full-scale clicks.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32);
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes into float samples in [-1, 1).
///
/// Odd-length input is rejected: a truncated chunk is not recoverable and
/// silently dropping the trailing byte would desynchronize every later frame
/// boundary diagnostic.
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, SessionError> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Decode(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM16_SCALE)
        .collect())
}

/// Encode raw bytes as the text-safe form required for transport payloads.
pub fn to_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a transport text payload back into raw bytes.
pub fn from_transport_text(text: &str) -> Result<Vec<u8>, SessionError> {
    STANDARD
        .decode(text)
        .map_err(|e| SessionError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_values() {
        let bytes = encode_pcm16(&[0.0, 0.5, -0.5]);
        assert_eq!(bytes.len(), 6);

        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 16384);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -16384);
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let bytes = encode_pcm16(&[2.0, -2.0, 1.0]);

        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MIN);
        // Exactly 1.0 scales to 32768, clamped to 32767
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), i16::MAX);
    }

    #[test]
    fn test_decode_little_endian() {
        // 0x1234 -> [0x34, 0x12]
        let samples = decode_pcm16(&[0x34, 0x12]).unwrap();
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - 0x1234 as f32 / 32768.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_decode_odd_length_rejected() {
        let result = decode_pcm16(&[0x00, 0x01, 0x02]);
        assert!(matches!(result, Err(SessionError::Decode(_))));
    }

    #[test]
    fn test_round_trip_within_one_quantization_step() {
        let samples: Vec<f32> = (0..2048)
            .map(|i| ((i as f32) * 0.013).sin() * 0.97)
            .chain([-1.0, -0.5, 0.0, 0.5, 0.999969])
            .collect();

        let decoded = decode_pcm16(&encode_pcm16(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());

        for (original, round_tripped) in samples.iter().zip(decoded.iter()) {
            assert!(
                (original - round_tripped).abs() <= 1.0 / 32768.0,
                "sample {} round-tripped to {}",
                original,
                round_tripped
            );
        }
    }

    #[test]
    fn test_transport_text_round_trip() {
        let bytes = vec![0x34, 0x12, 0x78, 0x56];
        let text = to_transport_text(&bytes);
        assert_eq!(from_transport_text(&text).unwrap(), bytes);
    }

    #[test]
    fn test_transport_text_invalid_input() {
        let result = from_transport_text("not base64!!!");
        assert!(matches!(result, Err(SessionError::Decode(_))));
    }
}
