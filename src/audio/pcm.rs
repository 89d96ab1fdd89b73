//! PCM16 wire codec
//!
//! The live channel carries little-endian signed 16-bit mono PCM wrapped in
//! base64. Outbound audio is 16kHz, inbound audio is 24kHz; this module only
//! converts representations and never resamples.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::SessionError;

/// Sample rate of audio sent to the remote agent
pub const OUTBOUND_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio received from the remote agent
pub const INBOUND_SAMPLE_RATE: u32 = 24_000;

/// MIME descriptor attached to every outbound chunk
pub const OUTBOUND_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Width of one PCM16 sample in bytes
const SAMPLE_WIDTH: usize = std::mem::size_of::<i16>();

/// Convert one float sample to PCM16, clamping out-of-range input.
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clamped * i16::MAX as f32).round() as i16
}

/// Convert one PCM16 sample back to float in [-1, 1].
pub fn i16_to_f32(sample: i16) -> f32 {
    (sample as f32 / i16::MAX as f32).max(-1.0)
}

/// Serialize samples as little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// Reassemble little-endian bytes into samples
///
/// Fails when the byte count is not a whole number of samples.
pub fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, SessionError> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(SessionError::Decode(format!(
            "payload of {} bytes is not a multiple of {}",
            bytes.len(),
            SAMPLE_WIDTH
        )));
    }

    Ok(bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode float capture samples into the opaque outbound payload
pub fn encode_outbound(samples: &[f32]) -> String {
    let pcm: Vec<i16> = samples.iter().map(|&s| f32_to_i16(s)).collect();
    STANDARD.encode(samples_to_bytes(&pcm))
}

/// Decode an opaque inbound payload into PCM16 samples
pub fn decode_inbound(payload: &str) -> Result<Vec<i16>, SessionError> {
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| SessionError::Decode(format!("invalid base64: {}", e)))?;
    bytes_to_samples(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_i16_bounds() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);

        // Out-of-range input must not wrap around
        assert_eq!(f32_to_i16(3.5), i16::MAX);
        assert_eq!(f32_to_i16(-7.0), -i16::MAX);
        assert_eq!(f32_to_i16(f32::NAN), 0);
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = samples_to_bytes(&[0x1234, 0x5678]);
        assert_eq!(bytes, vec![0x34, 0x12, 0x78, 0x56]);
        assert_eq!(bytes_to_samples(&bytes).unwrap(), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_odd_length_payload_is_decode_error() {
        let result = bytes_to_samples(&[1, 2, 3]);
        assert!(matches!(result, Err(SessionError::Decode(_))));

        let payload = STANDARD.encode([0u8, 1, 2]);
        assert!(matches!(
            decode_inbound(&payload),
            Err(SessionError::Decode(_))
        ));
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        assert!(matches!(
            decode_inbound("not base64!!"),
            Err(SessionError::Decode(_))
        ));
    }

    #[test]
    fn test_round_trip_within_quantization() {
        let input: Vec<f32> = (0..200)
            .map(|i| ((i as f32) * 0.07).sin() * 0.9)
            .collect();

        let decoded = decode_inbound(&encode_outbound(&input)).unwrap();
        assert_eq!(decoded.len(), input.len());

        let tolerance = 1.0 / i16::MAX as f32;
        for (original, sample) in input.iter().zip(decoded.iter()) {
            let restored = i16_to_f32(*sample);
            assert!(
                (original - restored).abs() <= tolerance,
                "{} restored as {}",
                original,
                restored
            );
        }

        // A second pass is stable
        let restored: Vec<f32> = decoded.iter().map(|&s| i16_to_f32(s)).collect();
        let again = decode_inbound(&encode_outbound(&restored)).unwrap();
        assert_eq!(again, decoded);
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(encode_outbound(&[]), "");
        assert!(decode_inbound("").unwrap().is_empty());
    }
}
