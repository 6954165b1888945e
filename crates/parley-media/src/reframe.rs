//! Mono to stereo reframing for 16-bit little-endian PCM.

use parley_core::error::{ParleyError, Result};

/// Duplicate each mono sample into both channels of an interleaved stereo buffer.
///
/// Input must be a whole number of 16-bit samples.
pub fn mono_to_stereo(mono: &[u8]) -> Result<Vec<u8>> {
    if mono.len() % 2 != 0 {
        return Err(ParleyError::MalformedAudio { len: mono.len() });
    }

    let mut stereo = Vec::with_capacity(mono.len() * 2);
    for sample in mono.chunks_exact(2) {
        stereo.extend_from_slice(sample);
        stereo.extend_from_slice(sample);
    }
    Ok(stereo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_four_samples_become_eight() {
        let input: Vec<u8> = [1i16, -2, 300, i16::MIN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(input.len(), 8);

        let output = mono_to_stereo(&input).unwrap();
        assert_eq!(output.len(), 16);

        let out = samples(&output);
        let inp = samples(&input);
        for (i, sample) in inp.iter().enumerate() {
            assert_eq!(out[2 * i], *sample);
            assert_eq!(out[2 * i + 1], *sample);
        }
    }

    #[test]
    fn test_odd_length_is_rejected() {
        let err = mono_to_stereo(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, ParleyError::MalformedAudio { len: 3 }));
    }

    #[test]
    fn test_empty_input() {
        assert!(mono_to_stereo(&[]).unwrap().is_empty());
    }
}
