//! In-memory WAV encoding
//!
//! Standard 44-byte RIFF/WAVE header followed by 16-bit little-endian
//! interleaved PCM. One or two channels; a missing right channel produces a
//! mono file.

/// Encode f32 samples ([-1, 1], clamped) into a complete WAV container.
pub fn encode_wav(left: &[f32], right: Option<&[f32]>, sample_rate: u32) -> Vec<u8> {
    let num_channels: u16 = if right.is_some() { 2 } else { 1 };
    let frames = left.len();
    let bytes_per_sample: u16 = 2;
    let block_align = num_channels * bytes_per_sample;
    let data_size = (frames as u32) * block_align as u32;
    let byte_rate = sample_rate * block_align as u32;

    let mut out = Vec::with_capacity(44 + data_size as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&num_channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());

    for i in 0..frames {
        out.extend_from_slice(&to_i16(left[i]).to_le_bytes());
        if let Some(right) = right {
            let sample = right.get(i).copied().unwrap_or(left[i]);
            out.extend_from_slice(&to_i16(sample).to_le_bytes());
        }
    }
    out
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 0x8000 as f32) as i16
    } else {
        (clamped * 0x7fff as f32) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_canonical() {
        let data = encode_wav(&[0.0; 100], None, 44_100);
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"WAVE");
        assert_eq!(&data[12..16], b"fmt ");
        assert_eq!(u16::from_le_bytes([data[20], data[21]]), 1); // PCM
        assert_eq!(u16::from_le_bytes([data[22], data[23]]), 1); // mono
        assert_eq!(
            u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
            44_100
        );
        assert_eq!(&data[36..40], b"data");
        let data_size = u32::from_le_bytes([data[40], data[41], data[42], data[43]]);
        assert_eq!(data_size, 200);
        assert_eq!(data.len(), 44 + 200);
    }

    #[test]
    fn stereo_interleaves_and_doubles_rates() {
        let left = [0.5f32; 10];
        let right = [-0.5f32; 10];
        let data = encode_wav(&left, Some(&right), 48_000);
        assert_eq!(u16::from_le_bytes([data[22], data[23]]), 2);
        let byte_rate = u32::from_le_bytes([data[28], data[29], data[30], data[31]]);
        assert_eq!(byte_rate, 48_000 * 4);
        // First frame: positive left, negative right.
        let l = i16::from_le_bytes([data[44], data[45]]);
        let r = i16::from_le_bytes([data[46], data[47]]);
        assert!(l > 0 && r < 0);
        assert_eq!(l, (0.5 * 0x7fff as f32) as i16);
    }

    #[test]
    fn full_scale_clamps_to_i16_extremes() {
        let data = encode_wav(&[2.0, -2.0], None, 44_100);
        let first = i16::from_le_bytes([data[44], data[45]]);
        let second = i16::from_le_bytes([data[46], data[47]]);
        assert_eq!(first, i16::MAX);
        assert_eq!(second, i16::MIN);
    }
}
