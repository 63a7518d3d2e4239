//! PCM byte-order, volume and WAV header utilities.
//!
//! Pure functions with no I/O and no async runtime.

use thiserror::Error;

use crate::types::{PARAM_MAX, PARAM_MIN, SAMPLE_BYTES, SampleFormat};

/// Swap the two bytes of every 16-bit sample in place.
///
/// Returns the number of samples swapped. A trailing odd byte is left alone.
pub fn swap_bytes16(data: &mut [u8]) -> usize {
    let mut swapped = 0;
    for pair in data.chunks_exact_mut(SAMPLE_BYTES) {
        pair.swap(0, 1);
        swapped += 1;
    }
    swapped
}

/// Linear gain for a volume in [-100, 100].
///
/// `100` is unity, `0` half scale, `-100` silence. Values outside the range
/// are clamped here; range validation happens where the volume is set.
pub fn volume_gain(volume: i32) -> f32 {
    let v = volume.clamp(PARAM_MIN, PARAM_MAX);
    (v - PARAM_MIN) as f32 / (PARAM_MAX - PARAM_MIN) as f32
}

/// Scale 16-bit samples stored in `format` byte order by `volume`.
///
/// Unity volume leaves the buffer untouched.
pub fn apply_volume(data: &mut [u8], format: SampleFormat, volume: i32) {
    let gain = volume_gain(volume);
    if gain >= 1.0 {
        return;
    }
    for pair in data.chunks_exact_mut(SAMPLE_BYTES) {
        let s = match format {
            SampleFormat::Le => i16::from_le_bytes([pair[0], pair[1]]),
            SampleFormat::Be => i16::from_be_bytes([pair[0], pair[1]]),
        };
        let scaled = (f32::from(s) * gain).round() as i16;
        let bytes = match format {
            SampleFormat::Le => scaled.to_le_bytes(),
            SampleFormat::Be => scaled.to_be_bytes(),
        };
        pair.copy_from_slice(&bytes);
    }
}

/// Decode little-endian sample bytes from a byte stream.
///
/// `carry` is the odd byte left over from the previous call; the returned
/// byte, if any, must be passed to the next one.
pub fn le_bytes_to_i16(bytes: &[u8], carry: Option<u8>) -> (Vec<i16>, Option<u8>) {
    let mut samples = Vec::with_capacity((bytes.len() + 1) / SAMPLE_BYTES);
    let rest = match (carry, bytes.split_first()) {
        (Some(lo), Some((&hi, rest))) => {
            samples.push(i16::from_le_bytes([lo, hi]));
            rest
        }
        (Some(lo), None) => return (samples, Some(lo)),
        (None, _) => bytes,
    };
    let mut pairs = rest.chunks_exact(SAMPLE_BYTES);
    samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
    (samples, pairs.remainder().first().copied())
}

/// Size marker streaming writers leave in RIFF and data chunk headers.
const UNKNOWN_SIZE: u32 = u32::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WavError {
    #[error("not a RIFF/WAVE file")]
    NotWave,
    #[error("fmt chunk truncated")]
    ShortFmt,
    #[error("unsupported encoding {0} (only PCM)")]
    NotPcm(u16),
    #[error("data chunk before fmt chunk")]
    DataBeforeFmt,
    #[error("no data chunk")]
    NoData,
}

/// Format of a PCM WAV file and where its samples sit in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_offset: usize,
    /// Bytes of sample data, clipped to the buffer. Unknown sizes run to the
    /// end of the buffer.
    pub data_len: usize,
}

impl WavHeader {
    /// The sample bytes of `buf`, the buffer this header was parsed from.
    pub fn data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.data_offset..self.data_offset + self.data_len)
            .unwrap_or_default()
    }
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Walk the RIFF chunks of `buf` up to the first `data` chunk.
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, WavError> {
    if buf.len() < 12 || &buf[..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err(WavError::NotWave);
    }

    // (channels, rate, bits) once the fmt chunk has been seen.
    let mut format: Option<(u16, u32, u16)> = None;
    let mut pos = 12;
    while pos + 8 <= buf.len() {
        let id = &buf[pos..pos + 4];
        let size = u32_at(buf, pos + 4);
        let body = pos + 8;

        match id {
            b"fmt " => {
                if body + 16 > buf.len() {
                    return Err(WavError::ShortFmt);
                }
                let encoding = u16_at(buf, body);
                if encoding != 1 {
                    return Err(WavError::NotPcm(encoding));
                }
                format = Some((u16_at(buf, body + 2), u32_at(buf, body + 4), u16_at(buf, body + 14)));
            }
            b"data" => {
                let (channels, sample_rate, bits_per_sample) = format.ok_or(WavError::DataBeforeFmt)?;
                let available = buf.len() - body;
                let data_len = if size == UNKNOWN_SIZE {
                    available
                } else {
                    (size as usize).min(available)
                };
                return Ok(WavHeader {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: body,
                    data_len,
                });
            }
            _ => {}
        }

        // An unknown-size chunk other than data cannot be skipped reliably;
        // fmt bodies are 16 bytes in that case.
        let len = match (id, size) {
            (b"fmt ", UNKNOWN_SIZE) => 16,
            (_, UNKNOWN_SIZE) => 0,
            (_, n) => n as usize + (n as usize & 1),
        };
        pos = body + len;
    }

    Err(WavError::NoData)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mono 16-bit PCM WAV with `trailer` appended after the data chunk.
    fn wav_file(samples: &[i16], rate: u32, trailer: &[u8]) -> Vec<u8> {
        let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut fmt = Vec::new();
        fmt.extend_from_slice(&1u16.to_le_bytes());
        fmt.extend_from_slice(&1u16.to_le_bytes());
        fmt.extend_from_slice(&rate.to_le_bytes());
        fmt.extend_from_slice(&(rate * 2).to_le_bytes());
        fmt.extend_from_slice(&2u16.to_le_bytes());
        fmt.extend_from_slice(&16u16.to_le_bytes());

        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&((4 + 24 + 8 + data.len() + trailer.len()) as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        for (id, body) in [(b"fmt ", &fmt), (b"data", &data)] {
            out.extend_from_slice(id);
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(body);
        }
        out.extend_from_slice(trailer);
        out
    }

    #[test]
    fn swap_alternating_bytes() {
        let mut data = vec![0xAA, 0x55, 0xAA, 0x55, 0xAA, 0x55];
        assert_eq!(swap_bytes16(&mut data), 3);
        assert_eq!(data, vec![0x55, 0xAA, 0x55, 0xAA, 0x55, 0xAA]);
    }

    #[test]
    fn swap_leaves_trailing_byte() {
        let mut data = vec![1, 2, 3];
        assert_eq!(swap_bytes16(&mut data), 1);
        assert_eq!(data, vec![2, 1, 3]);
    }

    #[test]
    fn gain_endpoints() {
        assert_eq!(volume_gain(100), 1.0);
        assert_eq!(volume_gain(0), 0.5);
        assert_eq!(volume_gain(-100), 0.0);
        assert_eq!(volume_gain(500), 1.0);
    }

    #[test]
    fn unity_volume_is_untouched() {
        let mut data = vec![0x34, 0x12, 0xFF, 0x7F];
        apply_volume(&mut data, SampleFormat::Le, 100);
        assert_eq!(data, vec![0x34, 0x12, 0xFF, 0x7F]);
    }

    #[test]
    fn half_volume_scales_both_orders() {
        let mut le = 1000i16.to_le_bytes().to_vec();
        apply_volume(&mut le, SampleFormat::Le, 0);
        assert_eq!(i16::from_le_bytes([le[0], le[1]]), 500);

        let mut be = (-1000i16).to_be_bytes().to_vec();
        apply_volume(&mut be, SampleFormat::Be, 0);
        assert_eq!(i16::from_be_bytes([be[0], be[1]]), -500);
    }

    #[test]
    fn silence_at_minimum_volume() {
        let mut data = 12345i16.to_le_bytes().to_vec();
        apply_volume(&mut data, SampleFormat::Le, -100);
        assert_eq!(data, vec![0, 0]);
    }

    #[test]
    fn le_bytes_split_across_reads() {
        let (samples, carry) = le_bytes_to_i16(&[0x01, 0x00, 0xFF], None);
        assert_eq!(samples, vec![1]);
        assert_eq!(carry, Some(0xFF));

        let (samples, carry) = le_bytes_to_i16(&[], carry);
        assert!(samples.is_empty());
        assert_eq!(carry, Some(0xFF));

        let (samples, carry) = le_bytes_to_i16(&[0x7F, 0x02, 0x00], carry);
        assert_eq!(samples, vec![32767, 2]);
        assert_eq!(carry, None);
    }

    #[test]
    fn wav_header_of_plain_file() {
        let wav = wav_file(&[7i16; 50], 24000, &[]);
        let hdr = parse_wav_header(&wav).unwrap();
        assert_eq!((hdr.channels, hdr.sample_rate, hdr.bits_per_sample), (1, 24000, 16));
        assert_eq!(hdr.data_offset, 44);
        assert_eq!(hdr.data(&wav).len(), 100);
    }

    #[test]
    fn wav_trailing_chunks_are_not_data() {
        let wav = wav_file(&[7i16; 4], 16000, b"LIST\x04\x00\x00\x00abcd");
        let hdr = parse_wav_header(&wav).unwrap();
        assert_eq!(hdr.data(&wav), [7, 0, 7, 0, 7, 0, 7, 0]);
    }

    #[test]
    fn wav_streaming_sizes_run_to_end() {
        let mut wav = wav_file(&[0i16; 50], 22050, &[]);
        wav[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        wav[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        let hdr = parse_wav_header(&wav).unwrap();
        assert_eq!(hdr.sample_rate, 22050);
        assert_eq!(hdr.data_len, 100);
    }

    #[test]
    fn wav_rejects_non_pcm_and_garbage() {
        assert_eq!(parse_wav_header(b"RIFF"), Err(WavError::NotWave));
        let mut wav = wav_file(&[0i16; 10], 16000, &[]);
        wav[20..22].copy_from_slice(&3u16.to_le_bytes());
        assert_eq!(parse_wav_header(&wav), Err(WavError::NotPcm(3)));
        assert_eq!(parse_wav_header(&wav[..36]), Err(WavError::NoData));
    }
}
