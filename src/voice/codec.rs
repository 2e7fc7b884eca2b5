//! Audio codec helpers: float samples → PCM16, WAV container, base64 transport text.
//!
//! All functions are pure. The only failure mode is malformed input
//! (empty buffers, odd-length PCM, zero sample rates, invalid base64).

use base64::Engine;

use crate::error::{Error, Result};

/// Size of the canonical RIFF/WAVE header for mono 16-bit PCM.
pub const WAV_HEADER_LEN: usize = 44;

// ── PCM16 ──────────────────────────────────────────────────────────

/// Number of output samples produced when resampling `len` input samples.
pub fn resampled_len(len: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == target_rate {
        return len;
    }
    ((len as u64 * u64::from(target_rate)) / u64::from(source_rate)) as usize
}

/// Convert a single float sample to a signed 16-bit value.
///
/// Negative samples scale by 32768 and positive ones by 32767 so that both
/// -1.0 and 1.0 map onto the full i16 range.
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    scaled.round() as i16
}

/// Resample float samples by index ratio and encode them as little-endian PCM16.
pub fn float_to_pcm16(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<u8>> {
    if samples.is_empty() {
        return Err(Error::Codec("no samples to encode".into()));
    }
    if source_rate == 0 || target_rate == 0 {
        return Err(Error::Codec("sample rate must be non-zero".into()));
    }

    let ratio = f64::from(source_rate) / f64::from(target_rate);
    let out_len = resampled_len(samples.len(), source_rate, target_rate);
    let mut pcm = Vec::with_capacity(out_len * 2);

    for i in 0..out_len {
        let src = ((i as f64 * ratio) as usize).min(samples.len() - 1);
        pcm.extend_from_slice(&sample_to_i16(samples[src]).to_le_bytes());
    }

    Ok(pcm)
}

// ── WAV ────────────────────────────────────────────────────────────

/// Wrap little-endian PCM16 bytes in a 44-byte WAV header (mono, 16-bit).
pub fn wrap_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    if pcm.is_empty() {
        return Err(Error::Codec("no PCM data to wrap".into()));
    }
    if pcm.len() % 2 != 0 {
        return Err(Error::Codec(format!(
            "PCM16 payload has odd length {}",
            pcm.len()
        )));
    }
    if sample_rate == 0 {
        return Err(Error::Codec("sample rate must be non-zero".into()));
    }

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + pcm.len()));
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Codec(e.to_string()))?;
        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Codec(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Codec(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Encoded size of a WAV chunk holding `samples` PCM16 samples.
pub fn wav_len(samples: usize) -> usize {
    WAV_HEADER_LEN + samples * 2
}

/// Float samples → PCM16 → WAV in one step.
pub fn encode_wav(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<u8>> {
    let pcm = float_to_pcm16(samples, source_rate, target_rate)?;
    wrap_wav(&pcm, target_rate)
}

// ── Transport text ─────────────────────────────────────────────────

/// Encode bytes as standard base64 for embedding in a JSON text frame.
pub fn to_transport_text(bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Err(Error::Codec("no bytes to encode".into()));
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Decode standard base64 transport text back to bytes.
pub fn from_transport_text(text: &str) -> Result<Vec<u8>> {
    if text.is_empty() {
        return Err(Error::Codec("no transport text to decode".into()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| Error::Codec(format!("invalid base64: {e}")))
}

// ── Tests ──────────────────────────────────────────────────────────
