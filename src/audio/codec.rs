//! # Codec Layer
//!
//! Turns the text-safe audio payloads of the call stream into linear PCM.
//!
//! ## Decode Paths:
//! - **Caller**: always 8kHz G.711 μ-law. Each byte maps through a fixed
//!   256-entry table to a signed 16-bit sample. There is no error case once
//!   the payload is valid base64.
//! - **Agent**: the TTS payload format is not guaranteed. A WAV container is
//!   tried first; anything that does not parse as WAV goes through the same
//!   μ-law table as the caller path.
//!
//! ## Errors:
//! A payload that cannot be decoded on any path yields a `CodecError`. The
//! caller of this module logs it and drops the chunk; it never stops the call.

use crate::audio::chunk::{AudioChunk, Party, TELEPHONY_SAMPLE_RATE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use std::io::Cursor;

/// G.711 μ-law to linear lookup table, built at compile time.
pub static MULAW_TABLE: [i16; 256] = build_mulaw_table();

const MULAW_BIAS: i32 = 0x84;

const fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = ((((mantissa as i32) << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

const fn build_mulaw_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = mulaw_to_linear(i as u8);
        i += 1;
    }
    table
}

/// Reasons a chunk could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The payload was not valid base64
    InvalidBase64(String),
    /// The payload decoded to zero bytes
    EmptyPayload,
    /// A WAV container parsed but carried no samples we can play
    UnsupportedContainer(String),
    /// The decode task died before producing a result
    Aborted(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidBase64(msg) => write!(f, "invalid base64 payload: {}", msg),
            CodecError::EmptyPayload => write!(f, "audio payload is empty"),
            CodecError::UnsupportedContainer(msg) => write!(f, "unsupported audio container: {}", msg),
            CodecError::Aborted(msg) => write!(f, "decode aborted: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decode raw μ-law bytes into linear samples.
pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| MULAW_TABLE[b as usize]).collect()
}

/// Decode the base64 transport encoding.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    if bytes.is_empty() {
        return Err(CodecError::EmptyPayload);
    }
    Ok(bytes)
}

/// Decode a caller chunk: base64 → μ-law → PCM at 8kHz.
pub fn decode_caller(payload: &str) -> Result<AudioChunk, CodecError> {
    let bytes = decode_payload(payload)?;
    Ok(AudioChunk::new(Party::Caller, TELEPHONY_SAMPLE_RATE, decode_mulaw(&bytes)))
}

/// Decode an agent chunk: base64 → WAV if possible, otherwise μ-law.
pub fn decode_agent(payload: &str) -> Result<AudioChunk, CodecError> {
    let bytes = decode_payload(payload)?;

    match decode_wav(&bytes) {
        Ok((sample_rate, samples)) => {
            tracing::trace!(sample_rate, samples = samples.len(), "agent chunk decoded as WAV");
            Ok(AudioChunk::new(Party::Agent, sample_rate, samples))
        }
        Err(reason) => {
            tracing::trace!(%reason, "agent chunk is not WAV, using μ-law fallback");
            Ok(AudioChunk::new(Party::Agent, TELEPHONY_SAMPLE_RATE, decode_mulaw(&bytes)))
        }
    }
}

/// Parse a WAV container and downmix it to mono 16-bit PCM.
///
/// ## Returns:
/// - **Ok((sample_rate, samples))** for 8/16/24-bit PCM and 32-bit float data
/// - **Err(CodecError)** if the bytes are not a RIFF/WAVE file or hold no samples
fn decode_wav(bytes: &[u8]) -> Result<(u32, Vec<i16>), CodecError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(CodecError::UnsupportedContainer("missing RIFF/WAVE header".to_string()));
    }

    let mut cursor = Cursor::new(bytes);
    let (header, data) =
        wav::read(&mut cursor).map_err(|e| CodecError::UnsupportedContainer(e.to_string()))?;

    let interleaved: Vec<i16> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| ((s as i16) - 128) << 8)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples,
        wav::BitDepth::TwentyFour(samples) => samples.into_iter().map(|s| (s >> 8) as i16).collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples
            .into_iter()
            .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
            .collect(),
        wav::BitDepth::Empty => Vec::new(),
    };

    if interleaved.is_empty() {
        return Err(CodecError::UnsupportedContainer("no samples in data chunk".to_string()));
    }

    let channels = header.channel_count.max(1) as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / frame.len() as i32) as i16
            })
            .collect()
    };

    Ok((header.sampling_rate, mono))
}

/// Decode a chunk for the given party.
pub fn decode_for_party(party: Party, payload: &str) -> Result<AudioChunk, CodecError> {
    match party {
        Party::Caller => decode_caller(payload),
        Party::Agent => decode_agent(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    #[test]
    fn test_mulaw_table_canonical_values() {
        assert_eq!(MULAW_TABLE[0xFF], 0);
        assert_eq!(MULAW_TABLE[0x00], -32124);
        assert_eq!(MULAW_TABLE[0x7F], 0);
        assert_eq!(MULAW_TABLE[0x80], 32124);
        assert_eq!(MULAW_TABLE[0x0F], -16764);
        assert_eq!(MULAW_TABLE[0x10], -15996);
        assert_eq!(MULAW_TABLE[0xFE], 8);
    }

    #[test]
    fn test_mulaw_table_is_odd_symmetric() {
        for b in 0u8..0x80 {
            assert_eq!(MULAW_TABLE[b as usize], -MULAW_TABLE[(b | 0x80) as usize]);
        }
    }

    #[test]
    fn test_decode_caller() {
        let chunk = decode_caller(&encode(&[0xFF, 0x00, 0x80])).unwrap();
        assert_eq!(chunk.party, Party::Caller);
        assert_eq!(chunk.sample_rate, 8000);
        assert_eq!(chunk.samples(), &[0, -32124, 32124]);
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        assert!(matches!(decode_caller("not base64!!"), Err(CodecError::InvalidBase64(_))));
        assert!(matches!(decode_agent("%%%"), Err(CodecError::InvalidBase64(_))));
        assert_eq!(decode_agent("").unwrap_err(), CodecError::EmptyPayload);
    }

    #[test]
    fn test_agent_falls_back_to_mulaw() {
        let chunk = decode_agent(&encode(&[0xFF, 0x80, 0x00, 0x7F])).unwrap();
        assert_eq!(chunk.party, Party::Agent);
        assert_eq!(chunk.sample_rate, 8000);
        assert_eq!(chunk.samples(), &[0, 32124, -32124, 0]);
    }

    #[test]
    fn test_agent_decodes_wav_container() {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, 16000, 16);
        let samples = wav::BitDepth::Sixteen(vec![100, -200, 300, -400]);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &samples, &mut out).unwrap();

        let chunk = decode_agent(&encode(&out.into_inner())).unwrap();
        assert_eq!(chunk.sample_rate, 16000);
        assert_eq!(chunk.samples(), &[100, -200, 300, -400]);
    }

    #[test]
    fn test_stereo_wav_is_downmixed() {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 2, 8000, 16);
        let samples = wav::BitDepth::Sixteen(vec![100, 300, -100, -300]);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &samples, &mut out).unwrap();

        let chunk = decode_agent(&encode(&out.into_inner())).unwrap();
        assert_eq!(chunk.samples(), &[200, -200]);
    }
}
