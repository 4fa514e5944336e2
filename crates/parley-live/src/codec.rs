//! Frame encoder and decoder: float capture samples <-> PCM16 little-endian.
//!
//! No header is written; rate and channel count travel out of band in the
//! MIME tag (`audio/pcm;rate=16000`). Decoding never resamples: a payload at
//! a rate the output device is not running at is rejected.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::str::FromStr;

const PCM_SCALE: f32 = 32768.0;

/// A fixed-length block of captured samples, in capture order.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Float samples in [-1.0, 1.0], interleaved if `channels > 1`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Position of this frame in the capture stream (0-based).
    pub sequence: u64,
}

impl AudioFrame {
    pub fn duration_secs(&self) -> f64 {
        frames_to_secs(self.samples.len(), self.sample_rate, self.channels)
    }
}

/// MIME-like tag describing a PCM16 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioMime {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioMime {
    pub fn pcm16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }
}

impl fmt::Display for AudioMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audio/pcm;rate={}", self.sample_rate)?;
        if self.channels != 1 {
            write!(f, ";channels={}", self.channels)?;
        }
        Ok(())
    }
}

impl FromStr for AudioMime {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default();
        if !essence.eq_ignore_ascii_case("audio/pcm") {
            return Err(VoiceError::Decode(format!("unsupported audio encoding '{}'", s)));
        }

        let mut sample_rate = None;
        let mut channels = 1u16;
        for param in parts.filter(|p| !p.is_empty()) {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| VoiceError::Decode(format!("malformed MIME parameter '{}'", param)))?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            match key.as_str() {
                "rate" => {
                    sample_rate = Some(value.parse::<u32>().map_err(|_| {
                        VoiceError::Decode(format!("invalid sample rate '{}'", value))
                    })?)
                }
                "channels" => {
                    channels = value.parse::<u16>().map_err(|_| {
                        VoiceError::Decode(format!("invalid channel count '{}'", value))
                    })?
                }
                _ => {}
            }
        }

        match sample_rate {
            Some(rate) if rate > 0 && channels > 0 => Ok(Self {
                sample_rate: rate,
                channels,
            }),
            _ => Err(VoiceError::Decode(format!("missing or zero rate/channels in '{}'", s))),
        }
    }
}

/// Encoded frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub bytes: Vec<u8>,
    pub mime: AudioMime,
}

/// Format the output device is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Playable samples recovered from a received payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        frames_to_secs(self.samples.len(), self.sample_rate, self.channels)
    }
}

fn frames_to_secs(samples: usize, sample_rate: u32, channels: u16) -> f64 {
    if sample_rate == 0 || channels == 0 {
        return 0.0;
    }
    (samples / channels as usize) as f64 / sample_rate as f64
}

/// Scale and truncate one float sample to i16. Out-of-range input saturates.
fn quantize(sample: f32) -> i16 {
    // `as` truncates toward zero and saturates, so 1.0 lands on i16::MAX.
    (sample.clamp(-1.0, 1.0) * PCM_SCALE) as i16
}

/// Encode a frame as headerless PCM16LE. Consumes the frame.
pub fn encode(frame: AudioFrame) -> EncodedChunk {
    let pcm: Vec<i16> = frame.samples.iter().copied().map(quantize).collect();
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);
    EncodedChunk {
        bytes,
        mime: AudioMime {
            sample_rate: frame.sample_rate,
            channels: frame.channels,
        },
    }
}

/// Decode a PCM16LE payload for an output device running at `expected`.
pub fn decode(bytes: &[u8], mime: &AudioMime, expected: OutputFormat) -> VoiceResult<DecodedAudio> {
    if mime.sample_rate != expected.sample_rate {
        return Err(VoiceError::RateMismatch {
            declared: mime.sample_rate,
            expected: expected.sample_rate,
        });
    }
    if mime.channels != expected.channels {
        return Err(VoiceError::Decode(format!(
            "payload has {} channel(s), output expects {}",
            mime.channels, expected.channels
        )));
    }
    if bytes.is_empty() {
        return Err(VoiceError::Decode("empty audio payload".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "payload length {} is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut pcm = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut pcm);
    Ok(DecodedAudio {
        samples: pcm.into_iter().map(|s| s as f32 / PCM_SCALE).collect(),
        sample_rate: mime.sample_rate,
        channels: mime.channels,
    })
}

/// Byte-safe text form of a payload for JSON messages.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(data: &str) -> VoiceResult<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| VoiceError::Decode(format!("invalid base64 payload: {}", e)))
}
