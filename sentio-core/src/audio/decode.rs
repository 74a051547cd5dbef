//! Container decoding: WAV via `hound`, MP3 via `symphonia`.
//!
//! Both paths return mono f32 at the file's native rate.
//! Integer PCM is scaled by `2^(bits-1)` so full-scale maps to ±1.0.

use std::io::Read;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use super::signal::{downmix_interleaved, AudioSignal};
use crate::error::{Result, SentioError};

/// Decode a RIFF/WAVE stream.
pub fn decode_wav<R: Read>(reader: R) -> Result<AudioSignal> {
    let reader = hound::WavReader::new(reader).map_err(map_hound_error)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels);
    if channels == 0 {
        return Err(SentioError::AudioDecode("WAV header declares zero channels".into()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_hound_error)?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_hound_error)?
        }
    };

    let mut mono = Vec::new();
    downmix_interleaved(&interleaved, channels, &mut mono);
    debug!(
        sample_rate = spec.sample_rate,
        channels,
        bits = spec.bits_per_sample,
        frames = mono.len(),
        "decoded WAV"
    );
    Ok(AudioSignal::new(mono, spec.sample_rate))
}

fn map_hound_error(e: hound::Error) -> SentioError {
    match e {
        hound::Error::Unsupported => {
            SentioError::UnsupportedFormat("WAV encoding not supported".into())
        }
        other => SentioError::AudioDecode(other.to_string()),
    }
}

/// Decode an MPEG audio stream.
///
/// Gapless mode is on: encoder delay and padding declared in a LAME/Info
/// tag are trimmed, so sample 0 is the first sample that was encoded.
///
/// Probe/codec failures mean the bytes are not something we can decode at all
/// (`UnsupportedFormat`); failures after the stream was recognised are
/// corrupt data (`AudioDecode`). Individual undecodable packets are skipped.
pub fn decode_mp3<S: MediaSource + 'static>(source: S) -> Result<AudioSignal> {
    let mss = MediaSourceStream::new(Box::new(source), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let format_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &MetadataOptions::default())
        .map_err(|e| SentioError::UnsupportedFormat(format!("mp3 probe: {e}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| SentioError::UnsupportedFormat("no decodable audio track".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| SentioError::UnsupportedFormat(format!("mp3 codec: {e}")))?;

    let mut mono = Vec::new();
    let mut skipped_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(SentioError::AudioDecode(format!("mp3 demux: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate.get_or_insert(spec.rate);
                let channels = spec.channels.count();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                downmix_interleaved(buf.samples(), channels, &mut mono);
            }
            Err(SymphoniaError::DecodeError(e)) => {
                skipped_packets += 1;
                warn!("skipping undecodable mp3 packet: {e}");
            }
            Err(e) => return Err(SentioError::AudioDecode(format!("mp3 decode: {e}"))),
        }
    }

    let sample_rate = sample_rate
        .ok_or_else(|| SentioError::AudioDecode("mp3 stream has no sample rate".into()))?;
    if mono.is_empty() && skipped_packets > 0 {
        return Err(SentioError::AudioDecode(format!(
            "no decodable mp3 frames ({skipped_packets} packets rejected)"
        )));
    }

    debug!(sample_rate, frames = mono.len(), skipped_packets, "decoded MP3");
    Ok(AudioSignal::new(mono, sample_rate))
}
