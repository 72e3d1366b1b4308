//! HTTP live audio decoded with Symphonia.
//!
//! Continuous and generic URLs stream the response body; segmented URLs go through the
//! playlist follower. The byte stream is probed once per (re)connect and then decoded one
//! packet per pull. Symphonia has no video decoders, so this source only yields audio.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use stream_sync_types::StreamKind;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

use crate::decode_loop::StopSignal;
use crate::error::SourceError;
use crate::playlist::{self, SegmentReader};
use crate::profile::SourceProfile;
use crate::source::{FetchDirective, LiveSource, SourceOpener, StreamInfo};
use crate::unit::{AudioSamples, AudioUnit, ElementaryUnit};

const MIN_STREAM_BUFFER: usize = 64 * 1024;

/// Opens HTTP(S) live audio streams.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaOpener;

impl SourceOpener for SymphoniaOpener {
    fn open(
        &self,
        url: &str,
        profile: &SourceProfile,
        stop: &Arc<StopSignal>,
    ) -> Result<Box<dyn LiveSource>, SourceError> {
        let mut hint = Hint::new();
        let mut title = None;

        let reader: Box<dyn Read + Send> = if profile.kind == StreamKind::Segmented {
            let segments = SegmentReader::open(url, profile, stop.clone()).map_err(|e| SourceError::Connection(e.to_string()))?;
            if let Some(ext) = segments.segment_extension() {
                hint.with_extension(ext);
            }
            Box::new(segments)
        } else {
            let resp = playlist::http_get(url, profile.read_timeout)
                .map_err(|e| SourceError::Connection(e.to_string()))?;
            title = resp
                .headers()
                .get("icy-name")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            if let Some(mime) = resp.headers().get("Content-Type").and_then(|v| v.to_str().ok()) {
                hint.mime_type(mime);
            }
            if let Some(ext) = playlist::url_extension(url) {
                hint.with_extension(&ext);
            }
            Box::new(resp.into_body().into_reader())
        };

        let source = SymphoniaSource::probe(reader, hint, profile, title)?;
        Ok(Box::new(source))
    }
}

/// Non-seekable [`MediaSource`] over a live byte stream.
pub struct LiveByteSource {
    inner: Mutex<Box<dyn Read + Send>>,
}

impl LiveByteSource {
    pub fn new(inner: Box<dyn Read + Send>) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl Read for LiveByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .read(buf)
    }
}

impl Seek for LiveByteSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "live stream is not seekable"))
    }
}

impl MediaSource for LiveByteSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Largest power of two not above `bytes`, floored at 64 KiB.
fn stream_buffer_len(bytes: usize) -> usize {
    let bytes = bytes.max(MIN_STREAM_BUFFER);
    1 << (usize::BITS - 1 - bytes.leading_zeros())
}

pub struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    codec_params: CodecParameters,
    track_id: u32,
    info: StreamInfo,
}

impl SymphoniaSource {
    /// Probe the container and build a decoder for its first audio track.
    pub fn probe(
        reader: Box<dyn Read + Send>,
        hint: Hint,
        profile: &SourceProfile,
        title: Option<String>,
    ) -> Result<Self, SourceError> {
        let opts = MediaSourceStreamOptions {
            buffer_len: stream_buffer_len(profile.io_buffer_bytes),
        };
        let mss = MediaSourceStream::new(Box::new(LiveByteSource::new(reader)), opts);
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| SourceError::Connection(format!("probe failed: {e}")))?;

        let mut format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| SourceError::Connection("stream has no audio track".to_string()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| SourceError::Connection(format!("unsupported codec: {e}")))?;

        let title = title.or_else(|| stream_title(format.as_mut()));
        let info = StreamInfo {
            width: 0,
            height: 0,
            frame_rate: 0.0,
            sample_rate: codec_params.sample_rate.unwrap_or(0),
            channels: codec_params.channels.map_or(0, |c| c.count() as u16),
            title,
        };
        tracing::info!(
            codec = codec_name(&codec_params),
            rate_hz = info.sample_rate,
            channels = info.channels,
            "live audio stream probed"
        );

        Ok(Self {
            format,
            decoder,
            codec_params,
            track_id,
            info,
        })
    }

    fn next_audio(&mut self) -> Result<Option<ElementaryUnit>, SourceError> {
        let packet = match self.format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::ResetRequired) => {
                tracing::info!("stream parameters changed; rebuilding decoder");
                self.rebuild_decoder()?;
                return Ok(None);
            }
            Err(SymphoniaError::IoError(e)) => {
                return Err(SourceError::Connection(format!("stream read: {e}")));
            }
            Err(e) => return Err(SourceError::Decode(e.to_string())),
        };
        if packet.track_id() != self.track_id {
            return Ok(None);
        }

        let decoded = match self.decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::ResetRequired) => {
                self.rebuild_decoder()?;
                return Ok(None);
            }
            Err(e) => return Err(SourceError::Decode(e.to_string())),
        };
        if decoded.frames() == 0 {
            return Ok(None);
        }

        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        Ok(Some(ElementaryUnit::Audio(AudioUnit {
            sample_rate: spec.rate,
            samples: AudioSamples::F32Interleaved {
                channels: spec.channels.count(),
                data: buf.samples().to_vec(),
            },
        })))
    }

    fn rebuild_decoder(&mut self) -> Result<(), SourceError> {
        if let Some(track) = self.format.tracks().iter().find(|t| t.id == self.track_id) {
            self.codec_params = track.codec_params.clone();
        }
        self.decoder = symphonia::default::get_codecs()
            .make(&self.codec_params, &DecoderOptions::default())
            .map_err(|e| SourceError::Connection(format!("decoder rebuild failed: {e}")))?;
        Ok(())
    }
}

impl LiveSource for SymphoniaSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_unit(&mut self, _directive: FetchDirective) -> Result<Option<ElementaryUnit>, SourceError> {
        self.next_audio()
    }
}

fn stream_title(format: &mut dyn FormatReader) -> Option<String> {
    let metadata = format.metadata();
    let rev = metadata.current()?;
    rev.tags()
        .iter()
        .find(|t| matches!(t.std_key, Some(StandardTagKey::TrackTitle)))
        .map(|t| t.value.to_string())
}

/// Short codec name for logs.
pub fn codec_name(params: &CodecParameters) -> &'static str {
    use symphonia::core::codecs::*;
    match params.codec {
        CODEC_TYPE_AAC => "aac",
        CODEC_TYPE_MP3 => "mp3",
        CODEC_TYPE_FLAC => "flac",
        CODEC_TYPE_VORBIS => "vorbis",
        CODEC_TYPE_ALAC => "alac",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE | CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_F32LE => "pcm",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Minimal 16-bit PCM WAV with `frames` stereo frames at 8 kHz.
    fn wav_bytes(frames: u32) -> Vec<u8> {
        let channels: u16 = 2;
        let rate: u32 = 8_000;
        let data_len = frames * u32::from(channels) * 2;
        let mut v = Vec::new();
        v.extend_from_slice(b"RIFF");
        v.extend_from_slice(&(36 + data_len).to_le_bytes());
        v.extend_from_slice(b"WAVEfmt ");
        v.extend_from_slice(&16u32.to_le_bytes());
        v.extend_from_slice(&1u16.to_le_bytes());
        v.extend_from_slice(&channels.to_le_bytes());
        v.extend_from_slice(&rate.to_le_bytes());
        v.extend_from_slice(&(rate * u32::from(channels) * 2).to_le_bytes());
        v.extend_from_slice(&(channels * 2).to_le_bytes());
        v.extend_from_slice(&16u16.to_le_bytes());
        v.extend_from_slice(b"data");
        v.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let s = ((i % 64) as i16 - 32) * 256;
            v.extend_from_slice(&s.to_le_bytes());
            v.extend_from_slice(&(-s).to_le_bytes());
        }
        v
    }

    fn wav_source(frames: u32) -> SymphoniaSource {
        let mut hint = Hint::new();
        hint.with_extension("wav");
        let profile = SourceProfile::for_kind(StreamKind::Continuous);
        SymphoniaSource::probe(Box::new(Cursor::new(wav_bytes(frames))), hint, &profile, None).unwrap()
    }

    #[test]
    fn buffer_len_is_power_of_two() {
        assert_eq!(stream_buffer_len(1024 * 1024), 1024 * 1024);
        assert_eq!(stream_buffer_len(2_048_000), 1024 * 1024);
        assert_eq!(stream_buffer_len(10), MIN_STREAM_BUFFER);
    }

    #[test]
    fn live_byte_source_refuses_seek() {
        let mut src = LiveByteSource::new(Box::new(Cursor::new(vec![1u8, 2, 3])));
        assert!(!src.is_seekable());
        assert!(src.byte_len().is_none());
        assert!(src.seek(SeekFrom::Start(0)).is_err());
        let mut buf = [0u8; 3];
        assert_eq!(src.read(&mut buf).unwrap(), 3);
    }

    #[test]
    fn probes_stream_parameters() {
        let source = wav_source(4_000);
        assert_eq!(source.info().sample_rate, 8_000);
        assert_eq!(source.info().channels, 2);
        assert_eq!(codec_name(&source.codec_params), "pcm");
    }

    #[test]
    fn decodes_interleaved_audio_then_reports_end_as_connection_loss() {
        let mut source = wav_source(4_000);
        let mut frames = 0;
        loop {
            match source.next_unit(FetchDirective::AudioAndVideo) {
                Ok(Some(ElementaryUnit::Audio(unit))) => {
                    assert_eq!(unit.sample_rate, 8_000);
                    assert_eq!(unit.samples.channels(), 2);
                    if let AudioSamples::F32Interleaved { data, .. } = unit.samples {
                        frames += data.len() / 2;
                    }
                }
                Ok(Some(ElementaryUnit::Video(_))) => panic!("audio-only source"),
                Ok(None) => {}
                Err(e) => {
                    assert!(e.is_connection());
                    break;
                }
            }
        }
        assert_eq!(frames, 4_000);
    }

    #[test]
    fn garbage_fails_probe_as_connection_error() {
        let profile = SourceProfile::for_kind(StreamKind::Auto);
        let result = SymphoniaSource::probe(
            Box::new(Cursor::new(vec![0u8; 4096])),
            Hint::new(),
            &profile,
            None,
        );
        assert!(matches!(result, Err(SourceError::Connection(_))));
    }
}
