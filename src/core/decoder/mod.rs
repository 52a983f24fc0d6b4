//! Decoder side of the music adapter.
//!
//! Every backend hands out interleaved signed 16-bit PCM through
//! [`SoundDecoder`]. The crates doing the actual work (lewton, claxon,
//! minimp3) produce whole packets; [`PacketDecoder`] turns those into the
//! byte-exact read/seek/position contract the song's fill callback needs.

mod flac;
mod mp3;
mod vorbis;

use crate::core::source::{MusicReader, Signature, sniff};
use crate::error::{AudioError, Result};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelConfig {
    Mono,
    Stereo,
}

impl ChannelConfig {
    pub const fn from_count(channels: usize) -> Option<Self> {
        match channels {
            1 => Some(Self::Mono),
            2 => Some(Self::Stereo),
            _ => None,
        }
    }

    pub const fn count(&self) -> usize {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mono => "Mono",
            Self::Stereo => "Stereo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderInfo {
    pub sample_rate: u32,
    pub channels: ChannelConfig,
}

/// A seekable source of interleaved i16 PCM.
///
/// Positions and lengths are in frames (one sample per channel).
pub trait SoundDecoder: Send {
    fn info(&self) -> DecoderInfo;

    /// Fills `out` with whole frames and returns the number of samples
    /// written. Fewer than requested means the data ran out or a decode
    /// error ended the stream.
    fn read(&mut self, out: &mut [i16]) -> usize;

    /// Moves the read position to `frame`, clamped to the track length.
    fn seek(&mut self, frame: u64) -> bool;

    fn seek_ms(&mut self, ms: u64) -> bool {
        let frame = ms_to_frames(ms, self.info().sample_rate);
        self.seek(frame)
    }

    fn sample_offset(&self) -> u64;

    fn sample_length(&self) -> u64;
}

#[inline]
pub fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    (ms as u128 * sample_rate as u128 / 1000) as u64
}

#[inline]
pub fn frames_to_secs(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        0
    } else {
        frames / sample_rate as u64
    }
}

/// Opens the backend matching the file's signature.
///
/// Ogg and FLAC always carry their magic; anything unrecognised is handed to
/// the MP3 decoder, which resyncs past leading junk on its own.
pub fn create_decoder(mut reader: MusicReader) -> Result<Box<dyn SoundDecoder>> {
    let signature = sniff(&mut reader)?;
    let opened: Result<Box<dyn SoundDecoder>> = match signature {
        Signature::Ogg => vorbis::open(reader).map(boxed),
        Signature::Flac => flac::open(reader).map(boxed),
        Signature::Mp3 | Signature::Unknown => mp3::open(reader).map(boxed),
    };
    // Anything that goes wrong while a backend opens means the file is not playable.
    let decoder = opened.map_err(|e| match e {
        AudioError::UnsupportedFormat(_) => e,
        other => AudioError::UnsupportedFormat(format!("{}: {other}", signature.as_str())),
    })?;
    let info = decoder.info();
    info!(
        "Opened {} stream: {} Hz, {}, {} frames.",
        signature.as_str(),
        info.sample_rate,
        info.channels.as_str(),
        decoder.sample_length()
    );
    Ok(decoder)
}

fn boxed<D: SoundDecoder + 'static>(decoder: D) -> Box<dyn SoundDecoder> {
    Box::new(decoder)
}

/* ============================ Packet buffering ============================ */

/// What a codec backend has to provide: decoded packets in order, and a way
/// back to the first one.
pub(crate) trait PacketSource: Send {
    /// Next packet of interleaved samples, `Ok(None)` at end of stream.
    fn next_packet(&mut self) -> Result<Option<Vec<i16>>>;

    fn rewind(&mut self) -> Result<()>;

    /// Jumps near `frame` without decoding from the start. Returns the frame
    /// the next packet starts at, or `None` when the codec cannot seek and
    /// the source was left where it was.
    fn seek_to(&mut self, _frame: u64) -> Result<Option<u64>> {
        Ok(None)
    }
}

pub(crate) struct PacketDecoder<S> {
    source: S,
    info: DecoderInfo,
    length: u64,
    pending: Vec<i16>,
    cursor: usize,
    position: u64,
    finished: bool,
}

impl<S: PacketSource> PacketDecoder<S> {
    pub(crate) fn new(source: S, info: DecoderInfo, length: u64) -> Self {
        Self {
            source,
            info,
            length,
            pending: Vec::new(),
            cursor: 0,
            position: 0,
            finished: false,
        }
    }

    fn refill(&mut self) -> bool {
        while !self.finished {
            match self.source.next_packet() {
                Ok(Some(packet)) if packet.is_empty() => {}
                Ok(Some(packet)) => {
                    self.pending = packet;
                    self.cursor = 0;
                    return true;
                }
                Ok(None) => self.finished = true,
                Err(e) => {
                    warn!("Decoder stopped at frame {}: {e}", self.position);
                    self.finished = true;
                }
            }
        }
        false
    }

    fn resume_at(&mut self, frame: u64) {
        self.pending.clear();
        self.cursor = 0;
        self.position = frame;
        self.finished = false;
    }

    fn restart(&mut self) -> bool {
        if let Err(e) = self.source.rewind() {
            warn!("Failed to rewind decoder: {e}");
            return false;
        }
        self.resume_at(0);
        true
    }

    /// Lets the codec jump close to `target`. Backward seeks that the codec
    /// cannot serve fall back to reopening the stream.
    fn jump_towards(&mut self, target: u64) -> bool {
        let backward = target < self.position;
        match self.source.seek_to(target) {
            Ok(Some(landed)) if landed <= target => {
                debug!("Seek to frame {target} landed at {landed}.");
                self.resume_at(landed);
                true
            }
            Ok(None) if !backward => true,
            Ok(_) => self.restart(),
            Err(e) => {
                warn!("Seek to frame {target} failed: {e}");
                self.restart()
            }
        }
    }
}

impl<S: PacketSource> SoundDecoder for PacketDecoder<S> {
    fn info(&self) -> DecoderInfo {
        self.info
    }

    fn read(&mut self, out: &mut [i16]) -> usize {
        let channels = self.info.channels.count();
        let left_frames = self.length.saturating_sub(self.position);
        let frames = ((out.len() / channels) as u64).min(left_frames) as usize;
        let want = frames * channels;

        let mut written = 0;
        while written < want {
            if self.cursor >= self.pending.len() && !self.refill() {
                break;
            }
            let n = (self.pending.len() - self.cursor).min(want - written);
            out[written..written + n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
            self.cursor += n;
            written += n;
        }
        self.position += (written / channels) as u64;
        written
    }

    fn seek(&mut self, frame: u64) -> bool {
        let target = frame.min(self.length);
        // Short forward hops are cheaper to decode through than to seek.
        let far = target.saturating_sub(self.position) > u64::from(self.info.sample_rate);
        if (target < self.position || far) && !self.jump_towards(target) {
            return false;
        }

        // Codec seeks are coarse; decode and drop the rest of the way.
        let channels = self.info.channels.count();
        while self.position < target {
            if self.cursor >= self.pending.len() && !self.refill() {
                break;
            }
            let buffered = (self.pending.len() - self.cursor) / channels;
            let n = (buffered as u64).min(target - self.position);
            self.cursor += n as usize * channels;
            self.position += n;
        }
        self.position == target
    }

    fn sample_offset(&self) -> u64 {
        self.position
    }

    fn sample_length(&self) -> u64 {
        self.length
    }
}

fn checked_channels(channels: usize, format: &str) -> Result<ChannelConfig> {
    ChannelConfig::from_count(channels).ok_or_else(|| {
        AudioError::UnsupportedFormat(format!("{format} with {channels} channels"))
    })
}
