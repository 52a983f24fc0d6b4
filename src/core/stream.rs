//! The engine's streaming-sound contract.
//!
//! A renderer creates streams around a fill callback; the stream pulls one
//! buffer of interleaved i16 samples at a time whenever it needs more audio.
//! [`ManualRenderer`] is the in-process implementation where the caller
//! decides when to pull, used for offline rendering.

use crate::error::{AudioError, Result};
use log::info;
use std::sync::{Arc, Mutex, PoisonError};

/// Fills the buffer with the next block of audio. Returning `false` ends the
/// stream after this buffer has been played.
pub type FillFn = Box<dyn FnMut(&mut [i16]) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub const fn is_mono(&self) -> bool {
        self.channels == 1
    }

    /// Samples per pull for a buffer of `buffer_bytes` bytes of 16-bit PCM,
    /// rounded down to whole frames.
    pub fn buffer_samples(&self, buffer_bytes: usize) -> Result<usize> {
        let channels = self.channels as usize;
        if channels == 0 || self.sample_rate == 0 {
            return Err(AudioError::Stream(format!("invalid stream format {self:?}")));
        }
        let frame_bytes = channels * 2;
        let frames = buffer_bytes / frame_bytes;
        if frames == 0 {
            return Err(AudioError::Stream(format!(
                "buffer of {buffer_bytes} bytes holds no {channels}-channel frame"
            )));
        }
        Ok(frames * channels)
    }
}

pub trait SoundRenderer {
    fn create_stream(
        &self,
        fill: FillFn,
        buffer_bytes: usize,
        format: StreamFormat,
    ) -> Result<Box<dyn SoundStream>>;
}

pub trait SoundStream: Send {
    /// Starts pulling audio. `volume` is linear, 0.0 to 1.0.
    fn play(&mut self, looping: bool, volume: f32) -> bool;

    fn stop(&mut self);

    fn set_paused(&mut self, paused: bool) -> bool;

    /// True once the fill callback has reported the end and everything it
    /// produced has been played.
    fn is_ended(&self) -> bool;
}

#[inline]
pub(crate) fn sanitize_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

#[inline]
pub(crate) fn apply_volume(samples: &mut [i16], volume: f32) {
    if (volume - 1.0).abs() < 0.0001 {
        return;
    }
    for s in samples {
        *s = (*s as f32 * volume).round().clamp(-32768.0, 32767.0) as i16;
    }
}

/* ============================= Manual renderer ============================= */

struct ManualState {
    fill: FillFn,
    format: StreamFormat,
    buffer_samples: usize,
    playing: bool,
    paused: bool,
    ended: bool,
    volume: f32,
}

type SharedManual = Arc<Mutex<ManualState>>;

fn lock(state: &SharedManual) -> std::sync::MutexGuard<'_, ManualState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ManualRenderer {
    streams: Mutex<Vec<SharedManual>>,
}

impl ManualRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the most recently created stream.
    pub fn last_stream(&self) -> Option<ManualStreamHandle> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.last().map(|state| ManualStreamHandle {
            state: state.clone(),
        })
    }
}

impl SoundRenderer for ManualRenderer {
    fn create_stream(
        &self,
        fill: FillFn,
        buffer_bytes: usize,
        format: StreamFormat,
    ) -> Result<Box<dyn SoundStream>> {
        let buffer_samples = format.buffer_samples(buffer_bytes)?;
        let state = Arc::new(Mutex::new(ManualState {
            fill,
            format,
            buffer_samples,
            playing: false,
            paused: false,
            ended: false,
            volume: 1.0,
        }));
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        info!(
            "Manual stream created ({} Hz, {} ch, {} samples per pull).",
            format.sample_rate, format.channels, buffer_samples
        );
        Ok(Box::new(ManualStream { state }))
    }
}

struct ManualStream {
    state: SharedManual,
}

impl SoundStream for ManualStream {
    fn play(&mut self, _looping: bool, volume: f32) -> bool {
        let mut state = lock(&self.state);
        if state.ended {
            return false;
        }
        state.playing = true;
        state.paused = false;
        state.volume = sanitize_volume(volume);
        true
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.playing = false;
        state.paused = false;
    }

    fn set_paused(&mut self, paused: bool) -> bool {
        let mut state = lock(&self.state);
        if !state.playing {
            return false;
        }
        state.paused = paused;
        true
    }

    fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }
}

/// Caller side of a manual stream.
#[derive(Clone)]
pub struct ManualStreamHandle {
    state: SharedManual,
}

impl ManualStreamHandle {
    /// Pulls one buffer through the fill callback. `None` while stopped,
    /// paused or after the stream has ended.
    pub fn pull(&self) -> Option<Vec<i16>> {
        let mut state = lock(&self.state);
        if !state.playing || state.paused || state.ended {
            return None;
        }
        let mut buf = vec![0i16; state.buffer_samples];
        if !(state.fill)(&mut buf) {
            state.ended = true;
        }
        apply_volume(&mut buf, state.volume);
        Some(buf)
    }

    pub fn format(&self) -> StreamFormat {
        lock(&self.state).format
    }

    pub fn buffer_samples(&self) -> usize {
        lock(&self.state).buffer_samples
    }
}
