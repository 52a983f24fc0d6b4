use crate::core::stream::{
    FillFn, SoundRenderer, SoundStream, StreamFormat, apply_volume, sanitize_volume,
};
use crate::error::{AudioError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, SizedSample, StreamConfig};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/* ============================== Public API ============================== */

/// Streams to the default output device through cpal.
pub struct CpalRenderer {
    device_name: String,
}

impl CpalRenderer {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Device("no audio output device".to_string()))?;
        let config = device
            .default_output_config()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());
        info!(
            "Audio output '{}' ready ({} Hz, {} ch default).",
            device_name,
            config.sample_rate().0,
            config.channels()
        );
        Ok(Self { device_name })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

// Commands to a stream's manager thread
enum StreamCommand {
    Play,
    Pause(bool),
    Stop,
    Shutdown,
}

/// State shared between the stream handle, its manager thread and the
/// device callback.
struct Shared {
    ring: internal::SpscRingI16,
    volume_bits: AtomicU32,
    paused: AtomicBool,
    source_done: AtomicBool,
    ended: AtomicBool,
}

impl Shared {
    fn new(ring_capacity: usize) -> Self {
        Self {
            ring: internal::SpscRingI16::new(ring_capacity),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            paused: AtomicBool::new(false),
            source_done: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        }
    }
}

struct CpalStream {
    commands: Sender<StreamCommand>,
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SoundRenderer for CpalRenderer {
    fn create_stream(
        &self,
        fill: FillFn,
        buffer_bytes: usize,
        format: StreamFormat,
    ) -> Result<Box<dyn SoundStream>> {
        let buffer_samples = format.buffer_samples(buffer_bytes)?;
        let shared = Arc::new(Shared::new((buffer_samples * 4).next_power_of_two()));

        let (command_sender, command_receiver) = channel();
        let (ready_sender, ready_receiver) = channel();
        let shared_for_thread = shared.clone();
        let thread = thread::Builder::new()
            .name("music-stream".to_string())
            .spawn(move || {
                stream_manager_thread(
                    fill,
                    buffer_samples,
                    format,
                    shared_for_thread,
                    command_receiver,
                    ready_sender,
                );
            })?;

        match ready_receiver.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                commands: command_sender,
                shared,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::Device("stream thread exited during setup".to_string()))
            }
        }
    }
}

impl SoundStream for CpalStream {
    fn play(&mut self, _looping: bool, volume: f32) -> bool {
        if self.shared.ended.load(Ordering::Acquire) {
            return false;
        }
        self.shared
            .volume_bits
            .store(sanitize_volume(volume).to_bits(), Ordering::Relaxed);
        self.commands.send(StreamCommand::Play).is_ok()
    }

    fn stop(&mut self) {
        let _ = self.commands.send(StreamCommand::Stop);
    }

    fn set_paused(&mut self, paused: bool) -> bool {
        self.commands.send(StreamCommand::Pause(paused)).is_ok()
    }

    fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/* ============================ Stream internals ============================ */

/// Manager thread: owns the cpal stream, tops up the ring through the fill
/// callback and applies transport commands.
fn stream_manager_thread(
    mut fill: FillFn,
    buffer_samples: usize,
    format: StreamFormat,
    shared: Arc<Shared>,
    commands: Receiver<StreamCommand>,
    ready: Sender<Result<()>>,
) {
    let stream = match build_device_stream(format, shared.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut scratch = vec![0i16; buffer_samples];
    let mut playing = false;

    loop {
        if playing && !shared.paused.load(Ordering::Relaxed) {
            top_up(&mut fill, &mut scratch, &shared);
        }
        if mark_drained(&shared) {
            info!("Music stream drained.");
            if let Err(e) = stream.pause() {
                warn!("Failed to pause finished stream: {e}");
            }
        }

        match commands.recv_timeout(Duration::from_millis(5)) {
            Ok(StreamCommand::Play) => {
                playing = true;
                shared.paused.store(false, Ordering::Relaxed);
                // Prefill so the device does not start on an underrun.
                top_up(&mut fill, &mut scratch, &shared);
                if let Err(e) = stream.play() {
                    error!("Failed to start audio stream: {e}");
                }
            }
            Ok(StreamCommand::Pause(paused)) => {
                shared.paused.store(paused, Ordering::Relaxed);
                let result = if paused {
                    stream.pause().map_err(|e| e.to_string())
                } else {
                    stream.play().map_err(|e| e.to_string())
                };
                if let Err(e) = result {
                    warn!("Failed to change pause state: {e}");
                }
            }
            Ok(StreamCommand::Stop) => {
                playing = false;
                if let Err(e) = stream.pause() {
                    warn!("Failed to pause stopped stream: {e}");
                }
                shared.ring.request_clear();
            }
            Ok(StreamCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn top_up(fill: &mut FillFn, scratch: &mut [i16], shared: &Shared) {
    while !shared.source_done.load(Ordering::Relaxed) && shared.ring.free() >= scratch.len() {
        let more = fill(scratch);
        shared.ring.push(scratch);
        if !more {
            info!("Music source finished; draining stream.");
            shared.source_done.store(true, Ordering::Release);
        }
    }
}

/// Flags the stream as ended once the source is done and the device has
/// played everything. True only on the call that makes the transition.
fn mark_drained(shared: &Shared) -> bool {
    shared.source_done.load(Ordering::Acquire)
        && shared.ring.is_empty()
        && !shared.ended.swap(true, Ordering::AcqRel)
}

/// Device-side fill of one callback's worth of source frames.
fn render(shared: &Shared, mix: &mut [i16]) {
    if shared.paused.load(Ordering::Relaxed) {
        shared.ring.apply_clear();
        mix.fill(0);
    } else {
        shared.ring.pop_or_silence(mix);
        let volume = f32::from_bits(shared.volume_bits.load(Ordering::Relaxed));
        apply_volume(mix, volume);
    }
}

fn build_device_stream(format: StreamFormat, shared: Arc<Shared>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no audio output device".to_string()))?;
    let rate = format.sample_rate;

    let range = device
        .supported_output_configs()
        .map_err(|e| AudioError::Device(e.to_string()))?
        .filter(|r| r.channels() >= format.channels)
        .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
        .filter_map(|r| format_rank(r.sample_format()).map(|rank| (rank, r)))
        .min_by_key(|(rank, r)| (r.channels(), *rank))
        .map(|(_, r)| r)
        .ok_or_else(|| {
            AudioError::Device(format!(
                "no output config for {} Hz with {} channel(s)",
                rate, format.channels
            ))
        })?;
    let config = range.with_sample_rate(cpal::SampleRate(rate));
    let stream_config: StreamConfig = config.config();
    let in_ch = format.channels as usize;

    let stream = match config.sample_format() {
        SampleFormat::I16 => build_output::<i16>(&device, &stream_config, shared, in_ch, |s| s),
        SampleFormat::U16 => build_output::<u16>(&device, &stream_config, shared, in_ch, |s| {
            (i32::from(s) + 32768) as u16
        }),
        SampleFormat::F32 => build_output::<f32>(&device, &stream_config, shared, in_ch, |s| {
            s.to_sample::<f32>()
        }),
        other => {
            return Err(AudioError::Device(format!("unsupported sample format {other:?}")));
        }
    }
    .map_err(|e| AudioError::Device(e.to_string()))?;

    info!(
        "Music stream opened ({} Hz, {} -> {} ch, {:?}).",
        rate,
        in_ch,
        stream_config.channels,
        config.sample_format()
    );
    Ok(stream)
}

const fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Shared>,
    in_ch: usize,
    convert: fn(i16) -> T,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + Send + 'static,
{
    let out_ch = config.channels as usize;
    // Reused across callbacks to avoid allocating in RT
    let mut mix: Vec<i16> = Vec::new();
    device.build_output_stream(
        config,
        move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = out.len() / out_ch;
            if mix.len() != frames * in_ch {
                mix.resize(frames * in_ch, 0);
            }
            render(&shared, &mut mix);
            // Extra device channels repeat the source channels
            for (f, frame) in out.chunks_exact_mut(out_ch).enumerate() {
                for (c, o) in frame.iter_mut().enumerate() {
                    *o = convert(mix[f * in_ch + c % in_ch]);
                }
            }
        },
        |err| error!("Audio stream error: {err}"),
        None,
    )
}

/* =========================== Internal primitives =========================== */

mod internal {
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Single-producer/single-consumer ring of interleaved samples. The
    /// manager thread is the only producer, the device callback the only
    /// consumer.
    pub struct SpscRingI16 {
        buf: UnsafeCell<Box<[i16]>>,
        mask: usize,
        head: AtomicUsize,
        tail: AtomicUsize,
        // Head position a pending clear discards up to.
        clear_to: AtomicUsize,
        clear_pending: AtomicBool,
    }
    unsafe impl Send for SpscRingI16 {}
    unsafe impl Sync for SpscRingI16 {}

    impl SpscRingI16 {
        pub fn new(cap_pow2: usize) -> Self {
            assert!(cap_pow2.is_power_of_two());
            Self {
                buf: UnsafeCell::new(vec![0i16; cap_pow2].into_boxed_slice()),
                mask: cap_pow2 - 1,
                head: AtomicUsize::new(0),
                tail: AtomicUsize::new(0),
                clear_to: AtomicUsize::new(0),
                clear_pending: AtomicBool::new(false),
            }
        }

        #[inline(always)]
        fn cap(&self) -> usize {
            self.mask + 1
        }

        pub fn len(&self) -> usize {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Acquire);
            h.wrapping_sub(t)
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn free(&self) -> usize {
            self.cap() - self.len()
        }

        pub fn push(&self, data: &[i16]) -> usize {
            let cap = self.cap();
            let h = self.head.load(Ordering::Relaxed);
            let t = self.tail.load(Ordering::Acquire);
            let free = cap - h.wrapping_sub(t);
            let n = data.len().min(free);
            if n == 0 {
                return 0;
            }
            let idx = h & self.mask;
            unsafe {
                let buf = &mut *self.buf.get();
                let first = (cap - idx).min(n);
                buf[idx..idx + first].copy_from_slice(&data[..first]);
                if n > first {
                    buf[0..(n - first)].copy_from_slice(&data[first..n]);
                }
            }
            self.head.store(h.wrapping_add(n), Ordering::Release);
            n
        }

        pub fn pop(&self, out: &mut [i16]) -> usize {
            self.apply_clear();
            let cap = self.cap();
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Relaxed);
            let avail = h.wrapping_sub(t);
            let n = out.len().min(avail);
            if n == 0 {
                return 0;
            }
            let idx = t & self.mask;
            unsafe {
                let buf = &*self.buf.get();
                let first = (cap - idx).min(n);
                out[..first].copy_from_slice(&buf[idx..idx + first]);
                if n > first {
                    out[first..n].copy_from_slice(&buf[0..(n - first)]);
                }
            }
            self.tail.store(t.wrapping_add(n), Ordering::Release);
            n
        }

        /// Producer side: discards everything pushed so far. The consumer
        /// carries it out on its next pop; later pushes survive.
        pub fn request_clear(&self) {
            self.clear_to
                .store(self.head.load(Ordering::Relaxed), Ordering::Relaxed);
            self.clear_pending.store(true, Ordering::Release);
        }

        /// Consumer side of [`Self::request_clear`].
        pub fn apply_clear(&self) {
            if !self.clear_pending.swap(false, Ordering::Acquire) {
                return;
            }
            let to = self.clear_to.load(Ordering::Relaxed);
            let t = self.tail.load(Ordering::Relaxed);
            // Already consumed past the mark.
            if to.wrapping_sub(t) > self.cap() {
                return;
            }
            self.tail.store(to, Ordering::Release);
        }

        pub fn pop_or_silence(&self, dst: &mut [i16]) {
            let got = self.pop(dst);
            // underrun: zero the rest
            dst[got..].fill(0);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::{Shared, mark_drained, render, top_up};
    use crate::core::stream::FillFn;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fills each buffer with its call number; reports the end on call `last`.
    fn counting_fill(calls: Arc<AtomicUsize>, last: usize) -> FillFn {
        Box::new(move |buf: &mut [i16]| {
            let n = calls.fetch_add(1, Ordering::Relaxed) + 1;
            buf.fill(n as i16);
            n < last
        })
    }

    #[test]
    fn finished_source_is_not_pulled_again() {
        let shared = Shared::new(64);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut fill = counting_fill(calls.clone(), 2);
        let mut scratch = vec![0i16; 8];

        top_up(&mut fill, &mut scratch, &shared);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(shared.source_done.load(Ordering::Relaxed));
        assert_eq!(shared.ring.len(), 16, "the final buffer is still queued");

        let mut out = vec![0i16; 16];
        render(&shared, &mut out);
        top_up(&mut fill, &mut scratch, &shared);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert!(shared.ring.is_empty());
    }

    #[test]
    fn ended_waits_for_the_ring_to_drain() {
        let shared = Shared::new(32);
        let mut fill = counting_fill(Arc::new(AtomicUsize::new(0)), 1);
        let mut scratch = vec![0i16; 8];
        top_up(&mut fill, &mut scratch, &shared);

        assert!(!mark_drained(&shared));
        let mut out = vec![0i16; 4];
        render(&shared, &mut out);
        assert_eq!(out, [1; 4]);
        assert!(!mark_drained(&shared), "half of the last buffer is still queued");
        assert!(!shared.ended.load(Ordering::Relaxed));

        render(&shared, &mut out);
        assert!(mark_drained(&shared));
        assert!(shared.ended.load(Ordering::Relaxed));
        assert!(!mark_drained(&shared), "the transition is reported once");
    }

    #[test]
    fn stop_discards_queued_audio() {
        let shared = Shared::new(32);
        shared.ring.push(&[5; 12]);
        shared.ring.request_clear();
        shared.ring.push(&[7; 4]);

        let mut out = vec![-1i16; 8];
        render(&shared, &mut out);
        assert_eq!(out, [7, 7, 7, 7, 0, 0, 0, 0]);
        assert!(shared.ring.is_empty());
    }

    #[test]
    fn paused_device_still_applies_a_stop() {
        let shared = Shared::new(16);
        shared.paused.store(true, Ordering::Relaxed);
        shared.ring.push(&[3; 6]);
        shared.ring.request_clear();

        let mut out = vec![-1i16; 4];
        render(&shared, &mut out);
        assert_eq!(out, [0; 4]);
        assert!(shared.ring.is_empty());
    }
}
