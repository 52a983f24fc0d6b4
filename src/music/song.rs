use super::{Music, MusicState};
use crate::core::decoder::{DecoderInfo, SoundDecoder, create_decoder, frames_to_secs};
use crate::core::source::{MusicReader, Signature, sniff};
use crate::core::stream::{SoundRenderer, SoundStream, StreamFormat};
use crate::error::Result;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bytes of PCM pulled per fill when the caller does not say otherwise.
pub const DEFAULT_BUFFER_BYTES: usize = 32 * 1024;

/// Loop region in frames. `end` is exclusive and clamped to the track length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPoints {
    pub start: u64,
    pub end: u64,
}

impl Default for LoopPoints {
    fn default() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SongOptions {
    pub loop_points: LoopPoints,
    pub buffer_bytes: usize,
    pub volume: f32,
}

impl Default for SongOptions {
    fn default() -> Self {
        Self {
            loop_points: LoopPoints::default(),
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            volume: 1.0,
        }
    }
}

/// Opens `reader` as a song with default options.
pub fn open_song(reader: MusicReader, renderer: &dyn SoundRenderer) -> Result<DecodedSong> {
    open_song_with(reader, renderer, SongOptions::default())
}

pub fn open_song_with(
    mut reader: MusicReader,
    renderer: &dyn SoundRenderer,
    options: SongOptions,
) -> Result<DecodedSong> {
    let signature = sniff(&mut reader)?;
    if matches!(signature, Signature::Ogg | Signature::Flac) {
        // Loop tags inside the container are not read; loop points come from the caller.
        debug!(
            "{} container, using loop points {:?}.",
            signature.as_str(),
            options.loop_points
        );
    }
    let decoder = create_decoder(reader)?;
    DecodedSong::new(decoder, renderer, options)
}

/// Everything the fill callback touches, behind the song's lock.
struct SongCore {
    decoder: Box<dyn SoundDecoder>,
    channels: usize,
    looping: bool,
    loop_start: u64,
    loop_end: u64,
}

fn lock(core: &Mutex<SongCore>) -> MutexGuard<'_, SongCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A decoded file streamed to the engine.
pub struct DecodedSong {
    // Dropped first: the stream's callback holds the other reference to `core`.
    stream: Box<dyn SoundStream>,
    core: Arc<Mutex<SongCore>>,
    info: DecoderInfo,
    state: MusicState,
    volume: f32,
}

impl DecodedSong {
    pub fn new(
        decoder: Box<dyn SoundDecoder>,
        renderer: &dyn SoundRenderer,
        options: SongOptions,
    ) -> Result<Self> {
        let info = decoder.info();
        let length = decoder.sample_length();

        let loop_end = options.loop_points.end.min(length);
        let mut loop_start = options.loop_points.start;
        if loop_start >= loop_end {
            if loop_start != 0 {
                warn!("Loop start {loop_start} is not before loop end {loop_end}; looping from 0.");
            }
            loop_start = 0;
        }

        let core = Arc::new(Mutex::new(SongCore {
            decoder,
            channels: info.channels.count(),
            looping: false,
            loop_start,
            loop_end,
        }));

        let core_for_stream = core.clone();
        let format = StreamFormat {
            sample_rate: info.sample_rate,
            channels: info.channels.count() as u16,
        };
        let stream = renderer.create_stream(
            Box::new(move |buf: &mut [i16]| fill_buffer(&mut lock(&core_for_stream), buf)),
            options.buffer_bytes,
            format,
        )?;

        info!(
            "Song ready: {} Hz {}, {} frames, loop {}..{}.",
            info.sample_rate,
            info.channels.as_str(),
            length,
            loop_start,
            loop_end
        );
        Ok(Self {
            stream,
            core,
            info,
            state: MusicState::Stopped,
            volume: options.volume,
        })
    }

    pub fn info(&self) -> DecoderInfo {
        self.info
    }

    pub fn loop_points(&self) -> LoopPoints {
        let core = lock(&self.core);
        LoopPoints {
            start: core.loop_start,
            end: core.loop_end,
        }
    }

    pub fn position_frames(&self) -> u64 {
        lock(&self.core).decoder.sample_offset()
    }

    pub fn length_frames(&self) -> u64 {
        lock(&self.core).decoder.sample_length()
    }
}

impl Music for DecodedSong {
    fn play(&mut self, looping: bool, _subsong: i32) {
        self.state = MusicState::Stopped;
        lock(&self.core).looping = looping;
        if self.stream.play(looping, self.volume) {
            self.state = MusicState::Playing;
        }
    }

    fn stop(&mut self) {
        self.stream.stop();
        self.state = MusicState::Stopped;
    }

    fn pause(&mut self) {
        if self.state == MusicState::Playing && self.stream.set_paused(true) {
            self.state = MusicState::Paused;
        }
    }

    fn resume(&mut self) {
        if self.state == MusicState::Paused && self.stream.set_paused(false) {
            self.state = MusicState::Playing;
        }
    }

    fn is_playing(&self) -> bool {
        self.state != MusicState::Stopped && !self.stream.is_ended()
    }

    fn state(&self) -> MusicState {
        self.state
    }

    fn set_subsong(&mut self, _subsong: i32) -> bool {
        false
    }

    fn set_position(&mut self, ms: u64) -> bool {
        lock(&self.core).decoder.seek_ms(ms)
    }

    fn stats(&self) -> String {
        let offset = lock(&self.core).decoder.sample_offset();
        let time = frames_to_secs(offset, self.info.sample_rate);
        format!(
            "Track: {}, {}Hz  Time:{:02}:{:02}",
            self.info.channels.as_str(),
            self.info.sample_rate,
            time / 60,
            time % 60
        )
    }
}

impl Drop for DecodedSong {
    fn drop(&mut self) {
        self.stream.stop();
    }
}

/* ============================== Buffer fill ============================== */

/// Fills one stream buffer. Returns `false` once the song has nothing more
/// to give or the decoder came up short.
fn fill_buffer(core: &mut SongCore, buf: &mut [i16]) -> bool {
    let usable = buf.len() - buf.len() % core.channels;
    let (frames, tail) = buf.split_at_mut(usable);
    tail.fill(0);
    if core.looping {
        fill_looping(core, frames)
    } else {
        fill_once(core, frames)
    }
}

fn fill_once(core: &mut SongCore, buf: &mut [i16]) -> bool {
    let channels = core.channels;
    let pos = core.decoder.sample_offset();
    let max = core.decoder.sample_length();
    if pos >= max {
        buf.fill(0);
        return false;
    }

    let frames = (buf.len() / channels) as u64;
    let want = if pos + frames > max {
        (max - pos) as usize * channels
    } else {
        buf.len()
    };
    let got = core.decoder.read(&mut buf[..want]);
    buf[got..].fill(0);
    // The last partial buffer still plays; the next call reports the end.
    got == want
}

fn fill_looping(core: &mut SongCore, buf: &mut [i16]) -> bool {
    let channels = core.channels;
    if core.loop_end <= core.loop_start {
        buf.fill(0);
        return false;
    }

    let mut filled = 0;
    let mut ok = true;
    while filled < buf.len() {
        let pos = core.decoder.sample_offset();
        let remaining = ((buf.len() - filled) / channels) as u64;
        let to_loop_end = core.loop_end.saturating_sub(pos);

        if remaining > to_loop_end {
            let want = to_loop_end as usize * channels;
            let got = core.decoder.read(&mut buf[filled..filled + want]);
            filled += got;
            if got != want {
                ok = false;
                if got == 0 && want > 0 {
                    break;
                }
            }
            if !core.decoder.seek(core.loop_start) {
                ok = false;
                break;
            }
        } else {
            let want = buf.len() - filled;
            let got = core.decoder.read(&mut buf[filled..]);
            filled += got;
            if got != want {
                ok = false;
                break;
            }
        }
    }
    buf[filled..].fill(0);
    ok
}

#[cfg(test)]
mod tests {
    use super::{DecodedSong, LoopPoints, SongCore, SongOptions, fill_buffer, open_song};
    use crate::core::decoder::SoundDecoder;
    use crate::core::decoder::testing::{counters, failing_ramp, paged_ramp, ramp};
    use crate::core::stream::ManualRenderer;
    use crate::error::AudioError;
    use crate::music::{Music, MusicState};
    use std::io::Cursor;

    fn song_core(
        decoder: Box<dyn SoundDecoder>,
        looping: bool,
        start: u64,
        end: u64,
    ) -> SongCore {
        let channels = decoder.info().channels.count();
        SongCore {
            decoder,
            channels,
            looping,
            loop_start: start,
            loop_end: end,
        }
    }

    fn options(buffer_bytes: usize, loop_points: LoopPoints) -> SongOptions {
        SongOptions {
            loop_points,
            buffer_bytes,
            volume: 1.0,
        }
    }

    #[test]
    fn once_pads_final_buffer_then_ends() {
        let mut core = song_core(Box::new(ramp(2, 10, 4)), false, 0, 10);
        let mut buf = vec![-1i16; 8];

        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [0, 0, 1, 1, 2, 2, 3, 3]);
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [4, 4, 5, 5, 6, 6, 7, 7]);

        assert!(
            fill_buffer(&mut core, &mut buf),
            "the partial last buffer is still a successful fill"
        );
        assert_eq!(buf, [8, 8, 9, 9, 0, 0, 0, 0]);

        buf.fill(-1);
        assert!(!fill_buffer(&mut core, &mut buf), "at the end the fill reports done");
        assert_eq!(buf, [0; 8], "the end buffer is silence");
    }

    #[test]
    fn once_exact_multiple_ends_on_following_call() {
        let mut core = song_core(Box::new(ramp(1, 8, 3)), false, 0, 8);
        let mut buf = vec![0i16; 4];
        assert!(fill_buffer(&mut core, &mut buf));
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [4, 5, 6, 7]);
        assert!(!fill_buffer(&mut core, &mut buf));
    }

    #[test]
    fn once_short_read_zero_fills_and_ends() {
        let mut core = song_core(Box::new(failing_ramp(1, 100, 32)), false, 0, 100);
        let mut buf = vec![-1i16; 20];
        assert!(fill_buffer(&mut core, &mut buf));
        assert!(!fill_buffer(&mut core, &mut buf), "decoder error must end the stream");
        assert_eq!(buf[11], 31);
        assert!(buf[12..].iter().all(|&s| s == 0));
    }

    #[test]
    fn looping_wraps_at_loop_end() {
        let mut core = song_core(Box::new(ramp(1, 10, 3)), true, 2, 6);
        let mut buf = vec![0i16; 5];

        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [0, 1, 2, 3, 4]);
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [5, 2, 3, 4, 5]);
        assert!(fill_buffer(&mut core, &mut buf), "short loops wrap more than once per buffer");
        assert_eq!(buf, [2, 3, 4, 5, 2]);
        assert_eq!(core.decoder.sample_offset(), 3);
    }

    #[test]
    fn late_loop_start_does_not_reopen_the_stream() {
        let decoder = paged_ramp(1, 120_000, 256, 4096);
        let work = counters(&decoder);
        let mut core = song_core(Box::new(decoder), true, 90_000, 100_000);
        assert!(core.decoder.seek(95_000));

        let mut buf = vec![0i16; 10_000];
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf[4_999], 99_999u64 as i16);
        assert_eq!(buf[5_000], 90_000u64 as i16);
        assert_eq!(core.decoder.sample_offset(), 95_000);
        assert_eq!(work.rewinds.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(work.page_seeks.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[test]
    fn looping_whole_track_is_seamless() {
        let mut core = song_core(Box::new(ramp(2, 6, 4)), true, 0, 6);
        let mut buf = vec![0i16; 8];
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [0, 0, 1, 1, 2, 2, 3, 3]);
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [4, 4, 5, 5, 0, 0, 1, 1]);
    }

    #[test]
    fn looping_past_loop_end_jumps_back() {
        let mut core = song_core(Box::new(ramp(1, 20, 8)), true, 4, 8);
        assert!(core.decoder.seek(12));
        let mut buf = vec![0i16; 3];
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [4, 5, 6]);
    }

    #[test]
    fn looping_with_empty_region_is_silent() {
        let mut core = song_core(Box::new(ramp(1, 0, 8)), true, 0, 0);
        let mut buf = vec![7i16; 4];
        assert!(!fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn looping_decoder_error_does_not_spin() {
        let mut core = song_core(Box::new(failing_ramp(1, 100, 16)), true, 0, 100);
        let mut buf = vec![-1i16; 40];
        assert!(!fill_buffer(&mut core, &mut buf));
        assert_eq!(buf[15], 15);
        assert!(buf[16..].iter().all(|&s| s == 0));
    }

    #[test]
    fn odd_buffer_tail_is_silenced() {
        let mut core = song_core(Box::new(ramp(2, 10, 4)), false, 0, 10);
        let mut buf = vec![-1i16; 5];
        assert!(fill_buffer(&mut core, &mut buf));
        assert_eq!(buf, [0, 0, 1, 1, 0]);
        assert_eq!(core.decoder.sample_offset(), 2);
    }

    #[test]
    fn loop_points_are_clamped_to_track() {
        let renderer = ManualRenderer::new();
        let song = DecodedSong::new(
            Box::new(ramp(2, 500, 64)),
            &renderer,
            options(1024, LoopPoints::default()),
        )
        .unwrap();
        assert_eq!(song.loop_points(), LoopPoints { start: 0, end: 500 });

        let song = DecodedSong::new(
            Box::new(ramp(2, 500, 64)),
            &renderer,
            options(1024, LoopPoints { start: 600, end: 900 }),
        )
        .unwrap();
        assert_eq!(
            song.loop_points(),
            LoopPoints { start: 0, end: 500 },
            "a start beyond the end falls back to the track start"
        );
    }

    #[test]
    fn song_streams_through_renderer() {
        let renderer = ManualRenderer::new();
        let mut song = DecodedSong::new(
            Box::new(ramp(1, 6, 4)),
            &renderer,
            options(8, LoopPoints::default()),
        )
        .unwrap();
        let stream = renderer.last_stream().unwrap();
        assert!(stream.format().is_mono());
        assert_eq!(stream.format().sample_rate, 1000);
        assert_eq!(stream.buffer_samples(), 4);
        assert_eq!(song.state(), MusicState::Stopped);
        assert!(stream.pull().is_none());

        song.play(false, 0);
        assert_eq!(song.state(), MusicState::Playing);
        assert!(song.is_playing());
        assert_eq!(stream.pull().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(stream.pull().unwrap(), vec![4, 5, 0, 0]);
        assert_eq!(stream.pull().unwrap(), vec![0, 0, 0, 0]);
        assert!(!song.is_playing(), "an ended stream is no longer playing");
        assert_eq!(song.position_frames(), 6);
    }

    #[test]
    fn looping_song_keeps_streaming() {
        let renderer = ManualRenderer::new();
        let mut song = DecodedSong::new(
            Box::new(ramp(1, 6, 4)),
            &renderer,
            options(8, LoopPoints { start: 2, end: 5 }),
        )
        .unwrap();
        let stream = renderer.last_stream().unwrap();
        song.play(true, 0);
        assert_eq!(stream.pull().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(stream.pull().unwrap(), vec![4, 2, 3, 4]);
        assert_eq!(stream.pull().unwrap(), vec![2, 3, 4, 2]);
        assert!(song.is_playing());
    }

    #[test]
    fn transport_controls_track_state() {
        let renderer = ManualRenderer::new();
        let mut song = DecodedSong::new(
            Box::new(ramp(2, 100, 16)),
            &renderer,
            options(64, LoopPoints::default()),
        )
        .unwrap();
        let stream = renderer.last_stream().unwrap();

        song.pause();
        assert_eq!(song.state(), MusicState::Stopped, "pausing a stopped song does nothing");

        song.play(true, 0);
        song.pause();
        assert_eq!(song.state(), MusicState::Paused);
        assert!(song.is_playing(), "paused songs still count as playing");
        assert!(stream.pull().is_none());

        song.resume();
        assert_eq!(song.state(), MusicState::Playing);
        assert!(stream.pull().is_some());

        assert!(!song.set_subsong(1));

        song.stop();
        assert_eq!(song.state(), MusicState::Stopped);
        assert!(!song.is_playing());
        assert!(stream.pull().is_none());
    }

    #[test]
    fn stats_report_format_and_time() {
        let renderer = ManualRenderer::new();
        let mut song = DecodedSong::new(
            Box::new(ramp(2, 70_000, 4096)),
            &renderer,
            SongOptions::default(),
        )
        .unwrap();
        assert_eq!(song.stats(), "Track: Stereo, 1000Hz  Time:00:00");
        assert!(song.set_position(65_000));
        assert_eq!(song.position_frames(), 65_000);
        assert_eq!(song.stats(), "Track: Stereo, 1000Hz  Time:01:05");
    }

    #[test]
    fn open_song_rejects_unknown_data() {
        let renderer = ManualRenderer::new();
        let reader = Box::new(Cursor::new(vec![0u8; 256]));
        assert!(matches!(
            open_song(reader, &renderer),
            Err(AudioError::UnsupportedFormat(_))
        ));
        assert!(renderer.last_stream().is_none(), "no stream is created for a failed open");
    }

    #[test]
    fn too_small_buffer_is_rejected() {
        let renderer = ManualRenderer::new();
        let result = DecodedSong::new(
            Box::new(ramp(2, 10, 4)),
            &renderer,
            options(2, LoopPoints::default()),
        );
        assert!(matches!(result, Err(AudioError::Stream(_))));
    }
}
