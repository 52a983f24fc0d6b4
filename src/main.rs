use clap::Parser;
use log::{error, info};
use loopstream::config;
use loopstream::{
    CpalRenderer, LoopPoints, ManualRenderer, Music, MusicReader, SongOptions, open_song_with,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Plays a music file, optionally looping between two frame positions.
#[derive(Parser, Debug)]
#[command(name = "loopstream", version)]
struct Args {
    /// Ogg Vorbis, FLAC or MP3 file to play
    file: PathBuf,

    /// Loop instead of stopping at the end
    #[arg(long = "loop")]
    looping: bool,

    /// First frame of the loop region
    #[arg(long, default_value_t = 0)]
    loop_start: u64,

    /// Frame the loop jumps back from (defaults to the end of the track)
    #[arg(long)]
    loop_end: Option<u64>,

    /// Write the whole song as raw little-endian 16-bit PCM instead of playing it
    #[arg(long, value_name = "OUT")]
    render: Option<PathBuf>,

    /// Stop playback after this many seconds
    #[arg(long)]
    seconds: Option<u64>,
}

fn open_reader(path: &Path) -> Result<MusicReader, std::io::Error> {
    let file = File::open(path)?;
    Ok(Box::new(BufReader::new(file)))
}

fn render_to_file(
    args: &Args,
    options: SongOptions,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let renderer = ManualRenderer::new();
    let mut song = open_song_with(open_reader(&args.file)?, &renderer, options)?;
    let stream = renderer
        .last_stream()
        .ok_or("renderer did not create a stream")?;
    let format = stream.format();

    let mut writer = BufWriter::new(File::create(out)?);
    // Looping would never finish; render a single pass.
    song.play(false, 0);
    let mut frames = 0u64;
    while let Some(buf) = stream.pull() {
        for s in &buf {
            writer.write_all(&s.to_le_bytes())?;
        }
        frames += (buf.len() / format.channels as usize) as u64;
    }
    writer.flush()?;
    info!("Rendered {frames} frames to {}.", out.display());
    println!(
        "{} Hz, {} channel(s), {} frames written to {}",
        format.sample_rate,
        format.channels,
        frames,
        out.display()
    );
    Ok(())
}

fn play(args: &Args, options: SongOptions) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::get();
    let renderer = CpalRenderer::new()?;
    info!("Playing through '{}'.", renderer.device_name());
    let mut song = open_song_with(open_reader(&args.file)?, &renderer, options)?;

    song.play(args.looping, 0);
    if !song.is_playing() {
        return Err("stream refused to start".into());
    }

    let started = Instant::now();
    let interval = Duration::from_millis(cfg.stats_interval_ms);
    let limit = args.seconds.map(Duration::from_secs);
    while song.is_playing() {
        println!("{}", song.stats());
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        thread::sleep(interval);
    }
    song.stop();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install logger immediately, then set runtime max level from config after loading it.
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .try_init();
    // Startup default when config is missing or malformed.
    log::set_max_level(log::LevelFilter::Warn);

    let args = Args::parse();
    config::load();
    let cfg = config::get();
    log::set_max_level(cfg.log_level.as_level_filter());

    let options = SongOptions {
        loop_points: LoopPoints {
            start: args.loop_start,
            end: args.loop_end.unwrap_or(u64::MAX),
        },
        buffer_bytes: cfg.stream_buffer_bytes,
        volume: cfg.volume(),
    };

    let result = match &args.render {
        Some(out) => render_to_file(&args, options, out),
        None => play(&args, options),
    };
    if let Err(e) = &result {
        error!("{}: {e}", args.file.display());
    }
    result
}
