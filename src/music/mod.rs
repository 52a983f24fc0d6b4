//! Songs as the engine's music system sees them.

mod song;

pub use song::{DecodedSong, LoopPoints, SongOptions, open_song, open_song_with};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicState {
    Stopped,
    Playing,
    Paused,
}

/// A playable piece of music.
pub trait Music: Send {
    fn play(&mut self, looping: bool, subsong: i32);
    fn stop(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn is_playing(&self) -> bool;
    fn state(&self) -> MusicState;

    /// Switches to another track inside the same file, where the format has
    /// them.
    fn set_subsong(&mut self, subsong: i32) -> bool;

    fn set_position(&mut self, ms: u64) -> bool;

    /// One-line status for the engine's music stats display.
    fn stats(&self) -> String;
}
