//! Streaming music for game audio.
//!
//! A decoded file becomes a [`music::DecodedSong`] that an engine stream
//! pulls fixed-size PCM buffers from, looping seamlessly between loop points
//! when asked to.

pub mod config;
pub mod core;
pub mod error;
pub mod music;

pub use crate::core::decoder::{ChannelConfig, DecoderInfo, SoundDecoder, create_decoder};
pub use crate::core::output::CpalRenderer;
pub use crate::core::source::{MusicReader, Signature};
pub use crate::core::stream::{
    FillFn, ManualRenderer, ManualStreamHandle, SoundRenderer, SoundStream, StreamFormat,
};
pub use crate::error::{AudioError, Result};
pub use crate::music::{
    DecodedSong, LoopPoints, Music, MusicState, SongOptions, open_song, open_song_with,
};
