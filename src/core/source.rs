use std::io::{self, Read, Seek, SeekFrom};

/// Anything a song can be streamed from.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// An opened music file. Ownership passes to the decoder, and through it to
/// the song, once a song is created.
pub type MusicReader = Box<dyn ReadSeek + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Ogg,
    Flac,
    Mp3,
    Unknown,
}

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            [b'O', b'g', b'g', b'S', ..] => Self::Ogg,
            [b'f', b'L', b'a', b'C', ..] => Self::Flac,
            [b'I', b'D', b'3', ..] => Self::Mp3,
            // MPEG audio frame sync: 11 set bits
            [0xFF, b, ..] if b & 0xE0 == 0xE0 => Self::Mp3,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ogg => "Ogg",
            Self::Flac => "FLAC",
            Self::Mp3 => "MP3",
            Self::Unknown => "unknown",
        }
    }
}

/// Reads the first four bytes of `reader` and rewinds it to the start.
pub fn sniff<R: Read + Seek + ?Sized>(reader: &mut R) -> io::Result<Signature> {
    reader.seek(SeekFrom::Start(0))?;
    let mut head = [0u8; 4];
    let mut got = 0;
    while got < head.len() {
        match reader.read(&mut head[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    reader.seek(SeekFrom::Start(0))?;
    Ok(Signature::from_bytes(&head[..got]))
}
