use super::{DecoderInfo, PacketDecoder, PacketSource, checked_channels};
use crate::core::source::MusicReader;
use crate::error::{AudioError, Result};
use log::warn;
use minimp3::{Decoder, Error as Mp3Error, Frame};
use std::io::{Seek, SeekFrom};

pub(crate) struct Mp3Source {
    mp3: Option<Decoder<MusicReader>>,
    info: DecoderInfo,
}

fn next_frame(mp3: &mut Decoder<MusicReader>) -> Result<Option<Frame>> {
    loop {
        match mp3.next_frame() {
            Ok(frame) => return Ok(Some(frame)),
            Err(Mp3Error::SkippedData) => continue,
            Err(Mp3Error::Eof) | Err(Mp3Error::InsufficientData) => return Ok(None),
            Err(Mp3Error::Io(e)) => return Err(AudioError::Io(e)),
            #[allow(unreachable_patterns)]
            Err(e) => return Err(AudioError::Decode(format!("MP3: {e:?}"))),
        }
    }
}

/// MP3 carries no reliable length, so the whole file is decoded once to
/// count frames before playback starts.
pub(crate) fn open(reader: MusicReader) -> Result<PacketDecoder<Mp3Source>> {
    let mut mp3 = Decoder::new(reader);
    let Some(first) = next_frame(&mut mp3)? else {
        return Err(AudioError::UnsupportedFormat(
            "no MPEG audio frames found".to_string(),
        ));
    };
    let channels = checked_channels(first.channels, "MP3")?;
    let info = DecoderInfo {
        sample_rate: first.sample_rate.max(0) as u32,
        channels,
    };

    let mut source = Mp3Source {
        mp3: Some(mp3),
        info,
    };
    let mut length = (first.data.len() / channels.count()) as u64;
    while let Some(packet) = source.next_packet()? {
        length += (packet.len() / channels.count()) as u64;
    }
    source.rewind()?;
    Ok(PacketDecoder::new(source, info, length))
}

impl PacketSource for Mp3Source {
    fn next_packet(&mut self) -> Result<Option<Vec<i16>>> {
        let Some(mp3) = self.mp3.as_mut() else {
            return Ok(None);
        };
        let Some(frame) = next_frame(mp3)? else {
            return Ok(None);
        };
        if frame.sample_rate.max(0) as u32 != self.info.sample_rate
            || frame.channels != self.info.channels.count()
        {
            warn!(
                "MP3 format changed mid-stream ({} Hz, {} ch); ending stream.",
                frame.sample_rate, frame.channels
            );
            return Ok(None);
        }
        Ok(Some(frame.data))
    }

    fn rewind(&mut self) -> Result<()> {
        let Some(mp3) = self.mp3.take() else {
            return Err(AudioError::Decode("MP3 stream is closed".to_string()));
        };
        let mut reader = mp3.into_inner();
        reader.seek(SeekFrom::Start(0))?;
        self.mp3 = Some(Decoder::new(reader));
        Ok(())
    }
}
