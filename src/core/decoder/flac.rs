use super::{DecoderInfo, PacketDecoder, PacketSource, checked_channels};
use crate::core::source::MusicReader;
use crate::error::{AudioError, Result};
use claxon::FlacReader;
use log::info;
use std::io::{Seek, SeekFrom};

pub(crate) struct FlacSource {
    flac: Option<FlacReader<MusicReader>>,
    bits_per_sample: u32,
    block: Vec<i32>,
}

pub(crate) fn open(reader: MusicReader) -> Result<PacketDecoder<FlacSource>> {
    let flac = FlacReader::new(reader)
        .map_err(|e| AudioError::UnsupportedFormat(format!("FLAC: {e}")))?;
    let streaminfo = flac.streaminfo();
    let channels = checked_channels(streaminfo.channels as usize, "FLAC")?;
    let info = DecoderInfo {
        sample_rate: streaminfo.sample_rate,
        channels,
    };

    let mut source = FlacSource {
        flac: Some(flac),
        bits_per_sample: streaminfo.bits_per_sample,
        block: Vec::new(),
    };
    let length = match streaminfo.samples {
        Some(frames) => frames,
        None => {
            info!("FLAC stream has no sample count; scanning.");
            let frames = count_frames(&mut source, channels.count())?;
            source.rewind()?;
            frames
        }
    };
    Ok(PacketDecoder::new(source, info, length))
}

fn count_frames(source: &mut FlacSource, channels: usize) -> Result<u64> {
    let mut frames = 0u64;
    while let Some(packet) = source.next_packet()? {
        frames += (packet.len() / channels) as u64;
    }
    Ok(frames)
}

#[inline]
fn to_i16(sample: i32, bits: u32) -> i16 {
    if bits > 16 {
        (sample >> (bits - 16)) as i16
    } else {
        (sample << (16 - bits)) as i16
    }
}

impl PacketSource for FlacSource {
    fn next_packet(&mut self) -> Result<Option<Vec<i16>>> {
        let Some(flac) = self.flac.as_mut() else {
            return Ok(None);
        };
        let buffer = std::mem::take(&mut self.block);
        let block = flac
            .blocks()
            .read_next_or_eof(buffer)
            .map_err(|e| AudioError::Decode(format!("FLAC: {e}")))?;
        let Some(block) = block else {
            return Ok(None);
        };

        let frames = block.duration();
        let channels = block.channels();
        let mut packet = Vec::with_capacity((frames * channels) as usize);
        for frame in 0..frames {
            for ch in 0..channels {
                packet.push(to_i16(block.sample(ch, frame), self.bits_per_sample));
            }
        }
        self.block = block.into_buffer();
        Ok(Some(packet))
    }

    fn rewind(&mut self) -> Result<()> {
        let Some(flac) = self.flac.take() else {
            return Err(AudioError::Decode("FLAC stream is closed".to_string()));
        };
        let mut reader = flac.into_inner();
        reader.seek(SeekFrom::Start(0))?;
        let flac =
            FlacReader::new(reader).map_err(|e| AudioError::Decode(format!("FLAC reopen: {e}")))?;
        self.flac = Some(flac);
        Ok(())
    }
}
