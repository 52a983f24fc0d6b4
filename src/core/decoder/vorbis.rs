use super::{DecoderInfo, PacketDecoder, PacketSource, checked_channels};
use crate::core::source::MusicReader;
use crate::error::{AudioError, Result};
use lewton::inside_ogg::OggStreamReader;
use log::{debug, warn};
use std::io::{Seek, SeekFrom};

// Page seeks land on the first page ending at or after the goal, so each
// retry aims further back until the landing is before the target.
const PAGE_SEEK_ATTEMPTS: usize = 6;
const PAGE_SEEK_BACKOFF: u64 = 4096;

pub(crate) struct VorbisSource {
    ogg: Option<OggStreamReader<MusicReader>>,
}

pub(crate) fn open(mut reader: MusicReader) -> Result<PacketDecoder<VorbisSource>> {
    let length = scan_length(&mut reader)?;
    reader.seek(SeekFrom::Start(0))?;
    let ogg = OggStreamReader::new(reader)
        .map_err(|e| AudioError::UnsupportedFormat(format!("Ogg Vorbis: {e}")))?;

    let channels = checked_channels(ogg.ident_hdr.audio_channels as usize, "Ogg Vorbis")?;
    let info = DecoderInfo {
        sample_rate: ogg.ident_hdr.audio_sample_rate,
        channels,
    };
    Ok(PacketDecoder::new(VorbisSource { ogg: Some(ogg) }, info, length))
}

/// Total frames, taken from the granule position of the last page.
///
/// A damaged tail (a partial download, say) ends the scan at the last page
/// that read cleanly.
fn scan_length(reader: &mut MusicReader) -> Result<u64> {
    let mut packets = ogg::PacketReader::new(&mut *reader);
    let mut last_granule = 0u64;
    loop {
        match packets.read_packet() {
            Ok(Some(packet)) => {
                let granule = packet.absgp_page();
                // All bits set marks a page on which no packet finishes.
                if granule != u64::MAX {
                    last_granule = last_granule.max(granule);
                }
            }
            Ok(None) => break,
            Err(e) if last_granule > 0 => {
                warn!("Ogg stream damaged after frame {last_granule}, playing up to there: {e}");
                break;
            }
            Err(e) => return Err(AudioError::UnsupportedFormat(format!("Ogg: {e}"))),
        }
    }
    Ok(last_granule)
}

/// Page-seeks to `goal`, then decodes until a finished page pins down the
/// position. Samples decoded on the way are dropped.
fn land_on_page(ogg: &mut OggStreamReader<MusicReader>, goal: u64) -> Result<Option<u64>> {
    ogg.seek_absgp_pg(goal)
        .map_err(|e| AudioError::Decode(format!("Ogg seek: {e}")))?;
    loop {
        if let Some(granule) = ogg.get_last_absgp() {
            return Ok(Some(granule));
        }
        match ogg.read_dec_packet_itl() {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(None),
            Err(e) => return Err(AudioError::Decode(format!("Ogg Vorbis: {e}"))),
        }
    }
}

fn closed() -> AudioError {
    AudioError::Decode("Ogg Vorbis stream is closed".to_string())
}

impl PacketSource for VorbisSource {
    fn next_packet(&mut self) -> Result<Option<Vec<i16>>> {
        let Some(ogg) = self.ogg.as_mut() else {
            return Ok(None);
        };
        ogg.read_dec_packet_itl()
            .map_err(|e| AudioError::Decode(format!("Ogg Vorbis: {e}")))
    }

    fn rewind(&mut self) -> Result<()> {
        let ogg = self.ogg.take().ok_or_else(closed)?;
        let mut reader = ogg.into_inner().into_inner();
        reader.seek(SeekFrom::Start(0))?;
        let ogg = OggStreamReader::new(reader)
            .map_err(|e| AudioError::Decode(format!("Ogg Vorbis reopen: {e}")))?;
        self.ogg = Some(ogg);
        Ok(())
    }

    fn seek_to(&mut self, frame: u64) -> Result<Option<u64>> {
        let mut back = 0;
        for _ in 0..PAGE_SEEK_ATTEMPTS {
            let goal = frame.saturating_sub(back);
            if goal == 0 {
                break;
            }
            let ogg = self.ogg.as_mut().ok_or_else(closed)?;
            if let Some(landed) = land_on_page(ogg, goal)?
                && landed <= frame
            {
                return Ok(Some(landed));
            }
            back = (back * 4).max(PAGE_SEEK_BACKOFF);
        }
        debug!("No Ogg page lands before frame {frame}; reopening.");
        self.rewind()?;
        Ok(Some(0))
    }
}

#[cfg(test)]
mod tests {
    use super::open;
    use crate::core::decoder::PacketSource;
    use crate::core::decoder::testing::{read_to_end, reader};
    use crate::core::decoder::{ChannelConfig, SoundDecoder};

    const SILENCE: &[u8] = include_bytes!("../../../testdata/silence.ogg");
    const SILENCE_FRAMES: u64 = 25_600;
    // Granule of the page before the last one.
    const SECOND_TO_LAST_GRANULE: u64 = 25_472;

    #[test]
    fn length_comes_from_last_granule() {
        let mut dec = open(reader(SILENCE)).unwrap();
        let info = dec.info();
        assert_eq!(info.sample_rate, 8000);
        assert_eq!(info.channels, ChannelConfig::Mono);
        assert_eq!(dec.sample_length(), SILENCE_FRAMES);

        let samples = read_to_end(&mut dec);
        assert_eq!(samples.len() as u64, SILENCE_FRAMES);
        assert!(samples.iter().all(|&s| s == 0));
        assert_eq!(dec.sample_offset(), SILENCE_FRAMES);
    }

    #[test]
    fn page_seek_lands_at_or_before_target() {
        let mut dec = open(reader(SILENCE)).unwrap();
        let landed = dec.source.seek_to(20_000).unwrap().unwrap();
        assert!(landed <= 20_000, "landed past the target at {landed}");
        assert!(landed > 0, "a mid-stream target should not reopen the file");
        assert_eq!(landed % 128, 0, "landings fall on packet boundaries");
    }

    #[test]
    fn backward_seek_then_read_matches_length() {
        let mut dec = open(reader(SILENCE)).unwrap();
        read_to_end(&mut dec);

        assert!(dec.seek(20_000));
        assert_eq!(dec.sample_offset(), 20_000);
        assert_eq!(read_to_end(&mut dec).len() as u64, SILENCE_FRAMES - 20_000);

        assert!(dec.seek(3_000));
        assert_eq!(read_to_end(&mut dec).len() as u64, SILENCE_FRAMES - 3_000);

        assert!(dec.seek(0), "seeking to the start reopens the stream");
        assert_eq!(read_to_end(&mut dec).len() as u64, SILENCE_FRAMES);
    }

    #[test]
    fn truncated_last_page_plays_complete_pages() {
        let cut = &SILENCE[..SILENCE.len() - 1];
        let mut dec = open(reader(cut)).expect("complete pages should still open");
        assert_eq!(dec.sample_length(), SECOND_TO_LAST_GRANULE);
        assert_eq!(read_to_end(&mut dec).len() as u64, SECOND_TO_LAST_GRANULE);
    }
}
