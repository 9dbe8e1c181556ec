//! Compressed-audio decoding over a pulled byte stream

use std::io::Read;

use super::PlaybackError;

/// One decoded block of interleaved PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmBlock {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Bytes of one playback session
///
/// `Ok(0)` means the stream is over; readers that see transient empty
/// reads must wait them out instead of returning 0.
pub type StreamInput<'a> = Box<dyn Read + 'a>;

/// Pulls bytes from its input and yields PCM blocks
pub trait Decoder {
    /// Next decoded block, or `None` once the input is exhausted
    fn next_block(&mut self) -> Result<Option<PcmBlock>, PlaybackError>;
}

/// Creates one decoder per playback session, on the worker thread
pub trait DecoderFactory: Send + Sync {
    fn create<'a>(&self, input: StreamInput<'a>) -> Result<Box<dyn Decoder + 'a>, PlaybackError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Mp3DecoderFactory;

impl DecoderFactory for Mp3DecoderFactory {
    fn create<'a>(&self, input: StreamInput<'a>) -> Result<Box<dyn Decoder + 'a>, PlaybackError> {
        Ok(Box::new(Mp3Decoder::new(input)))
    }
}

/// MP3 decoder reading straight from the stream
///
/// `minimp3` refills its own frame buffer and only treats a short tail as
/// end of input once the reader returns 0.
pub struct Mp3Decoder<'a> {
    inner: minimp3::Decoder<StreamInput<'a>>,
}

impl<'a> Mp3Decoder<'a> {
    pub fn new(input: StreamInput<'a>) -> Self {
        Self {
            inner: minimp3::Decoder::new(input),
        }
    }
}

impl Decoder for Mp3Decoder<'_> {
    fn next_block(&mut self) -> Result<Option<PcmBlock>, PlaybackError> {
        loop {
            match self.inner.next_frame() {
                Ok(frame) if frame.data.is_empty() => continue,
                Ok(frame) => {
                    return Ok(Some(PcmBlock {
                        samples: frame.data,
                        sample_rate: u32::try_from(frame.sample_rate).unwrap_or(0),
                        channels: u16::try_from(frame.channels).unwrap_or(1),
                    }))
                }
                Err(minimp3::Error::Eof) => return Ok(None),
                Err(minimp3::Error::InsufficientData) | Err(minimp3::Error::SkippedData) => continue,
                Err(minimp3::Error::Io(e)) => return Err(PlaybackError::Read(e)),
            }
        }
    }
}
