//! Byte sources for streamed playback

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use tracing::debug;

use super::PlaybackError;

/// Incremental reader over an open stream
pub trait ChunkReader: Send {
    /// Read up to `buf.len()` bytes
    ///
    /// `Ok(0)` means nothing arrived this time. It does not by itself mean
    /// the stream is over; the caller decides when enough empty reads in a
    /// row amount to end of stream.
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Where playback bytes and lyric files come from
pub trait StreamSource: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn ChunkReader>, PlaybackError>;
    fn fetch_text(&self, url: &str) -> Result<String, PlaybackError>;
}

/// Blocking HTTP source
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(connect_timeout: Duration) -> Result<Self, PlaybackError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            // Streams run for the length of the track
            .timeout(None)
            .build()
            .map_err(|e| PlaybackError::Connect(e.to_string()))?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<Response, PlaybackError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| PlaybackError::Connect(e.to_string()))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(PlaybackError::HttpStatus(status.as_u16()));
        }
        Ok(response)
    }
}

impl StreamSource for HttpSource {
    fn open(&self, url: &str) -> Result<Box<dyn ChunkReader>, PlaybackError> {
        let response = self.get(url)?;
        debug!(url, length = ?response.content_length(), "stream opened");
        Ok(Box::new(HttpChunkReader { response }))
    }

    fn fetch_text(&self, url: &str) -> Result<String, PlaybackError> {
        self.get(url)?
            .text()
            .map_err(|e| PlaybackError::Connect(e.to_string()))
    }
}

struct HttpChunkReader {
    response: Response,
}

impl ChunkReader for HttpChunkReader {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.response.read(buf)
    }
}
