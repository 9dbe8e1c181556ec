//! Streaming media pipeline: HTTP → decode → remap → resample → codec

mod cache;
mod convert;
mod decoder;
mod lyrics;
mod player;
mod progress;
mod source;

pub use cache::{AntiReplayGuard, CachedProgress, ProgressCache};
pub use convert::{remap_channels, StreamResampler};
pub use decoder::{Decoder, DecoderFactory, Mp3Decoder, Mp3DecoderFactory, PcmBlock, StreamInput};
pub use lyrics::{parse_lrc, parse_timestamp, LyricCursor, LyricLine, LyricView};
pub use player::{
    MusicPlayer, NowPlaying, PlayOutcome, PlayRequest, PlaybackError, PlayerConfig, SessionEnd,
    SessionOutcome,
};
pub use progress::{PlaybackProgress, ProgressSnapshot};
pub use source::{ChunkReader, HttpSource, StreamSource};
