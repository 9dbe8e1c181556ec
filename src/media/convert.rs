//! Channel remapping and streaming sample-rate conversion

use rubato::{FftFixedIn, Resampler};

use super::PlaybackError;

const CHUNK_SIZE: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Remap interleaved PCM from `from` to `to` channels
///
/// Stereo to mono averages each pair, mono to stereo duplicates. Other
/// layouts average down to mono or copy the nearest source channel.
pub fn remap_channels(samples: Vec<i16>, from: u16, to: u16) -> Vec<i16> {
    let (from, to) = (usize::from(from.max(1)), usize::from(to.max(1)));
    if from == to {
        return samples;
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            out.push((sum / from as i32) as i16);
        } else {
            for ch in 0..to {
                out.push(frame[ch.min(from - 1)]);
            }
        }
    }
    out
}

/// Fixed-ratio resampler fed with arbitrarily sized interleaved blocks
pub struct StreamResampler {
    inner: FftFixedIn<f32>,
    from_rate: u32,
    channels: usize,
    pending: Vec<Vec<f32>>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Result<Self, PlaybackError> {
        let channels = usize::from(channels.max(1));
        let inner = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            CHUNK_SIZE,
            SUB_CHUNKS,
            channels,
        )
        .map_err(|e| PlaybackError::Resample(format!("init failed: {e}")))?;
        Ok(Self {
            inner,
            from_rate,
            channels,
            pending: vec![Vec::with_capacity(CHUNK_SIZE * 2); channels],
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Resample what can be resampled now; the remainder waits for more input
    pub fn process(&mut self, interleaved: &[i16]) -> Result<Vec<i16>, PlaybackError> {
        for frame in interleaved.chunks_exact(self.channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                self.pending[ch].push(f32::from(sample) / 32768.0);
            }
        }

        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let resampled = self
                .inner
                .process(chunk.as_slice(), None)
                .map_err(|e| PlaybackError::Resample(e.to_string()))?;
            interleave_into(&resampled, &mut out);
        }
        Ok(out)
    }

    /// Resample any buffered tail at end of stream
    pub fn flush(&mut self) -> Result<Vec<i16>, PlaybackError> {
        if self.pending[0].is_empty() {
            return Ok(Vec::new());
        }
        let resampled = self
            .inner
            .process_partial(Some(self.pending.as_slice()), None)
            .map_err(|e| PlaybackError::Resample(e.to_string()))?;
        for channel in &mut self.pending {
            channel.clear();
        }
        let mut out = Vec::new();
        interleave_into(&resampled, &mut out);
        Ok(out)
    }
}

fn interleave_into(channels: &[Vec<f32>], out: &mut Vec<i16>) {
    let frames = channels.first().map_or(0, Vec::len);
    out.reserve(frames * channels.len());
    for i in 0..frames {
        for channel in channels {
            let scaled = (channel[i] * 32768.0).clamp(-32768.0, 32767.0);
            out.push(scaled as i16);
        }
    }
}
