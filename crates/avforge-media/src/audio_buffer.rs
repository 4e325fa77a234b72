//! Sample-accurate audio rechunker (spec §4.4): coalesces variable-length
//! decoded/resampled audio frames into frames of a fixed sample count, as
//! required by codecs like AAC that demand an exact frame size.
//!
//! Grounded on the teacher's `AudioFifo` (`velocut-media::encode`), which
//! does the same job for a fixed stereo-FLTP case; this version generalizes
//! it to an arbitrary sample format, channel count, and frame size, and
//! tracks PTS progression explicitly rather than assuming it starts at zero.

use avforge_core::{Error, Rational as R, Result};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Sample;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;

pub struct AudioFrameBuffer {
    frame_size: usize,
    sample_format: Sample,
    sample_rate: u32,
    channel_layout: ChannelLayout,
    channel_count: u16,
    bytes_per_sample: usize,
    planar: bool,
    /// One Vec per plane (1 for interleaved formats, one per channel for planar).
    planes: Vec<Vec<u8>>,
    /// PTS, in `1/sample_rate`, of the first unconsumed sample.
    next_pts: i64,
    pts_initialized: bool,
}

impl AudioFrameBuffer {
    pub fn create(
        frame_size: usize,
        sample_format: Sample,
        sample_rate: u32,
        channel_layout: ChannelLayout,
        channel_count: u16,
    ) -> Result<Self> {
        if frame_size == 0 {
            return Err(Error::invalid_argument("AudioFrameBuffer frame_size must be > 0"));
        }
        let planar = sample_format.is_planar();
        let bytes_per_sample = sample_format.bytes();
        let num_planes = if planar { channel_count as usize } else { 1 };
        Ok(AudioFrameBuffer {
            frame_size,
            sample_format,
            sample_rate,
            channel_layout,
            channel_count,
            bytes_per_sample,
            planar,
            planes: vec![Vec::new(); num_planes.max(1)],
            next_pts: 0,
            pts_initialized: false,
        })
    }

    pub fn time_base(&self) -> R {
        R::new(1, self.sample_rate as i64)
    }

    /// Number of samples currently buffered (per channel).
    pub fn buffered_samples(&self) -> usize {
        if self.planes.is_empty() {
            0
        } else {
            self.planes[0].len() / self.bytes_per_sample.max(1)
        }
    }

    /// `push(frame)` (spec §4.4): copies samples into the accumulator and
    /// tracks the PTS of the first unconsumed sample.
    pub fn push(&mut self, frame: &AudioFrame) {
        if !self.pts_initialized {
            if let Some(pts) = frame.pts() {
                self.next_pts = pts;
            }
            self.pts_initialized = true;
        }

        let n = frame.samples();
        if n == 0 {
            return;
        }

        let channel_bytes = n * self.bytes_per_sample;
        if self.planar {
            for ch in 0..self.channel_count as usize {
                unsafe {
                    let data = frame.data(ch);
                    self.planes[ch].extend_from_slice(&data[..channel_bytes.min(data.len())]);
                }
            }
        } else {
            unsafe {
                let data = frame.data(0);
                let total = channel_bytes * self.channel_count as usize;
                self.planes[0].extend_from_slice(&data[..total.min(data.len())]);
            }
        }
    }

    /// `pull()` (spec §4.4): returns a frame of exactly `frame_size` samples,
    /// or `None` if insufficient data is buffered.
    pub fn pull(&mut self) -> Option<AudioFrame> {
        if self.buffered_samples() < self.frame_size {
            return None;
        }
        Some(self.pop_frame(self.frame_size))
    }

    /// `drain()` (spec §4.4): the final partial frame on flush, zero-padded
    /// to `frame_size`. Returns `None` if nothing remains buffered.
    pub fn drain(&mut self) -> Option<AudioFrame> {
        if self.buffered_samples() == 0 {
            return None;
        }
        Some(self.pop_frame(self.frame_size))
    }

    fn pop_frame(&mut self, n: usize) -> AudioFrame {
        let available = self.buffered_samples().min(n);
        let mask = self.channel_layout.into();

        let mut frame = AudioFrame::new(self.sample_format, n, mask);
        frame.set_rate(self.sample_rate);
        frame.set_pts(Some(self.next_pts));

        let channel_bytes = n * self.bytes_per_sample;
        let avail_bytes = available * self.bytes_per_sample;

        if self.planar {
            for ch in 0..self.channel_count as usize {
                unsafe {
                    let dst = frame.data_mut(ch);
                    dst[..avail_bytes].copy_from_slice(&self.planes[ch][..avail_bytes]);
                    if avail_bytes < channel_bytes {
                        dst[avail_bytes..channel_bytes].fill(0);
                    }
                }
                self.planes[ch].drain(..avail_bytes);
            }
        } else {
            let total_channel_bytes = channel_bytes * self.channel_count as usize;
            let total_avail_bytes = avail_bytes * self.channel_count as usize;
            unsafe {
                let dst = frame.data_mut(0);
                dst[..total_avail_bytes].copy_from_slice(&self.planes[0][..total_avail_bytes]);
                if total_avail_bytes < total_channel_bytes {
                    dst[total_avail_bytes..total_channel_bytes].fill(0);
                }
            }
            self.planes[0].drain(..total_avail_bytes);
        }

        self.next_pts += n as i64;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// P5: 1,000 frames of 1,024 samples at 48 kHz rechunked to frame_size
    /// 960 must conserve total samples and produce a constant PTS stride.
    #[test]
    fn rechunking_conserves_total_samples_and_pts_stride() {
        let mut buf = AudioFrameBuffer::create(
            960,
            Sample::F32(ffmpeg::format::sample::Type::Planar),
            48_000,
            ChannelLayout::STEREO,
            2,
        )
        .unwrap();

        let mut total_in = 0usize;
        for i in 0..1000 {
            let mut f = AudioFrame::new(
                Sample::F32(ffmpeg::format::sample::Type::Planar),
                1024,
                ChannelLayout::STEREO.into(),
            );
            f.set_rate(48_000);
            f.set_pts(Some(i * 1024));
            total_in += 1024;
            buf.push(&f);
        }

        let mut total_out = 0usize;
        let mut last_pts: Option<i64> = None;
        while let Some(out) = buf.pull() {
            assert_eq!(out.samples(), 960);
            if let Some(lp) = last_pts {
                assert_eq!(out.pts().unwrap() - lp, 960);
            }
            last_pts = out.pts();
            total_out += out.samples();
        }

        let remainder = buf.buffered_samples();
        if let Some(tail) = buf.drain() {
            assert_eq!(tail.samples(), 960);
            total_out += remainder;
        }

        assert_eq!(total_out, total_in);
        assert_eq!(total_in, 1_024_000);
    }
}
