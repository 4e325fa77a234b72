//! A media-kind-tagged frame wrapping the native library's video/audio frame
//! types (spec §3 Frame). Decoder emits these; Encoder and AudioFrameBuffer
//! consume them.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::frame::{audio::Audio, video::Video};

/// Either a decoded video frame or a decoded audio frame.
///
/// The native library represents both as an `AVFrame`, but `ffmpeg-the-third`
/// splits them into distinct Rust types at the decoder boundary — this enum
/// is the minimal carrier needed to pass either kind through one channel.
pub enum Frame {
    Video(Video),
    Audio(Audio),
}

impl Frame {
    pub fn pts(&self) -> Option<i64> {
        match self {
            Frame::Video(f) => f.pts(),
            Frame::Audio(f) => f.pts(),
        }
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        match self {
            Frame::Video(f) => f.set_pts(pts),
            Frame::Audio(f) => f.set_pts(pts),
        }
    }

    pub fn time_base(&self) -> ffmpeg::Rational {
        match self {
            Frame::Video(f) => unsafe { (*f.as_ptr()).time_base.into() },
            Frame::Audio(f) => unsafe { (*f.as_ptr()).time_base.into() },
        }
    }

    pub fn set_time_base(&mut self, tb: ffmpeg::Rational) {
        let ptr_tb: ffmpeg::ffi::AVRational = tb.into();
        match self {
            Frame::Video(f) => unsafe { (*f.as_mut_ptr()).time_base = ptr_tb },
            Frame::Audio(f) => unsafe { (*f.as_mut_ptr()).time_base = ptr_tb },
        }
    }

    pub fn duration(&self) -> i64 {
        match self {
            Frame::Video(f) => unsafe { (*f.as_ptr()).duration },
            Frame::Audio(f) => unsafe { (*f.as_ptr()).duration },
        }
    }

    pub fn set_duration(&mut self, duration: i64) {
        match self {
            Frame::Video(f) => unsafe { (*f.as_mut_ptr()).duration = duration },
            Frame::Audio(f) => unsafe { (*f.as_mut_ptr()).duration = duration },
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Frame::Video(_))
    }

    pub fn as_video(&self) -> Option<&Video> {
        match self {
            Frame::Video(f) => Some(f),
            Frame::Audio(_) => None,
        }
    }

    pub fn as_video_mut(&mut self) -> Option<&mut Video> {
        match self {
            Frame::Video(f) => Some(f),
            Frame::Audio(_) => None,
        }
    }

    pub fn as_audio(&self) -> Option<&Audio> {
        match self {
            Frame::Audio(f) => Some(f),
            Frame::Video(_) => None,
        }
    }

    pub fn as_audio_mut(&mut self) -> Option<&mut Audio> {
        match self {
            Frame::Audio(f) => Some(f),
            Frame::Video(_) => None,
        }
    }
}

impl From<Video> for Frame {
    fn from(f: Video) -> Self {
        Frame::Video(f)
    }
}

impl From<Audio> for Frame {
    fn from(f: Audio) -> Self {
        Frame::Audio(f)
    }
}
